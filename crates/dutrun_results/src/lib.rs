//! Turns the control message stream of a test runner into [TestResult]s.
//!
//! [read_test_output] drives one runner invocation. State that outlives an invocation,
//! like the streamed results file and the failure count, lives in a [RunState] that the
//! caller threads through every invocation of a run.

mod driver;
mod error;
mod puller;
mod reducer;
pub mod report;
pub mod result;
pub mod streamed;

pub use driver::{read_test_output, Diagnoser, ReadOutcome, ResultsContext, RunState};
pub use error::{ResultsError, TerminateReason};
pub use puller::{CopyAndRemove, OutputPuller};
pub use report::{NoopReportClient, ReportClient, ReportError};
pub use result::{ResultError, TestResult};
