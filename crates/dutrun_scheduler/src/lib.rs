//! Runs a test plan on a DUT: categorizes tests by the remote fixture they depend on,
//! sets those fixtures up through a fixture service, and invokes the test runner on the
//! DUT once per group, retrying tests that a crashed invocation never started.

pub mod config;
pub mod connection;
pub mod diagnose;
mod error;
pub mod fixture_service;
pub mod fixtures;
pub mod launcher;
pub mod outputs;
mod run;

pub use config::RunConfig;
pub use connection::{ConnectionManager, FixedConnection, SshConnectionManager};
pub use error::SchedulerError;
pub use fixtures::{BundleTests, CategorizeError, FixtureGraph, FixtureGroup};
pub use run::{RunOutcome, Scheduler};
