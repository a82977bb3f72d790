//! The interface to whoever consumes results as they are produced.

use std::{io, path::Path};

use async_trait::async_trait;
use thiserror::Error;

use crate::result::TestResult;

#[derive(Debug, Error)]
pub enum ReportError {
    /// The client wants the run to stop. Not a failure of the run.
    #[error("termination requested")]
    Terminate,
    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait ReportClient: Send + Sync {
    /// Reports a finished test.
    async fn report_result(&self, result: &TestResult) -> Result<(), ReportError>;

    /// A sink for the log of the entity `name`, stored at `rel_path` in the results
    /// directory.
    fn new_test_log_writer(&self, name: &str, rel_path: &Path) -> Box<dyn io::Write + Send>;
}

/// Accepts results and discards logs.
#[derive(Debug, Default)]
pub struct NoopReportClient;

#[async_trait]
impl ReportClient for NoopReportClient {
    async fn report_result(&self, _result: &TestResult) -> Result<(), ReportError> {
        Ok(())
    }

    fn new_test_log_writer(&self, _name: &str, _rel_path: &Path) -> Box<dyn io::Write + Send> {
        Box::new(io::sink())
    }
}
