use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dutrun_protocol::{Entity, ErrorInfo};
use serde_derive::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResultError {
    pub time: DateTime<Utc>,
    #[serde(flatten)]
    pub error: ErrorInfo,
}

/// The outcome of one test.
///
/// A result is created as soon as its test starts. Until `end` is set it describes a test
/// that is still running, or that never finished.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TestResult {
    pub test: Entity,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub errors: Vec<ResultError>,
    #[serde(default)]
    pub skip_reason: String,
    pub out_dir: PathBuf,
}

impl TestResult {
    pub fn started(test: Entity, start: DateTime<Utc>, out_dir: PathBuf) -> Self {
        Self {
            test,
            start,
            end: None,
            errors: vec![],
            skip_reason: String::new(),
            out_dir,
        }
    }

    pub fn name(&self) -> &str {
        &self.test.name
    }

    pub fn is_complete(&self) -> bool {
        self.end.is_some()
    }

    pub fn failed(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn skipped(&self) -> bool {
        !self.skip_reason.is_empty() && self.errors.is_empty()
    }

    pub fn passed(&self) -> bool {
        self.is_complete() && !self.failed() && !self.skipped()
    }
}
