use std::fmt;

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

use crate::{entity::Entity, timing::TimingLog};

/// An error raised by a test, a fixture, or a whole run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorInfo {
    pub reason: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub stack: String,
}

impl ErrorInfo {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            ..Default::default()
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.file.is_empty() {
            write!(f, "{}", self.reason)
        } else {
            write!(f, "{}:{}: {}", self.file, self.line, self.reason)
        }
    }
}

/// One event in the stream a test runner emits while executing a batch of tests.
///
/// A well-formed stream is `RunStart`, then any interleaving of entity lifecycles and run
/// logs, then `RunEnd`. The codec does not enforce ordering; consumers do.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    RunStart {
        time: DateTime<Utc>,
        /// Names of the tests the runner is about to run.
        #[serde(default)]
        test_names: Vec<String>,
        /// Legacy runners only send a count.
        #[serde(default)]
        num_tests: usize,
    },
    RunLog {
        time: DateTime<Utc>,
        text: String,
    },
    /// A failure of the run as a whole. Nothing after it is processed.
    RunError {
        time: DateTime<Utc>,
        error: ErrorInfo,
    },
    EntityStart {
        time: DateTime<Utc>,
        info: Entity,
        /// Directory on the DUT where the entity writes its output files.
        #[serde(default)]
        out_dir: String,
    },
    EntityLog {
        time: DateTime<Utc>,
        name: String,
        text: String,
    },
    EntityError {
        time: DateTime<Utc>,
        name: String,
        error: ErrorInfo,
    },
    EntityEnd {
        time: DateTime<Utc>,
        name: String,
        #[serde(default)]
        skip_reasons: Vec<String>,
        #[serde(default)]
        deprecated_missing_software_deps: Vec<String>,
        #[serde(default)]
        timing_log: Option<TimingLog>,
    },
    RunEnd {
        time: DateTime<Utc>,
    },
    /// Sent periodically so that a quiet runner is not mistaken for a lost one.
    Heartbeat {
        time: DateTime<Utc>,
    },
}

impl ControlMessage {
    pub fn time(&self) -> DateTime<Utc> {
        use ControlMessage::*;
        match self {
            RunStart { time, .. }
            | RunLog { time, .. }
            | RunError { time, .. }
            | EntityStart { time, .. }
            | EntityLog { time, .. }
            | EntityError { time, .. }
            | EntityEnd { time, .. }
            | RunEnd { time }
            | Heartbeat { time } => *time,
        }
    }

    pub fn kind(&self) -> &'static str {
        use ControlMessage::*;
        match self {
            RunStart { .. } => "RunStart",
            RunLog { .. } => "RunLog",
            RunError { .. } => "RunError",
            EntityStart { .. } => "EntityStart",
            EntityLog { .. } => "EntityLog",
            EntityError { .. } => "EntityError",
            EntityEnd { .. } => "EntityEnd",
            RunEnd { .. } => "RunEnd",
            Heartbeat { .. } => "Heartbeat",
        }
    }
}

/// Formats a timestamp the way log lines carry it.
pub fn format_log_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

#[cfg(test)]
mod test {
    use chrono::{TimeZone, Utc};
    use indoc::indoc;

    use super::{format_log_time, ControlMessage, ErrorInfo};

    #[test]
    fn legacy_run_start_only_has_a_count() {
        let msg: ControlMessage = serde_json::from_str(indoc! {r#"
            {"type": "run_start", "time": "2023-04-01T10:00:00Z", "num_tests": 3}
        "#})
        .unwrap();

        match msg {
            ControlMessage::RunStart {
                test_names,
                num_tests,
                ..
            } => {
                assert!(test_names.is_empty());
                assert_eq!(num_tests, 3);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn entity_end_defaults_optional_fields() {
        let msg: ControlMessage = serde_json::from_str(
            r#"{"type": "entity_end", "time": "2023-04-01T10:00:00Z", "name": "pkg.Test"}"#,
        )
        .unwrap();

        assert_eq!(msg.kind(), "EntityEnd");
        match msg {
            ControlMessage::EntityEnd {
                skip_reasons,
                timing_log,
                ..
            } => {
                assert!(skip_reasons.is_empty());
                assert!(timing_log.is_none());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn tags_are_snake_case() {
        let time = Utc.with_ymd_and_hms(2023, 4, 1, 10, 0, 0).unwrap();
        let json = serde_json::to_value(ControlMessage::RunError {
            time,
            error: ErrorInfo::new("boom"),
        })
        .unwrap();
        assert_eq!(json["type"], "run_error");
        assert_eq!(json["error"]["reason"], "boom");
    }

    #[test]
    fn error_display_includes_location_when_known() {
        let mut error = ErrorInfo::new("boom");
        assert_eq!(error.to_string(), "boom");
        error.file = "checks.rs".to_string();
        error.line = 12;
        assert_eq!(error.to_string(), "checks.rs:12: boom");
    }

    #[test]
    fn log_time_has_microseconds() {
        let time = Utc.with_ymd_and_hms(2023, 4, 1, 10, 0, 0).unwrap();
        assert_eq!(format_log_time(time), "2023-04-01T10:00:00.000000Z");
    }
}
