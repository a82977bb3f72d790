//! Messages exchanged with the fixture service, which sets up and tears down remote fixtures
//! on the orchestrator's side while local tests run on the DUT.
//!
//! Fixtures form a stack: a push sets one up on top of whatever is active, a pop tears down
//! the most recently pushed one. Each request is answered by any number of `Log`/`Error`
//! responses followed by exactly one `RequestDone`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

use crate::message::ErrorInfo;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct FixtureConfig {
    /// Directory on the orchestrator's host for the fixture's output files.
    pub out_dir: String,
    /// DUT to operate on, as `[user@]host[:port]`.
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FixtureRequest {
    Push { name: String, config: FixtureConfig },
    Pop,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FixtureResponse {
    Log { time: DateTime<Utc>, text: String },
    Error { time: DateTime<Utc>, error: ErrorInfo },
    RequestDone,
}
