use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use serde::{de::Error as _, Deserializer};
use serde_derive::{Deserialize, Serialize};

/// How a run is carried out. Every field has a default, so any subset may be configured.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Local directory receiving logs, output files and results.
    pub results_dir: PathBuf,
    /// Stop the run after this many failed tests. 0 means no limit.
    pub max_test_failures: usize,
    /// Longest wait for the next control message before the runner is considered hung.
    #[serde(deserialize_with = "nonzero_secs")]
    pub msg_timeout_secs: u64,
    /// Runner invocations per fixture group, counting the first.
    pub max_attempts: usize,
    #[serde(deserialize_with = "nonzero_secs")]
    pub ping_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Test runner binary on the DUT.
    pub local_runner: String,
    /// Scratch directory on the DUT for entity output files.
    pub dut_out_dir: String,
    pub max_concurrent_pulls: usize,
    /// Command line of the fixture service for remote fixtures. Empty if there is none.
    pub fixture_service: Vec<String>,
    /// Variables passed to remote fixtures.
    pub vars: BTreeMap<String, String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("dutrun_results"),
            max_test_failures: 0,
            msg_timeout_secs: 60,
            max_attempts: 3,
            ping_timeout_secs: 5,
            heartbeat_interval_secs: 1,
            local_runner: "/usr/local/bin/local_test_runner".to_string(),
            dut_out_dir: "/usr/local/tmp/dutrun/out".to_string(),
            max_concurrent_pulls: 4,
            fixture_service: vec![],
            vars: BTreeMap::new(),
        }
    }
}

impl RunConfig {
    pub fn msg_timeout(&self) -> Duration {
        Duration::from_secs(self.msg_timeout_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }
}

fn nonzero_secs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match <u64 as serde::Deserialize>::deserialize(deserializer)? {
        0 => Err(D::Error::custom("timeout must be at least 1 second")),
        secs => Ok(secs),
    }
}
