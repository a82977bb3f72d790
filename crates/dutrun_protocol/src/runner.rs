use serde_derive::{Deserialize, Serialize};

/// Arguments handed to a test runner on its stdin when it is launched on the DUT.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct RunnerArgs {
    /// Bundle whose tests are run.
    pub bundle: String,
    /// Names of the tests to run. The runner decides their order.
    pub tests: Vec<String>,
    /// Remote fixture already set up for these tests, or empty.
    #[serde(default)]
    pub start_fixture_name: String,
    /// Set-up errors of the start fixture. When non-empty every test must fail with them
    /// instead of running.
    #[serde(default)]
    pub set_up_errors: Vec<String>,
    /// Directory on the DUT under which entity output directories are created.
    pub out_dir: String,
    /// Interval at which the runner should send heartbeats, in seconds. Zero disables them.
    #[serde(default)]
    pub heartbeat_interval_secs: u64,
}

/// The reason a test reports when its start fixture failed to set up.
pub fn fixture_failure_reason(fixture: &str, reason: &str) -> String {
    format!("[Fixture failure] {fixture}: {reason}")
}
