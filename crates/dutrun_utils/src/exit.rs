/// Exit code to issue if the orchestrator itself fails, or a run ends incomplete.
pub const CODE_ERROR: i32 = 101;

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct ExitCode(i32);

impl ExitCode {
    /// Every test that ran passed.
    pub const SUCCESS: ExitCode = ExitCode(0);
    /// At least one test failed, or the failure threshold stopped the run.
    pub const FAILURE: ExitCode = ExitCode(1);
    pub const DUTRUN_ERROR: ExitCode = ExitCode(CODE_ERROR);

    pub const fn get(&self) -> i32 {
        self.0
    }

    pub const fn new(code: i32) -> Self {
        Self(code)
    }

    /// Folds two exit codes, keeping the more severe one.
    pub fn max(self, other: ExitCode) -> ExitCode {
        let rank = |code: ExitCode| match code.0 {
            0 => 0,
            CODE_ERROR => 2,
            _ => 1,
        };
        if rank(other) > rank(self) {
            other
        } else {
            self
        }
    }
}

impl From<std::process::ExitStatus> for ExitCode {
    fn from(es: std::process::ExitStatus) -> Self {
        let code = es.code().unwrap_or(CODE_ERROR);
        Self::new(code)
    }
}
