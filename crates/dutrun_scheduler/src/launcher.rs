//! Launching of the local test runner on the DUT.

use std::{collections::VecDeque, io, time::Duration};

use async_trait::async_trait;
use dutrun_protocol::runner::RunnerArgs;
use dutrun_transport::{Cmd, CmdError, Connection};
use dutrun_utils::cancel::{CancelScope, Cancelled};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, DuplexStream},
    task::JoinHandle,
};

/// Lines of runner stderr kept for error messages.
const STDERR_TAIL_LINES: usize = 20;
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub type RunnerOutput = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to start test runner: {0}")]
    Start(#[source] CmdError),
    #[error("failed to send arguments to test runner: {0}")]
    Args(#[source] io::Error),
    #[error("test runner has no output stream")]
    NoOutput,
    #[error("test runner failed: {error}{}", tail_suffix(.stderr_tail))]
    Runner {
        #[source]
        error: CmdError,
        stderr_tail: String,
    },
    #[error("{0}")]
    Cancelled(#[from] Cancelled),
}

fn tail_suffix(tail: &str) -> String {
    match tail.trim() {
        "" => String::new(),
        tail => format!("; stderr:\n{tail}"),
    }
}

/// Starts a test runner for one batch of tests.
#[async_trait]
pub trait RunnerLauncher: Send + Sync {
    async fn launch(
        &self,
        scope: &CancelScope,
        conn: &Connection,
        args: &RunnerArgs,
    ) -> Result<Box<dyn RunnerProcess>, LaunchError>;
}

/// A running test runner. Its stdout carries the control message stream.
#[async_trait]
pub trait RunnerProcess: Send {
    fn take_stdout(&mut self) -> Option<RunnerOutput>;

    async fn wait(&mut self, scope: &CancelScope) -> Result<(), LaunchError>;

    /// Stops the runner. Safe to call more than once.
    fn abort(&self);
}

/// Runs the test runner binary on the DUT through the connection, handing it its arguments
/// as JSON on stdin.
#[derive(Debug, Clone)]
pub struct SshRunnerLauncher {
    program: String,
    args: Vec<String>,
}

impl SshRunnerLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args.extend(args);
        self
    }
}

#[async_trait]
impl RunnerLauncher for SshRunnerLauncher {
    async fn launch(
        &self,
        scope: &CancelScope,
        conn: &Connection,
        args: &RunnerArgs,
    ) -> Result<Box<dyn RunnerProcess>, LaunchError> {
        let body = serde_json::to_vec(args).map_err(|e| LaunchError::Args(e.into()))?;

        let mut cmd = conn.command(self.program.as_str());
        cmd.args(self.args.iter().cloned());
        let mut stdin = cmd.stdin_pipe().map_err(LaunchError::Start)?;
        let stdout = cmd.stdout_pipe().map_err(LaunchError::Start)?;
        let stderr = cmd.stderr_pipe().map_err(LaunchError::Start)?;
        cmd.start(scope).await.map_err(|e| match e {
            CmdError::Cancelled(reason) => LaunchError::Cancelled(reason),
            e => LaunchError::Start(e),
        })?;
        tracing::info!(bundle = %args.bundle, tests = args.tests.len(), "started test runner");

        if let Err(error) = send_args(&mut stdin, &body).await {
            cmd.abort();
            return Err(LaunchError::Args(error));
        }

        Ok(Box::new(SshRunnerProcess {
            cmd,
            stdout: Some(Box::new(stdout)),
            stderr_tail: Some(tokio::spawn(collect_stderr(stderr))),
        }))
    }
}

struct SshRunnerProcess {
    cmd: Cmd,
    stdout: Option<RunnerOutput>,
    stderr_tail: Option<JoinHandle<String>>,
}

#[async_trait]
impl RunnerProcess for SshRunnerProcess {
    fn take_stdout(&mut self) -> Option<RunnerOutput> {
        self.stdout.take()
    }

    async fn wait(&mut self, scope: &CancelScope) -> Result<(), LaunchError> {
        let error = match self.cmd.wait(scope).await {
            Ok(()) => return Ok(()),
            Err(CmdError::Cancelled(reason)) => return Err(LaunchError::Cancelled(reason)),
            Err(error) => error,
        };

        let stderr_tail = match self.stderr_tail.take() {
            Some(task) => match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await {
                Ok(Ok(tail)) => tail,
                _ => String::new(),
            },
            None => String::new(),
        };
        Err(LaunchError::Runner { error, stderr_tail })
    }

    fn abort(&self) {
        self.cmd.abort();
    }
}

async fn send_args(stdin: &mut DuplexStream, body: &[u8]) -> io::Result<()> {
    stdin.write_all(body).await?;
    stdin.shutdown().await
}

/// Logs runner stderr line by line and returns its last lines.
async fn collect_stderr(stderr: impl AsyncRead + Unpin) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::debug!(stream = "runner stderr", "{line}");
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(error) => {
                tracing::debug!(%error, "failed to read runner stderr");
                break;
            }
        }
    }
    Vec::from(tail).join("\n")
}

#[cfg(test)]
mod test {
    use dutrun_protocol::runner::RunnerArgs;
    use dutrun_transport::Connection;
    use dutrun_utils::cancel::CancelScope;
    use tokio::io::AsyncReadExt;

    use super::{LaunchError, RunnerLauncher, SshRunnerLauncher};

    fn args() -> RunnerArgs {
        RunnerArgs {
            bundle: "cros".into(),
            tests: vec!["pkg.A".into()],
            out_dir: "/tmp/out".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn runner_receives_args_on_stdin() {
        let launcher = SshRunnerLauncher::new("cat");
        let scope = CancelScope::new();
        let mut process = launcher
            .launch(&scope, &Connection::local(), &args())
            .await
            .unwrap();

        let mut stdout = process.take_stdout().unwrap();
        let mut echoed = vec![];
        stdout.read_to_end(&mut echoed).await.unwrap();
        process.wait(&scope).await.unwrap();

        let got: RunnerArgs = serde_json::from_slice(&echoed).unwrap();
        assert_eq!(got, args());
        assert!(process.take_stdout().is_none());
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn runner_failure_carries_stderr_tail() {
        let launcher = SshRunnerLauncher::new("sh").with_args([
            "-c".to_string(),
            "cat >/dev/null; echo bundle exploded >&2; exit 2".to_string(),
        ]);
        let scope = CancelScope::new();
        let mut process = launcher
            .launch(&scope, &Connection::local(), &args())
            .await
            .unwrap();

        let err = process.wait(&scope).await.unwrap_err();
        match &err {
            LaunchError::Runner { stderr_tail, .. } => assert_eq!(stderr_tail, "bundle exploded"),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.to_string().contains("stderr:\nbundle exploded"));
    }
}
