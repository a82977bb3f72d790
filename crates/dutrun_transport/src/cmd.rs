//! A command run through a [Transport], modelled on [std::process::Command] but with every
//! blocking step bounded by a [CancelScope] and an abort that works from any task.
//!
//! A command moves through `New -> Started -> Closing -> Done`. It is started once and waited
//! on once. Aborting stops stdio relays (so readers of piped output see EOF), kills the
//! process without waiting for it, and makes a pending or later wait return
//! [CmdError::Aborted].

use std::{io, process::ExitStatus, sync::Arc};

use dutrun_utils::cancel::{run_cancellable, CancelScope, Cancelled};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::TransportError,
    shell::ShellCommandBuilder,
    transport::{BoxedRead, BoxedWrite, RemoteChild, Transport},
};

const PIPE_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum CmdError {
    #[error("command already started")]
    AlreadyStarted,
    #[error("command not started")]
    NotStarted,
    #[error("command already waited on")]
    AlreadyWaited,
    #[error("{0} must be requested before the command starts")]
    PipeAfterStart(&'static str),
    #[error("{0} already requested")]
    PipeTaken(&'static str),
    #[error("`{command}` exited with {status}{}", stderr_suffix(.stderr))]
    Exit {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("command aborted")]
    Aborted,
    #[error("{0}")]
    Transport(#[from] TransportError),
    #[error("{0}")]
    Cancelled(#[from] Cancelled),
    #[error("{0}")]
    Io(#[from] io::Error),
}

fn stderr_suffix(stderr: &str) -> String {
    match stderr.trim() {
        "" => String::new(),
        tail => format!(": {tail}"),
    }
}

impl CmdError {
    /// The exit code, if the command ran to completion and failed.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CmdError::Exit { status, .. } => status.code(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    New,
    Started,
    Closing,
    Done,
}

/// Where a stdio stream of the child goes.
enum Sink {
    Discard,
    Pipe(DuplexStream),
    Capture(Arc<Mutex<Vec<u8>>>),
}

/// Aborts a [Cmd] from another task. Aborting more than once is harmless.
#[derive(Debug, Clone)]
pub struct AbortHandle(CancellationToken);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.cancel()
    }

    pub fn is_aborted(&self) -> bool {
        self.0.is_cancelled()
    }
}

pub struct Cmd {
    transport: Arc<dyn Transport>,
    shell: Arc<dyn ShellCommandBuilder>,
    args: Vec<String>,
    dir: Option<String>,
    state: State,
    abort: CancellationToken,
    stdin: Option<DuplexStream>,
    stdout: Sink,
    stderr: Sink,
    reaper: Option<JoinHandle<Result<ExitStatus, CmdError>>>,
}

impl Cmd {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        shell: Arc<dyn ShellCommandBuilder>,
        program: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            shell,
            args: vec![program.into()],
            dir: None,
            state: State::New,
            abort: CancellationToken::new(),
            stdin: None,
            stdout: Sink::Discard,
            stderr: Sink::Discard,
            reaper: None,
        }
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Working directory on the target.
    pub fn dir(&mut self, dir: impl Into<String>) -> &mut Self {
        self.dir = Some(dir.into());
        self
    }

    /// The command line handed to the target's shell.
    pub fn command_line(&self) -> String {
        self.shell.build(self.dir.as_deref(), &self.args)
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle(self.abort.clone())
    }

    /// Aborts the command. See [AbortHandle].
    pub fn abort(&self) {
        self.abort.cancel()
    }

    /// Returns a writer feeding the command's stdin. Dropping or shutting it down closes the
    /// command's stdin.
    pub fn stdin_pipe(&mut self) -> Result<DuplexStream, CmdError> {
        self.check_can_pipe("stdin")?;
        if self.stdin.is_some() {
            return Err(CmdError::PipeTaken("stdin"));
        }
        let (ours, theirs) = tokio::io::duplex(PIPE_BUFFER_SIZE);
        self.stdin = Some(theirs);
        Ok(ours)
    }

    /// Returns a reader of the command's stdout. It sees EOF once the command's stdout closes
    /// or the command is aborted.
    pub fn stdout_pipe(&mut self) -> Result<DuplexStream, CmdError> {
        self.check_can_pipe("stdout")?;
        Self::pipe_sink(&mut self.stdout, "stdout")
    }

    /// Like [Cmd::stdout_pipe], for stderr.
    pub fn stderr_pipe(&mut self) -> Result<DuplexStream, CmdError> {
        self.check_can_pipe("stderr")?;
        Self::pipe_sink(&mut self.stderr, "stderr")
    }

    fn check_can_pipe(&self, name: &'static str) -> Result<(), CmdError> {
        match self.state {
            State::New => Ok(()),
            _ => Err(CmdError::PipeAfterStart(name)),
        }
    }

    fn pipe_sink(sink: &mut Sink, name: &'static str) -> Result<DuplexStream, CmdError> {
        if !matches!(sink, Sink::Discard) {
            return Err(CmdError::PipeTaken(name));
        }
        let (ours, theirs) = tokio::io::duplex(PIPE_BUFFER_SIZE);
        *sink = Sink::Pipe(theirs);
        Ok(ours)
    }

    /// Starts the command. Returns as soon as the process is spawned, or as soon as `scope` is
    /// done; in the latter case a process that is spawned late is killed.
    pub async fn start(&mut self, scope: &CancelScope) -> Result<(), CmdError> {
        match self.state {
            State::New => {}
            _ => return Err(CmdError::AlreadyStarted),
        }
        if self.abort.is_cancelled() {
            return Err(CmdError::Aborted);
        }

        let command_line = self.command_line();
        tracing::debug!(command = %command_line, "starting command");

        let transport = self.transport.clone();
        let mut child = run_cancellable(
            scope,
            async move { transport.spawn(&command_line).await },
            |spawned| {
                if let Ok(mut child) = spawned {
                    tokio::spawn(async move {
                        let _ = child.kill().await;
                    });
                }
            },
        )
        .await??;
        self.state = State::Started;

        // Relays into pipes handed to the caller are not waited on: their readers may not
        // drain them before waiting.
        let mut waited_relays = vec![];

        let stdin_relay = self.stdin.take();
        if let Some(child_stdin) = child.take_stdin() {
            let abort = self.abort.clone();
            tokio::spawn(relay_stdin(stdin_relay, child_stdin, abort));
        }

        for (stream, sink) in [
            (child.take_stdout(), std::mem::replace(&mut self.stdout, Sink::Discard)),
            (child.take_stderr(), std::mem::replace(&mut self.stderr, Sink::Discard)),
        ] {
            let Some(stream) = stream else { continue };
            let is_pipe = matches!(sink, Sink::Pipe(_));
            let relay = tokio::spawn(relay_output(stream, sink, self.abort.clone()));
            if !is_pipe {
                waited_relays.push(relay);
            }
        }

        let abort = self.abort.clone();
        self.reaper = Some(tokio::spawn(reap(child, waited_relays, abort)));

        Ok(())
    }

    /// Waits for the command to exit. A non-zero exit status is [CmdError::Exit].
    ///
    /// If `scope` is done first, the command is aborted and the scope's reason returned
    /// right away, without waiting for the process to go away.
    pub async fn wait(&mut self, scope: &CancelScope) -> Result<(), CmdError> {
        self.wait_inner(scope, String::new).await
    }

    async fn wait_inner(
        &mut self,
        scope: &CancelScope,
        stderr: impl FnOnce() -> String,
    ) -> Result<(), CmdError> {
        match self.state {
            State::Started => {}
            State::New => return Err(CmdError::NotStarted),
            State::Closing | State::Done => return Err(CmdError::AlreadyWaited),
        }
        self.state = State::Closing;

        let reaper = self.reaper.take().ok_or(CmdError::NotStarted)?;
        let waited = run_cancellable(scope, reaper, |_| {}).await;
        self.state = State::Done;

        let status = match waited {
            Ok(Ok(status)) => status?,
            Ok(Err(join_error)) if join_error.is_panic() => {
                std::panic::resume_unwind(join_error.into_panic())
            }
            Ok(Err(_)) => return Err(CmdError::Aborted),
            Err(reason) => {
                tracing::debug!(?reason, command = %self.command_line(), "aborting command");
                self.abort.cancel();
                return Err(reason.into());
            }
        };

        if status.success() {
            Ok(())
        } else {
            Err(CmdError::Exit {
                command: self.command_line(),
                status,
                stderr: stderr(),
            })
        }
    }

    /// Starts the command and waits for it.
    pub async fn run(&mut self, scope: &CancelScope) -> Result<(), CmdError> {
        self.start(scope).await?;
        self.wait(scope).await
    }

    /// Runs the command and returns its stdout. On failure the error carries its stderr.
    pub async fn output(&mut self, scope: &CancelScope) -> Result<Vec<u8>, CmdError> {
        let stdout = self.capture_stdout()?;
        let stderr = match self.stderr {
            Sink::Discard => {
                let buf = Arc::new(Mutex::new(vec![]));
                self.stderr = Sink::Capture(buf.clone());
                Some(buf)
            }
            _ => None,
        };

        let stderr_text = move || match stderr {
            Some(buf) => {
                let bytes = buf.lock();
                String::from_utf8_lossy(&bytes).into_owned()
            }
            None => String::new(),
        };

        self.start(scope).await?;
        self.wait_inner(scope, stderr_text).await?;

        let out = std::mem::take(&mut *stdout.lock());
        Ok(out)
    }

    /// Runs the command and returns its stdout and stderr interleaved.
    pub async fn combined_output(&mut self, scope: &CancelScope) -> Result<Vec<u8>, CmdError> {
        let out = self.capture_stdout()?;
        if !matches!(self.stderr, Sink::Discard) {
            return Err(CmdError::PipeTaken("stderr"));
        }
        self.stderr = Sink::Capture(out.clone());

        self.run(scope).await?;

        let out = std::mem::take(&mut *out.lock());
        Ok(out)
    }

    fn capture_stdout(&mut self) -> Result<Arc<Mutex<Vec<u8>>>, CmdError> {
        if !matches!(self.stdout, Sink::Discard) {
            return Err(CmdError::PipeTaken("stdout"));
        }
        let buf = Arc::new(Mutex::new(vec![]));
        self.stdout = Sink::Capture(buf.clone());
        Ok(buf)
    }
}

impl Drop for Cmd {
    fn drop(&mut self) {
        if self.state == State::Started {
            tracing::debug!(
                command = %self.command_line(),
                "command dropped without wait, aborting"
            );
            self.abort.cancel();
        }
    }
}

async fn reap(
    mut child: Box<dyn RemoteChild>,
    waited_relays: Vec<JoinHandle<io::Result<()>>>,
    abort: CancellationToken,
) -> Result<ExitStatus, CmdError> {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = abort.cancelled() => None,
    };

    let status = match exited {
        Some(status) => status?,
        None => {
            if let Err(error) = child.kill().await {
                tracing::debug!(%error, "failed to kill aborted command");
            }
            return Err(CmdError::Aborted);
        }
    };

    for relay in waited_relays {
        match relay.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => tracing::debug!(%error, "command output relay failed"),
            Err(error) => tracing::debug!(%error, "command output relay panicked"),
        }
    }

    Ok(status)
}

async fn relay_stdin(from: Option<DuplexStream>, mut to: BoxedWrite, abort: CancellationToken) {
    let copy = async {
        if let Some(mut from) = from {
            tokio::io::copy(&mut from, &mut to).await?;
        }
        to.shutdown().await
    };
    tokio::select! {
        result = copy => {
            if let Err(error) = result {
                tracing::debug!(%error, "stdin relay stopped");
            }
        }
        _ = abort.cancelled() => {}
    }
}

async fn relay_output(mut from: BoxedRead, sink: Sink, abort: CancellationToken) -> io::Result<()> {
    let copy = async move {
        match sink {
            Sink::Discard => {
                tokio::io::copy(&mut from, &mut tokio::io::sink()).await?;
            }
            Sink::Pipe(mut to) => {
                tokio::io::copy(&mut from, &mut to).await?;
                to.shutdown().await?;
            }
            Sink::Capture(buf) => {
                let mut chunk = vec![0; 8 * 1024];
                loop {
                    let n = from.read(&mut chunk).await?;
                    if n == 0 {
                        break;
                    }
                    buf.lock().extend_from_slice(&chunk[..n]);
                }
            }
        }
        Ok(())
    };
    tokio::select! {
        result = copy => result,
        _ = abort.cancelled() => Ok(()),
    }
}
