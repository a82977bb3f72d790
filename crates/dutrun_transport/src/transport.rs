//! The primitives every connection is built on: spawning a command line and dialing a port
//! from the far side.

use std::{
    io,
    pin::Pin,
    process::{ExitStatus, Stdio},
    sync::Arc,
    task::{Context, Poll},
};

use async_trait::async_trait;
use openssh::Session;
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
    process::Command,
};

use crate::{error::TransportError, shell::quote};

pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// A way of running processes on, and opening channels from, a target machine.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Spawns `command_line` on the target's shell with all three stdio streams piped.
    async fn spawn(&self, command_line: &str) -> Result<Box<dyn RemoteChild>, TransportError>;

    /// Opens a byte channel to `host:port` as seen from the target.
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream, TransportError>;

    /// Does a full round trip to the target.
    async fn ping(&self) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// A process spawned through a [Transport].
#[async_trait]
pub trait RemoteChild: Send {
    fn take_stdin(&mut self) -> Option<BoxedWrite>;
    fn take_stdout(&mut self) -> Option<BoxedRead>;
    fn take_stderr(&mut self) -> Option<BoxedRead>;

    /// Waits for the process to exit.
    async fn wait(&mut self) -> Result<ExitStatus, TransportError>;

    /// Asks the process to stop, without waiting for it to do so.
    async fn kill(&mut self) -> Result<(), TransportError>;
}

/// Runs commands on a DUT through an OpenSSH control master. Each command gets its own
/// channel multiplexed over the one connection.
pub struct SshTransport {
    session: Mutex<Option<Arc<Session>>>,
}

impl SshTransport {
    pub fn new(session: Session) -> Self {
        Self {
            session: Mutex::new(Some(Arc::new(session))),
        }
    }

    fn session(&self) -> Result<Arc<Session>, TransportError> {
        self.session.lock().clone().ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn spawn(&self, command_line: &str) -> Result<Box<dyn RemoteChild>, TransportError> {
        let session = self.session()?;

        let mut command = session.arc_raw_command(command_line);
        command
            .stdin(openssh::Stdio::piped())
            .stdout(openssh::Stdio::piped())
            .stderr(openssh::Stdio::piped());
        let mut child = command.spawn().await?;

        let stdin = child.stdin().take().map(|s| Box::new(s) as BoxedWrite);
        let stdout = child.stdout().take().map(|s| Box::new(s) as BoxedRead);
        let stderr = child.stderr().take().map(|s| Box::new(s) as BoxedRead);

        Ok(Box::new(SshChild {
            child: Some(child),
            stdin,
            stdout,
            stderr,
        }))
    }

    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream, TransportError> {
        let child = self.spawn(&format!("exec nc {} {}", quote(host), port)).await?;
        Ok(Box::new(ChildStream::new(child)?))
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let session = self.session()?;
        session.check().await?;

        let status = session.arc_raw_command("true").status().await?;
        if !status.success() {
            let msg = format!("ping command exited with {status}");
            return Err(io::Error::new(io::ErrorKind::Other, msg).into());
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let session = self.session.lock().take();
        let session = match session {
            Some(session) => session,
            None => return Ok(()),
        };
        match Arc::try_unwrap(session) {
            Ok(session) => session.close().await?,
            // Commands still hold the session; it goes away with the last of them.
            Err(_) => tracing::debug!("session still in use, leaving it to be dropped"),
        }
        Ok(())
    }
}

struct SshChild {
    child: Option<openssh::Child<Arc<Session>>>,
    stdin: Option<BoxedWrite>,
    stdout: Option<BoxedRead>,
    stderr: Option<BoxedRead>,
}

#[async_trait]
impl RemoteChild for SshChild {
    fn take_stdin(&mut self) -> Option<BoxedWrite> {
        self.stdin.take()
    }

    fn take_stdout(&mut self) -> Option<BoxedRead> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<BoxedRead> {
        self.stderr.take()
    }

    /// Not cancel-safe: dropping the returned future disconnects from the remote process.
    async fn wait(&mut self) -> Result<ExitStatus, TransportError> {
        let child = self.child.take().ok_or(TransportError::Closed)?;
        Ok(child.wait().await?)
    }

    /// The multiplexed channel cannot deliver signals, so killing disconnects the channel.
    async fn kill(&mut self) -> Result<(), TransportError> {
        if let Some(child) = self.child.take() {
            child.disconnect().await?;
        }
        Ok(())
    }
}

/// Runs commands with `sh -c` on this machine. Stands in for a DUT in tests and when the
/// orchestrator runs on the DUT itself.
#[derive(Debug, Default)]
pub struct LocalTransport;

#[async_trait]
impl Transport for LocalTransport {
    async fn spawn(&self, command_line: &str) -> Result<Box<dyn RemoteChild>, TransportError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command_line)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().map(|s| Box::new(s) as BoxedWrite);
        let stdout = child.stdout.take().map(|s| Box::new(s) as BoxedRead);
        let stderr = child.stderr.take().map(|s| Box::new(s) as BoxedRead);

        Ok(Box::new(LocalChild {
            child,
            stdin,
            stdout,
            stderr,
        }))
    }

    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream, TransportError> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn ping(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct LocalChild {
    child: tokio::process::Child,
    stdin: Option<BoxedWrite>,
    stdout: Option<BoxedRead>,
    stderr: Option<BoxedRead>,
}

#[async_trait]
impl RemoteChild for LocalChild {
    fn take_stdin(&mut self) -> Option<BoxedWrite> {
        self.stdin.take()
    }

    fn take_stdout(&mut self) -> Option<BoxedRead> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<BoxedRead> {
        self.stderr.take()
    }

    async fn wait(&mut self) -> Result<ExitStatus, TransportError> {
        Ok(self.child.wait().await?)
    }

    async fn kill(&mut self) -> Result<(), TransportError> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pin_project! {
    /// A byte channel made of a relay process's stdout and stdin. The process lives as long
    /// as the stream.
    pub struct ChildStream {
        #[pin]
        reader: BoxedRead,
        #[pin]
        writer: BoxedWrite,
        _child: Box<dyn RemoteChild>,
    }
}

impl ChildStream {
    pub fn new(mut child: Box<dyn RemoteChild>) -> Result<Self, TransportError> {
        let missing = || io::Error::new(io::ErrorKind::BrokenPipe, "relay process has no stdio");
        let reader = child.take_stdout().ok_or_else(missing)?;
        let writer = child.take_stdin().ok_or_else(missing)?;
        Ok(Self {
            reader,
            writer,
            _child: child,
        })
    }
}

impl AsyncRead for ChildStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().reader.poll_read(cx, buf)
    }
}

impl AsyncWrite for ChildStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().writer.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().writer.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().writer.poll_shutdown(cx)
    }
}
