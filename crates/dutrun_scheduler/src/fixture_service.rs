//! Client side of the fixture service, which runs remote fixtures on the orchestrator's
//! host while local tests run on the DUT.

use async_trait::async_trait;
use dutrun_protocol::{
    fixture::{FixtureConfig, FixtureRequest, FixtureResponse},
    message::format_log_time,
};
use dutrun_transport::{Cmd, CmdError, Connection};
use dutrun_utils::{
    cancel::{CancelScope, Cancelled},
    net_protocol::{self, FrameError},
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream};

#[derive(Debug, Error)]
pub enum FixtureServiceError {
    #[error("fixture service closed the connection")]
    Closed,
    #[error("fixture service protocol error: {0}")]
    Frame(#[from] FrameError),
    #[error("fixture service process failed: {0}")]
    Process(#[from] CmdError),
    #[error("{0}")]
    Cancelled(#[from] Cancelled),
}

/// A request/response stream to the fixture service.
#[async_trait]
pub trait FixtureService: Send {
    async fn send(&mut self, request: &FixtureRequest) -> Result<(), FixtureServiceError>;
    async fn recv(&mut self) -> Result<FixtureResponse, FixtureServiceError>;
}

/// Sets up the remote fixture `name`. Returns the set-up errors it reported, which do not
/// make the push itself fail.
pub async fn push_fixture(
    scope: &CancelScope,
    service: &mut dyn FixtureService,
    name: &str,
    config: FixtureConfig,
) -> Result<Vec<String>, FixtureServiceError> {
    tracing::info!(fixture = %name, "pushing remote fixture");
    let request = FixtureRequest::Push {
        name: name.to_string(),
        config,
    };
    exchange(scope, service, name, &request).await
}

/// Tears down the most recently pushed fixture. Returns the tear-down errors it reported.
pub async fn pop_fixture(
    scope: &CancelScope,
    service: &mut dyn FixtureService,
    name: &str,
) -> Result<Vec<String>, FixtureServiceError> {
    tracing::info!(fixture = %name, "popping remote fixture");
    exchange(scope, service, name, &FixtureRequest::Pop).await
}

async fn exchange(
    scope: &CancelScope,
    service: &mut dyn FixtureService,
    fixture: &str,
    request: &FixtureRequest,
) -> Result<Vec<String>, FixtureServiceError> {
    scope.check()?;
    service.send(request).await?;

    let mut errors = vec![];
    loop {
        let response = tokio::select! {
            biased;
            reason = scope.done() => return Err(reason.into()),
            response = service.recv() => response?,
        };
        match response {
            FixtureResponse::Log { time, text } => {
                tracing::info!(%fixture, "{} {}", format_log_time(time), text);
            }
            FixtureResponse::Error { time, error } => {
                tracing::warn!(%fixture, "{} Error: {}", format_log_time(time), error);
                errors.push(error.reason);
            }
            FixtureResponse::RequestDone => return Ok(errors),
        }
    }
}

/// Speaks the fixture protocol as length-prefixed JSON frames over a byte pipe.
pub struct FramedFixtureService<R, W> {
    reader: BufReader<R>,
    writer: W,
}

impl<R, W> FramedFixtureService<R, W>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Closes the request side, which tells the service to exit.
    pub async fn shutdown(&mut self) -> Result<(), FixtureServiceError> {
        self.writer.shutdown().await.map_err(FrameError::from)?;
        Ok(())
    }
}

#[async_trait]
impl<R, W> FixtureService for FramedFixtureService<R, W>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    async fn send(&mut self, request: &FixtureRequest) -> Result<(), FixtureServiceError> {
        net_protocol::async_write(&mut self.writer, request).await?;
        self.writer.flush().await.map_err(FrameError::from)?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<FixtureResponse, FixtureServiceError> {
        net_protocol::async_read(&mut self.reader)
            .await?
            .ok_or(FixtureServiceError::Closed)
    }
}

/// A fixture service running as a command, spoken to over its stdin and stdout.
pub struct ProcessFixtureService {
    cmd: Cmd,
    framed: FramedFixtureService<DuplexStream, DuplexStream>,
}

impl ProcessFixtureService {
    pub async fn start(
        scope: &CancelScope,
        conn: &Connection,
        program: &str,
        args: &[String],
    ) -> Result<Self, FixtureServiceError> {
        let mut cmd = conn.command(program);
        cmd.args(args.iter().cloned());
        let stdin = cmd.stdin_pipe()?;
        let stdout = cmd.stdout_pipe()?;
        cmd.start(scope).await?;
        tracing::debug!(command = %cmd.command_line(), "started fixture service");
        Ok(Self {
            cmd,
            framed: FramedFixtureService::new(stdout, stdin),
        })
    }

    /// Asks the service to exit and waits for it.
    pub async fn close(mut self, scope: &CancelScope) -> Result<(), FixtureServiceError> {
        if let Err(error) = self.framed.shutdown().await {
            tracing::debug!(%error, "fixture service stdin already closed");
        }
        self.cmd.wait(scope).await?;
        Ok(())
    }
}

#[async_trait]
impl FixtureService for ProcessFixtureService {
    async fn send(&mut self, request: &FixtureRequest) -> Result<(), FixtureServiceError> {
        self.framed.send(request).await
    }

    async fn recv(&mut self) -> Result<FixtureResponse, FixtureServiceError> {
        self.framed.recv().await
    }
}
