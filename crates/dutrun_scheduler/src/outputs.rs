use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use dutrun_results::CopyAndRemove;
use dutrun_transport::{CmdError, Connection};
use dutrun_utils::cancel::CancelScope;
use futures::FutureExt;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    process::Command,
};

use crate::connection::ConnectionManager;

/// Bound on pulling one entity's output directory.
const PULL_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Pulls directories off the DUT by streaming a `tar` archive through the connection into
/// a local `tar`, then deletes them on the DUT. Each pull uses the current connection.
pub fn ssh_copy_and_remove(conns: Arc<dyn ConnectionManager>) -> CopyAndRemove {
    Arc::new(move |src: String, dst: PathBuf| {
        let conns = conns.clone();
        async move {
            let conn = conns.connection().await;
            copy_and_remove(&conn, &src, &dst).await
        }
        .boxed()
    })
}

async fn copy_and_remove(conn: &Connection, src: &str, dst: &Path) -> io::Result<()> {
    let scope = CancelScope::new().with_timeout(PULL_TIMEOUT);
    tokio::fs::create_dir_all(dst).await?;

    let mut remote = conn.command("tar");
    remote.args(["-c", "-C", src, "."]);
    let mut archive = remote.stdout_pipe().map_err(to_io)?;
    remote.start(&scope).await.map_err(to_io)?;

    let mut local = Command::new("tar")
        .arg("-x")
        .arg("-C")
        .arg(dst)
        .stdin(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    let Some(mut local_stdin) = local.stdin.take() else {
        remote.abort();
        return Err(io::Error::new(io::ErrorKind::BrokenPipe, "local tar has no stdin"));
    };

    let copied = pipe_archive(&scope, &mut archive, &mut local_stdin).await;
    drop(local_stdin);
    if let Err(error) = copied {
        remote.abort();
        return Err(error);
    }
    remote.wait(&scope).await.map_err(to_io)?;
    let status = local.wait().await?;
    if !status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("local tar exited with {status}"),
        ));
    }

    conn.command("rm")
        .args(["-rf", "--", src])
        .run(&scope)
        .await
        .map_err(to_io)
}

/// Copies the archive into the local `tar`, giving up once `scope` is done. A stalled DUT
/// keeps the archive open without sending anything.
async fn pipe_archive<R, W>(scope: &CancelScope, archive: &mut R, local: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    tokio::select! {
        copied = tokio::io::copy(archive, local) => copied,
        reason = scope.done() => Err(io::Error::new(io::ErrorKind::TimedOut, reason)),
    }
}

fn to_io(error: CmdError) -> io::Error {
    match error {
        CmdError::Io(error) => error,
        error => io::Error::new(io::ErrorKind::Other, error),
    }
}
