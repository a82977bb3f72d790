use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::PathBuf,
    sync::Arc,
};

use futures::future::BoxFuture;
use tokio::{sync::Semaphore, task::JoinSet};

/// Moves a directory from the DUT (first argument) into a local directory (second argument),
/// removing it from the DUT.
pub type CopyAndRemove =
    Arc<dyn Fn(String, PathBuf) -> BoxFuture<'static, io::Result<()>> + Send + Sync>;

/// Pulls entity output directories off the DUT in the background.
///
/// Pulls run concurrently, at most `max_concurrent` at a time, and may finish in any order.
/// A failed pull is logged to the entity's log file and otherwise ignored.
pub struct OutputPuller {
    copy: CopyAndRemove,
    permits: Arc<Semaphore>,
    tasks: JoinSet<()>,
}

impl OutputPuller {
    pub fn new(copy: CopyAndRemove, max_concurrent: usize) -> Self {
        Self {
            copy,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tasks: JoinSet::new(),
        }
    }

    pub fn pull(&mut self, entity: String, src: String, dst: PathBuf, log_file: PathBuf) {
        let copy = self.copy.clone();
        let permits = self.permits.clone();
        self.tasks.spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            if let Err(error) = copy(src.clone(), dst).await {
                tracing::warn!(%entity, %src, %error, "failed to pull output files");
                let appended = OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&log_file)
                    .and_then(|mut log| {
                        writeln!(log, "Failed to copy output files from {src}: {error}")
                    });
                if let Err(error) = appended {
                    tracing::debug!(%entity, %error, "failed to record pull failure");
                }
            }
        });
    }

    /// Waits for every pull started so far.
    pub async fn wait(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(error) = joined {
                tracing::warn!(%error, "output pull task failed");
            }
        }
    }
}
