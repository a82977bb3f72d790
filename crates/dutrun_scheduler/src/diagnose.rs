use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use dutrun_results::Diagnoser;
use dutrun_transport::{CmdError, Connection};
use dutrun_utils::cancel::CancelScope;

use crate::connection::ConnectionManager;

const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";
pub const DIAGNOSIS_FILENAME: &str = "diagnosis.txt";

pub async fn read_boot_id(scope: &CancelScope, conn: &Connection) -> Result<String, CmdError> {
    let out = conn.command("cat").arg(BOOT_ID_PATH).output(scope).await?;
    Ok(String::from_utf8_lossy(&out).trim().to_string())
}

/// Explains a failed run by checking whether the connection to the DUT dropped, and if so
/// whether the DUT rebooted.
pub struct BootIdDiagnoser {
    conns: Arc<dyn ConnectionManager>,
    boot_id: String,
    ping_timeout: Duration,
}

impl BootIdDiagnoser {
    /// Records the DUT's current boot ID for later comparison.
    pub async fn new(
        scope: &CancelScope,
        conns: Arc<dyn ConnectionManager>,
        ping_timeout: Duration,
    ) -> Result<Self, CmdError> {
        let boot_id = read_boot_id(scope, &conns.connection().await).await?;
        tracing::debug!(%boot_id, "recorded DUT boot ID");
        Ok(Self::with_boot_id(conns, boot_id, ping_timeout))
    }

    pub fn with_boot_id(
        conns: Arc<dyn ConnectionManager>,
        boot_id: impl Into<String>,
        ping_timeout: Duration,
    ) -> Self {
        Self {
            conns,
            boot_id: boot_id.into(),
            ping_timeout,
        }
    }

    async fn explain(&self, scope: &CancelScope) -> Option<String> {
        let current = self.conns.connection().await;
        if current.ping(scope, self.ping_timeout).await.is_ok() {
            return None;
        }

        let conn = match self.conns.reconnect_if_needed(scope).await {
            Ok(conn) => conn,
            Err(error) => {
                return Some(format!(
                    "Lost SSH connection to DUT; DUT is unreachable: {error}"
                ))
            }
        };
        let message = match read_boot_id(scope, &conn).await {
            Ok(boot_id) if boot_id != self.boot_id => {
                "Lost SSH connection to DUT: DUT rebooted".to_string()
            }
            Ok(_) => {
                "Lost SSH connection to DUT; DUT is reachable again and did not reboot".to_string()
            }
            Err(error) => format!(
                "Lost SSH connection to DUT; failed to read boot ID after reconnecting: {error}"
            ),
        };
        Some(message)
    }
}

#[async_trait]
impl Diagnoser for BootIdDiagnoser {
    async fn diagnose(&self, scope: &CancelScope, scratch_dir: &Path) -> Option<String> {
        let message = self.explain(scope).await?;
        let path = scratch_dir.join(DIAGNOSIS_FILENAME);
        if let Err(error) = tokio::fs::write(&path, format!("{message}\n")).await {
            tracing::warn!(path = %path.display(), %error, "failed to write diagnosis");
        }
        Some(message)
    }
}
