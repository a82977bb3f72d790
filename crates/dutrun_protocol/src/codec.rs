//! Reader and writer halves of the control message stream.

use chrono::Utc;
use dutrun_utils::net_protocol::{self, FrameError};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::{
    entity::Entity,
    message::{ControlMessage, ErrorInfo},
    timing::TimingLog,
};

/// Writes control messages, one frame each, flushing after every message so that a reader
/// sees events as soon as they happen.
pub struct ControlWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> ControlWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write(&mut self, msg: &ControlMessage) -> Result<(), FrameError> {
        net_protocol::async_write(&mut self.inner, msg).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn run_start(&mut self, test_names: Vec<String>) -> Result<(), FrameError> {
        let num_tests = test_names.len();
        self.write(&ControlMessage::RunStart {
            time: Utc::now(),
            test_names,
            num_tests,
        })
        .await
    }

    pub async fn run_log(&mut self, text: impl Into<String>) -> Result<(), FrameError> {
        self.write(&ControlMessage::RunLog {
            time: Utc::now(),
            text: text.into(),
        })
        .await
    }

    pub async fn run_error(&mut self, error: ErrorInfo) -> Result<(), FrameError> {
        self.write(&ControlMessage::RunError {
            time: Utc::now(),
            error,
        })
        .await
    }

    pub async fn entity_start(
        &mut self,
        info: Entity,
        out_dir: impl Into<String>,
    ) -> Result<(), FrameError> {
        self.write(&ControlMessage::EntityStart {
            time: Utc::now(),
            info,
            out_dir: out_dir.into(),
        })
        .await
    }

    pub async fn entity_log(
        &mut self,
        name: &str,
        text: impl Into<String>,
    ) -> Result<(), FrameError> {
        self.write(&ControlMessage::EntityLog {
            time: Utc::now(),
            name: name.to_string(),
            text: text.into(),
        })
        .await
    }

    pub async fn entity_error(&mut self, name: &str, error: ErrorInfo) -> Result<(), FrameError> {
        self.write(&ControlMessage::EntityError {
            time: Utc::now(),
            name: name.to_string(),
            error,
        })
        .await
    }

    pub async fn entity_end(
        &mut self,
        name: &str,
        skip_reasons: Vec<String>,
        timing_log: Option<TimingLog>,
    ) -> Result<(), FrameError> {
        self.write(&ControlMessage::EntityEnd {
            time: Utc::now(),
            name: name.to_string(),
            skip_reasons,
            deprecated_missing_software_deps: vec![],
            timing_log,
        })
        .await
    }

    pub async fn run_end(&mut self) -> Result<(), FrameError> {
        self.write(&ControlMessage::RunEnd { time: Utc::now() }).await
    }

    pub async fn heartbeat(&mut self) -> Result<(), FrameError> {
        self.write(&ControlMessage::Heartbeat { time: Utc::now() }).await
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reads control messages from a byte stream.
pub struct ControlReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> ControlReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    /// Whether another message follows. Returns `false` only on a clean end of stream.
    pub async fn more(&mut self) -> Result<bool, FrameError> {
        let buf = self.inner.fill_buf().await?;
        Ok(!buf.is_empty())
    }

    /// Reads the next message, or [None] at a clean end of stream. A stream cut off in the
    /// middle of a message is [FrameError::Truncated].
    pub async fn read(&mut self) -> Result<Option<ControlMessage>, FrameError> {
        net_protocol::async_read(&mut self.inner).await
    }
}

#[cfg(test)]
mod test {
    use dutrun_utils::net_protocol::FrameError;

    use super::{ControlReader, ControlWriter};
    use crate::{entity::Entity, message::ControlMessage};

    #[tokio::test]
    async fn more_is_false_only_at_clean_end() {
        let mut writer = ControlWriter::new(Vec::new());
        writer.run_start(vec!["pkg.Test".to_string()]).await.unwrap();
        writer
            .entity_start(Entity::test("pkg.Test", "cros", ""), "/tmp/out")
            .await
            .unwrap();
        writer.run_end().await.unwrap();
        let bytes = writer.into_inner();

        let mut reader = ControlReader::new(&bytes[..]);
        let mut kinds = vec![];
        while reader.more().await.unwrap() {
            kinds.push(reader.read().await.unwrap().unwrap().kind());
        }
        assert_eq!(kinds, ["RunStart", "EntityStart", "RunEnd"]);
        assert!(reader.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_stream_reports_more_then_fails() {
        let mut writer = ControlWriter::new(Vec::new());
        writer.heartbeat().await.unwrap();
        let bytes = writer.into_inner();
        let cut = &bytes[..bytes.len() - 1];

        let mut reader = ControlReader::new(cut);
        assert!(reader.more().await.unwrap());
        assert!(matches!(reader.read().await, Err(FrameError::Truncated)));
    }

    #[tokio::test]
    async fn run_start_carries_count_for_legacy_readers() {
        let mut writer = ControlWriter::new(Vec::new());
        writer
            .run_start(vec!["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        let bytes = writer.into_inner();

        let mut reader = ControlReader::new(&bytes[..]);
        match reader.read().await.unwrap() {
            Some(ControlMessage::RunStart { num_tests, .. }) => assert_eq!(num_tests, 2),
            other => panic!("unexpected message {other:?}"),
        }
    }
}
