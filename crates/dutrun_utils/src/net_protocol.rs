//! Simple read/write protocol for framed messages across process and network boundaries.
//! The first 4 bytes of any message is the size of the message (in big-endian order).
//! The rest of the message are the contents, which are serde-serialized json.
//!
//! A stream that ends exactly on a frame boundary is a clean end of stream; a stream that
//! ends anywhere else is [FrameError::Truncated].

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are rejected before their body is read.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("stream ended in the middle of a frame")]
    Truncated,
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    TooLarge(u32),
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Serializes a message into a single frame.
pub fn encode<T: serde::Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
    let msg_json = serde_json::to_vec(msg)?;

    let msg_size = msg_json.len();
    if msg_size > MAX_FRAME_SIZE as usize {
        return Err(FrameError::TooLarge(msg_size as u32));
    }
    let msg_size_buf = u32::to_be_bytes(msg_size as u32);

    let mut msg_buf = Vec::with_capacity(4 + msg_size);
    msg_buf.extend_from_slice(&msg_size_buf);
    msg_buf.extend_from_slice(&msg_json);
    Ok(msg_buf)
}

/// Reads the next message from a stream. Returns [None] if the stream ended cleanly before
/// the next frame began.
///
/// **Not** cancel-safe: dropping the future mid-frame loses the partially read frame.
pub async fn async_read<R, T>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut msg_size_buf = [0; 4];
    let mut filled = 0;
    while filled < msg_size_buf.len() {
        let n = reader.read(&mut msg_size_buf[filled..]).await?;
        if n == 0 {
            return match filled {
                0 => Ok(None),
                _ => Err(FrameError::Truncated),
            };
        }
        filled += n;
    }

    let msg_size = u32::from_be_bytes(msg_size_buf);
    if msg_size > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(msg_size));
    }

    let mut msg_buf = vec![0; msg_size as usize];
    match reader.read_exact(&mut msg_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(FrameError::Truncated),
        Err(e) => return Err(e.into()),
    }

    let msg = serde_json::from_slice(&msg_buf)?;
    Ok(Some(msg))
}

/// Writes a message to a stream as a single frame.
pub async fn async_write<W, T>(writer: &mut W, msg: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let msg_buf = encode(msg)?;
    writer.write_all(&msg_buf).await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use serde_derive::{Deserialize, Serialize};

    use super::{async_read, async_write, encode, FrameError, MAX_FRAME_SIZE};

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Ping {
        seq: u32,
        body: String,
    }

    #[tokio::test]
    async fn reads_frames_until_clean_end() {
        let mut buf = Vec::new();
        for seq in 0..2 {
            let msg = Ping {
                seq,
                body: "hello".to_string(),
            };
            async_write(&mut buf, &msg).await.unwrap();
        }

        let mut reader = &buf[..];
        let first: Option<Ping> = async_read(&mut reader).await.unwrap();
        let second: Option<Ping> = async_read(&mut reader).await.unwrap();
        let end: Option<Ping> = async_read(&mut reader).await.unwrap();

        assert_eq!(first.unwrap().seq, 0);
        assert_eq!(second.unwrap().seq, 1);
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let frame = encode(&Ping {
            seq: 1,
            body: "cut short".to_string(),
        })
        .unwrap();
        let mut reader = &frame[..frame.len() - 3];

        let result: Result<Option<Ping>, _> = async_read(&mut reader).await;
        assert!(matches!(result, Err(FrameError::Truncated)));
    }

    #[tokio::test]
    async fn truncated_length_prefix_is_an_error() {
        let mut reader: &[u8] = &[0, 0];

        let result: Result<Option<Ping>, _> = async_read(&mut reader).await;
        assert!(matches!(result, Err(FrameError::Truncated)));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_reading_body() {
        let size = (MAX_FRAME_SIZE + 1).to_be_bytes();
        let mut reader = &size[..];

        let result: Result<Option<Ping>, _> = async_read(&mut reader).await;
        assert!(matches!(result, Err(FrameError::TooLarge(n)) if n == MAX_FRAME_SIZE + 1));
    }

    #[tokio::test]
    async fn garbage_body_is_a_decode_error() {
        let mut frame = 4u32.to_be_bytes().to_vec();
        frame.extend_from_slice(b"nope");
        let mut reader = &frame[..];

        let result: Result<Option<Ping>, _> = async_read(&mut reader).await;
        assert!(matches!(result, Err(FrameError::Decode(_))));
    }
}
