/// Cross-context channel over a byte stream: 4-byte LE length-prefixed JSON
/// frames, the native-messaging wire format.
///
/// Each frame is `{ origin, data }`. The sender stamps its own origin; the
/// receiving side decides whether to trust it.
use std::io;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

pub const MAX_FRAME_LEN: usize = 1_048_576;

const INBOUND_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub origin: String,
    pub data: Value,
}

// -- Wire format IO --

/// Read one frame. `Ok(None)` on clean EOF.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Invalid frame length: {len}"),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    let frame =
        serde_json::from_slice(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(frame))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    let json =
        serde_json::to_vec(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if json.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame too large: {} bytes", json.len()),
        ));
    }
    let len = json.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&json).await?;
    writer.flush().await
}

// -- Channel halves --

/// Outbound half of the cross-context channel.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn post(&self, data: Value) -> Result<()>;
}

/// Writes frames stamped with `origin` to a byte stream.
pub struct FramedSink<W> {
    origin: String,
    writer: Mutex<W>,
}

impl<W> FramedSink<W> {
    pub fn new(origin: impl Into<String>, writer: W) -> Self {
        Self {
            origin: origin.into(),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> MessageSink for FramedSink<W> {
    async fn post(&self, data: Value) -> Result<()> {
        let frame = Frame {
            origin: self.origin.clone(),
            data,
        };
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &frame).await.map_err(|e| {
            if e.kind() == io::ErrorKind::InvalidData {
                // Nothing was written; the stream is still usable.
                return BridgeError::Protocol(e.to_string());
            }
            warn!(error = %e, "frame write failed");
            BridgeError::ChannelClosed
        })
    }
}

/// Spawn a task that reads frames until EOF or a framing error and forwards
/// them. The receiver closes when the stream ends.
pub fn spawn_frame_reader<R>(mut reader: R) -> mpsc::Receiver<Frame>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => {
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("frame stream closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "frame read failed");
                    break;
                }
            }
        }
    });
    rx
}
