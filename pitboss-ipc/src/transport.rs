//! Length-prefixed JSON framing
//!
//! Every frame is a 4-byte big-endian body length followed by a JSON body.

use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::IpcError;
use crate::protocol::MAX_FRAME_BYTES;

/// Encode a message into a single frame
pub fn encode_frame<T: Serialize>(message: &T) -> Result<BytesMut, IpcError> {
    let body =
        serde_json::to_vec(message).map_err(|e| IpcError::SerializationError(e.to_string()))?;

    if body.len() > MAX_FRAME_BYTES {
        return Err(IpcError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_BYTES,
        });
    }

    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32(body.len() as u32);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Reading half of a framed connection
pub struct FrameReader<R> {
    inner: R,
    max_frame_bytes: usize,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    /// Read one raw frame body. `None` means the peer closed the stream on a
    /// frame boundary.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, IpcError> {
        let length = match self.inner.read_u32().await {
            Ok(length) => length as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if length > self.max_frame_bytes {
            return Err(IpcError::FrameTooLarge {
                size: length,
                max: self.max_frame_bytes,
            });
        }

        let mut body = vec![0u8; length];
        self.inner.read_exact(&mut body).await?;
        Ok(Some(body))
    }

    /// Read and decode the next message
    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<T, IpcError> {
        let body = self.read_frame().await?.ok_or(IpcError::ConnectionClosed)?;
        serde_json::from_slice(&body).map_err(|e| IpcError::DeserializationError(e.to_string()))
    }
}

/// Writing half of a framed connection
pub struct FrameWriter<W> {
    inner: Option<W>,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W) -> Self {
        Self { inner: Some(inner) }
    }

    /// Encode and flush one message
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), IpcError> {
        let writer = self.inner.as_mut().ok_or(IpcError::NotConnected)?;
        let frame = encode_frame(message)?;

        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Shut down and drop the underlying stream; the peer sees EOF
    pub async fn close(&mut self) -> Result<(), IpcError> {
        if let Some(mut writer) = self.inner.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}
