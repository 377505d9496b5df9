//! Frame Codec
//!
//! Wire format between a coordinator and an isolated context: length-prefixed
//! JSON with a CRC32 checksum.
//!
//! # Frame Format
//!
//! ```text
//! +----------------+----------------+------------------------------------------+
//! | Length (4)     | Checksum (4)   | JSON Payload (variable)                  |
//! | big-endian u32 | CRC32          | ExecutionRequest or ExecutorEvent        |
//! +----------------+----------------+------------------------------------------+
//! ```
//!
//! Length covers the JSON payload only. A frame whose checksum matches but
//! whose JSON does not parse is consumed, so the stream stays aligned and
//! the caller can report the bad frame and carry on. Oversized frames and
//! checksum mismatches mean the stream itself is no longer trustworthy.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::TransportError;

/// Maximum payload size of one frame (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Frame header size: 4 bytes length + 4 bytes checksum
const HEADER_SIZE: usize = 8;

/// Minimum buffer capacity for the decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Read chunk size for [`FrameReader`]
const READ_CHUNK: usize = 8192;

/// Encode a message into one frame
///
/// # Errors
///
/// `SerializationError` if serialization fails, `FrameTooLarge` if the
/// payload exceeds [`MAX_FRAME_SIZE`].
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, TransportError> {
    let json =
        serde_json::to_vec(msg).map_err(|e| TransportError::SerializationError(e.to_string()))?;

    let len = u32::try_from(json.len())
        .ok()
        .filter(|_| json.len() <= MAX_FRAME_SIZE)
        .ok_or(TransportError::FrameTooLarge {
            size: json.len(),
            max: MAX_FRAME_SIZE,
        })?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&crc32fast::hash(&json).to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Streaming frame decoder
///
/// Buffers incoming bytes and yields complete messages.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    read_pos: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
        }
    }

    /// Append bytes
    pub fn push(&mut self, data: &[u8]) {
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet decoded
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Decode the next frame
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        if self.available() < HEADER_SIZE {
            return Ok(None);
        }

        let header = &self.buffer[self.read_pos..self.read_pos + HEADER_SIZE];
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

        if len > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        if self.available() < HEADER_SIZE + len {
            return Ok(None);
        }

        let start = self.read_pos + HEADER_SIZE;
        let end = start + len;
        let payload = &self.buffer[start..end];

        let actual = crc32fast::hash(payload);
        if actual != expected {
            return Err(TransportError::ChecksumMismatch { expected, actual });
        }

        let parsed = serde_json::from_slice(payload);
        self.read_pos = end;
        parsed
            .map(Some)
            .map_err(|e| TransportError::SerializationError(e.to_string()))
    }

    /// Drop all buffered bytes
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }
}

/// Reads frames from an async byte stream
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a byte stream
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
        }
    }

    /// Read the next message
    ///
    /// Returns `Ok(None)` on a clean end of stream.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` when the stream ends inside a frame, plus anything
    /// [`FrameDecoder::decode`] reports.
    pub async fn read_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(msg) = self.decoder.decode()? {
                return Ok(Some(msg));
            }

            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if self.decoder.available() > 0 {
                    return Err(TransportError::ConnectionClosed(format!(
                        "stream ended inside a frame ({} bytes buffered)",
                        self.decoder.available()
                    )));
                }
                return Ok(None);
            }
            self.decoder.push(&chunk[..n]);
        }
    }
}

/// Writes frames to an async byte stream
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a byte stream
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encode and flush one message
    pub async fn write_frame<T: Serialize>(&mut self, msg: &T) -> Result<(), TransportError> {
        let bytes = encode(msg)?;
        self.write_encoded(&bytes).await
    }

    /// Flush one frame produced by [`encode`]
    pub async fn write_encoded(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write half
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
