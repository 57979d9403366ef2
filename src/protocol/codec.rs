//! Frame codec
//!
//! Every message on the wire is `[length: u32 LE][body]`. Whether the length
//! counts its own four bytes is decided once by [`LengthPrefix`] and applied
//! to both directions of a connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum frame body size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Width of the length prefix
pub const PREFIX_SIZE: usize = 4;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("Connection closed mid-frame")]
    ConnectionClosed,

    #[error("Timed out waiting for the rest of a frame")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Meaning of the 4-byte length prefix
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthPrefix {
    /// Prefix holds the body length only (FlatBuffers size-prefixed finish)
    #[default]
    Exclusive,
    /// Prefix holds the body length plus the prefix itself
    Inclusive,
}

impl LengthPrefix {
    fn overhead(self) -> usize {
        match self {
            LengthPrefix::Exclusive => 0,
            LengthPrefix::Inclusive => PREFIX_SIZE,
        }
    }

    /// Prefix value to write for a body of `len` bytes
    pub fn prefix_for(self, len: usize) -> CodecResult<u32> {
        if len > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(len, MAX_FRAME_SIZE));
        }
        // MAX_FRAME_SIZE + 4 fits in u32
        Ok((len + self.overhead()) as u32)
    }

    /// Body length announced by a prefix; zero or less means an empty frame
    pub fn body_len(self, prefix: u32) -> i64 {
        i64::from(prefix) - self.overhead() as i64
    }
}

/// Writes length-prefixed frames
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameEncoder {
    convention: LengthPrefix,
}

impl FrameEncoder {
    pub fn new(convention: LengthPrefix) -> Self {
        Self { convention }
    }

    /// Append one framed body to `buf`
    pub fn encode(&self, body: &[u8], buf: &mut BytesMut) -> CodecResult<()> {
        let prefix = self.convention.prefix_for(body.len())?;
        buf.reserve(PREFIX_SIZE + body.len());
        buf.put_u32_le(prefix);
        buf.put_slice(body);
        Ok(())
    }
}

/// Reassembles frames from a byte stream
#[derive(Debug, Default)]
pub struct FrameDecoder {
    convention: LengthPrefix,
    state: DecodeState,
}

#[derive(Debug, Default, Clone, Copy)]
enum DecodeState {
    #[default]
    Prefix,
    Body {
        length: usize,
    },
}

impl FrameDecoder {
    pub fn new(convention: LengthPrefix) -> Self {
        Self {
            convention,
            state: DecodeState::Prefix,
        }
    }

    /// Attempt to decode a frame body from the buffer
    ///
    /// Returns `Ok(None)` if more data is needed. A prefix announcing zero
    /// or fewer body bytes yields an empty body.
    pub fn decode(&mut self, buf: &mut BytesMut) -> CodecResult<Option<Bytes>> {
        loop {
            match self.state {
                DecodeState::Prefix => {
                    if buf.len() < PREFIX_SIZE {
                        return Ok(None);
                    }

                    let prefix = buf.get_u32_le();
                    let length = self.convention.body_len(prefix);
                    if length <= 0 {
                        return Ok(Some(Bytes::new()));
                    }

                    let length = length as usize;
                    if length > MAX_FRAME_SIZE {
                        return Err(CodecError::FrameTooLarge(length, MAX_FRAME_SIZE));
                    }

                    self.state = DecodeState::Body { length };
                }
                DecodeState::Body { length } => {
                    if buf.len() < length {
                        buf.reserve(length - buf.len());
                        return Ok(None);
                    }

                    self.state = DecodeState::Prefix;
                    return Ok(Some(buf.split_to(length).freeze()));
                }
            }
        }
    }

    /// Whether a frame has started but not completed
    pub fn is_mid_frame(&self, buf: &BytesMut) -> bool {
        matches!(self.state, DecodeState::Body { .. }) || !buf.is_empty()
    }
}

/// Pulls whole frames off an async byte stream
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    buf: BytesMut,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, convention: LengthPrefix) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(convention),
            buf: BytesMut::with_capacity(4096),
            bytes_read: 0,
        }
    }

    /// Total bytes pulled off the stream
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Read the next frame body
    ///
    /// Returns `Ok(None)` when the peer closes between frames. Once part of a
    /// frame has arrived, each further read must complete within
    /// `read_timeout`; a stall yields [`CodecError::Timeout`] and a close
    /// yields [`CodecError::ConnectionClosed`]. Buffered bytes survive if
    /// this future is dropped, so it can sit inside `tokio::select!`.
    pub async fn next_frame(&mut self, read_timeout: Duration) -> CodecResult<Option<Bytes>> {
        loop {
            if let Some(body) = self.decoder.decode(&mut self.buf)? {
                return Ok(Some(body));
            }

            self.buf.reserve(4096);
            let n = if self.decoder.is_mid_frame(&self.buf) {
                tokio::time::timeout(read_timeout, self.reader.read_buf(&mut self.buf))
                    .await
                    .map_err(|_| CodecError::Timeout)??
            } else {
                self.reader.read_buf(&mut self.buf).await?
            };

            if n == 0 {
                return if self.decoder.is_mid_frame(&self.buf) {
                    Err(CodecError::ConnectionClosed)
                } else {
                    Ok(None)
                };
            }

            self.bytes_read += n as u64;
        }
    }
}
