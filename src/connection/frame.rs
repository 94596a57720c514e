//! Frame codec.
//!
//! A frame is a 10-byte ASCII header followed by the payload:
//!
//! ```text
//! LLLLLL_CC_<payload>
//! ```
//!
//! `LLLLLL` is the payload length and `CC` the code, both lowercase hex,
//! right-aligned and space padded.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::{ConnectionError, ConnectionResult};
use crate::protocol::CodeClass;

/// Header size in bytes.
pub const HEADER_LEN: usize = 10;

/// Largest payload expressible in the header.
pub const MAX_PAYLOAD: usize = 0xff_ffff;

/// Initial size of the reader's payload buffer.
const INITIAL_READ_BUFFER: usize = 32 * 1024;

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(code: u8, payload: Vec<u8>) -> Self {
        Self { code, payload }
    }

    /// Signal-only frame.
    pub fn empty(code: u8) -> Self {
        Self {
            code,
            payload: Vec::new(),
        }
    }

    pub fn class(&self) -> CodeClass {
        CodeClass::of(self.code)
    }

    /// Format the header for this frame.
    pub fn header(&self) -> ConnectionResult<String> {
        encode_header(self.payload.len(), self.code)
    }

    /// Header and payload as one buffer.
    pub fn to_bytes(&self) -> ConnectionResult<Vec<u8>> {
        let header = self.header()?;
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len());
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }
}

/// Format a header for a payload of `len` bytes.
pub fn encode_header(len: usize, code: u8) -> ConnectionResult<String> {
    if len > MAX_PAYLOAD {
        return Err(ConnectionError::PayloadTooLarge(len));
    }
    Ok(format!("{:>6x}_{:>2x}_", len, code))
}

/// Parse a header into `(payload length, code)`.
pub fn parse_header(header: &[u8; HEADER_LEN]) -> ConnectionResult<(usize, u8)> {
    let bad = || ConnectionError::BadHeader(String::from_utf8_lossy(header).into_owned());

    if header[6] != b'_' || header[9] != b'_' {
        return Err(bad());
    }
    let len = hex_field(&header[0..6]).ok_or_else(bad)?;
    let code = hex_field(&header[7..9])
        .and_then(|code| u8::try_from(code).ok())
        .ok_or_else(bad)?;
    Ok((len, code))
}

/// Space-padded hex number. Padding may only lead and at least one digit
/// must follow it.
fn hex_field(field: &[u8]) -> Option<usize> {
    let start = field.iter().position(|&b| b != b' ')?;
    field[start..].iter().try_fold(0usize, |acc, &b| {
        let digit = char::from(b).to_digit(16)?;
        Some(acc * 16 + digit as usize)
    })
}

/// Reads frames from a byte stream.
///
/// The payload buffer starts at a fixed size and grows once for an oversized
/// payload; the grown buffer is kept for later frames.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: vec![0; INITIAL_READ_BUFFER],
        }
    }

    /// Current capacity of the payload buffer.
    pub fn buffer_len(&self) -> usize {
        self.buf.len()
    }

    /// Read the next frame. `Ok(None)` means the peer closed the stream,
    /// including a close in the middle of a frame.
    pub async fn read_frame(&mut self) -> ConnectionResult<Option<Frame>> {
        let mut header = [0u8; HEADER_LEN];
        match self.inner.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let (len, code) = parse_header(&header)?;
        if len > self.buf.len() {
            self.buf.resize(len, 0);
        }

        match self.inner.read_exact(&mut self.buf[..len]).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::debug!(expected = len, "stream closed inside a frame");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Some(Frame::new(code, self.buf[..len].to_vec())))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writes frames to a byte stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> ConnectionResult<()> {
        let header = frame.header()?;
        self.inner.write_all(header.as_bytes()).await?;
        self.inner.write_all(&frame.payload).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> ConnectionResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
