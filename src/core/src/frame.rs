//! Multiplexed stream framing.
//!
//! Carries several logical streams (stdin, stdout, stderr, resize, quit) over
//! one duplex connection.
//!
//! Wire format: `[tag: u8] [0u8; 3] [length: u32 BE] [payload: length bytes]`
//!
//! The tag byte is transport specific. The HTTP compat transport numbers
//! streams like Docker (`0=stdin, 1=stdout, 2=stderr`), while the upgraded
//! RPC transport uses `0=stdout, 1=stdin, 2=stderr, 3=resize, 4=quit`. A
//! [`FrameCodec`] is built with one [`TagTable`] and never assumes the other.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MuxError, Result};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 8;

/// Default upper bound on a single decoded payload: 32 MiB.
pub const DEFAULT_MAX_FRAME_PAYLOAD: usize = 32 * 1024 * 1024;

/// Logical channel a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
    /// Terminal resize; payload is a JSON `TerminalSize`.
    Resize,
    /// Session hang-up; payload is a 4-byte big-endian exit code.
    Quit,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdin => "stdin",
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
            StreamKind::Resize => "resize",
            StreamKind::Quit => "quit",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed mapping between logical stream kinds and wire tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagTable {
    name: &'static str,
    entries: &'static [(StreamKind, u8)],
    /// Kind assumed for tags this table does not know.
    fallback: StreamKind,
}

/// Tags used on hijacked HTTP connections (Docker compatible).
pub const COMPAT_TAGS: TagTable = TagTable {
    name: "compat",
    entries: &[
        (StreamKind::Stdin, 0),
        (StreamKind::Stdout, 1),
        (StreamKind::Stderr, 2),
    ],
    fallback: StreamKind::Stderr,
};

/// Tags used on upgraded RPC connections.
pub const UPGRADED_TAGS: TagTable = TagTable {
    name: "upgraded",
    entries: &[
        (StreamKind::Stdout, 0),
        (StreamKind::Stdin, 1),
        (StreamKind::Stderr, 2),
        (StreamKind::Resize, 3),
        (StreamKind::Quit, 4),
    ],
    fallback: StreamKind::Stderr,
};

impl TagTable {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wire tag for `kind`, or `None` if this transport cannot carry it.
    pub fn tag(&self, kind: StreamKind) -> Option<u8> {
        self.entries
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, tag)| *tag)
    }

    /// Logical kind for a wire tag. Unknown tags map to the fallback kind so
    /// that a newer peer cannot abort the stream.
    pub fn kind(&self, tag: u8) -> StreamKind {
        self.entries
            .iter()
            .find(|(_, t)| *t == tag)
            .map(|(kind, _)| *kind)
            .unwrap_or(self.fallback)
    }

    pub fn carries(&self, kind: StreamKind) -> bool {
        self.tag(kind).is_some()
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: StreamKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: StreamKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }
}

/// Encoder/decoder for one transport's tag numbering.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    tags: TagTable,
    max_payload: usize,
}

impl FrameCodec {
    pub const fn new(tags: TagTable) -> Self {
        Self {
            tags,
            max_payload: DEFAULT_MAX_FRAME_PAYLOAD,
        }
    }

    pub const fn compat() -> Self {
        Self::new(COMPAT_TAGS)
    }

    pub const fn upgraded() -> Self {
        Self::new(UPGRADED_TAGS)
    }

    /// Limit accepted payload size when decoding.
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn tags(&self) -> &TagTable {
        &self.tags
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Append one encoded frame to `dst`.
    ///
    /// Payloads must be chunked below `u32::MAX` by the caller.
    pub fn encode_into(&self, kind: StreamKind, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
        let tag = self.tags.tag(kind).ok_or_else(|| {
            MuxError::Framing(format!(
                "{} transport cannot carry {} frames",
                self.tags.name, kind
            ))
        })?;
        let len = u32::try_from(payload.len()).map_err(|_| {
            MuxError::Framing(format!(
                "payload of {} bytes exceeds frame length field",
                payload.len()
            ))
        })?;

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(tag);
        dst.put_bytes(0, 3);
        dst.put_u32(len);
        dst.put_slice(payload);
        Ok(())
    }

    /// Encode one frame into a fresh buffer.
    pub fn encode(&self, kind: StreamKind, payload: &[u8]) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        self.encode_into(kind, payload, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one frame from an accumulation buffer.
    ///
    /// Returns `Ok(None)` while `src` holds less than a complete frame; bytes
    /// are only consumed once a whole frame is available.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = self.payload_len(&src[..HEADER_LEN])?;
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        let kind = self.tags.kind(src[0]);
        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { kind, payload }))
    }

    /// Read the next frame from `r`.
    ///
    /// Returns `Ok(None)` on a clean EOF at a frame boundary. EOF inside a
    /// header or payload is a framing error.
    pub async fn read_frame<R>(&self, r: &mut R) -> Result<Option<Frame>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = r.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(MuxError::Framing(format!(
                    "short header: got {} of {} bytes",
                    filled, HEADER_LEN
                )));
            }
            filled += n;
        }

        let len = self.payload_len(&header)?;
        let mut payload = vec![0u8; len];
        if len > 0 {
            r.read_exact(&mut payload).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    MuxError::Framing(format!("truncated payload: expected {} bytes", len))
                } else {
                    MuxError::Io(e)
                }
            })?;
        }

        Ok(Some(Frame {
            kind: self.tags.kind(header[0]),
            payload: payload.into(),
        }))
    }

    fn payload_len(&self, header: &[u8]) -> Result<usize> {
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if len > self.max_payload {
            return Err(MuxError::Framing(format!(
                "frame too large: {} bytes (max {})",
                len, self.max_payload
            )));
        }
        Ok(len)
    }
}

/// Payload of a quit frame.
pub fn encode_exit_code(code: i32) -> [u8; 4] {
    (code as u32).to_be_bytes()
}

/// Parse the payload of a quit frame.
pub fn decode_exit_code(payload: &[u8]) -> Result<i32> {
    let bytes: [u8; 4] = payload.try_into().map_err(|_| {
        MuxError::Framing(format!(
            "quit payload must be 4 bytes, got {}",
            payload.len()
        ))
    })?;
    Ok(u32::from_be_bytes(bytes) as i32)
}

/// Type-erased write half of a hijacked connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of a connection shared by every stream of one session.
///
/// Each frame is encoded and written while holding the connection lock, so
/// frames from concurrent streams never interleave.
pub struct FrameWriter {
    codec: FrameCodec,
    inner: tokio::sync::Mutex<BoxedWriter>,
}

impl FrameWriter {
    pub fn new<W>(codec: FrameCodec, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            codec,
            inner: tokio::sync::Mutex::new(Box::new(writer)),
        }
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    /// Encode and write one frame.
    pub async fn write_frame(&self, kind: StreamKind, payload: &[u8]) -> Result<()> {
        let frame = self.codec.encode(kind, payload)?;
        let mut w = self.inner.lock().await;
        w.write_all(&frame).await?;
        w.flush().await?;
        Ok(())
    }

    /// Write bytes without framing (terminal sessions and error reports).
    pub async fn write_raw(&self, data: &[u8]) -> Result<()> {
        let mut w = self.inner.lock().await;
        w.write_all(data).await?;
        w.flush().await?;
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        self.inner.lock().await.flush().await?;
        Ok(())
    }

    /// Flush and close the write direction.
    pub async fn shutdown(&self) -> Result<()> {
        let mut w = self.inner.lock().await;
        w.flush().await?;
        w.shutdown().await?;
        Ok(())
    }
}

impl fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameWriter")
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}
