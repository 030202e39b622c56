//! Detach key sequences.
//!
//! A detach specification is a comma separated list of keys, each either a
//! single character or `ctrl-<x>` with `<x>` one of `a-z @ [ \ ] ^ _`.
//! `ctrl-p,ctrl-q` is the usual default.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MuxError, Result};

/// Process-wide default detach sequence.
pub const DEFAULT_DETACH_KEYS: &str = "ctrl-p,ctrl-q";

/// Parse a detach specification into the byte sequence it stands for.
///
/// An empty specification yields an empty sequence, which disables detaching.
pub fn parse(spec: &str) -> Result<Vec<u8>> {
    if spec.is_empty() {
        return Ok(Vec::new());
    }

    spec.split(',').map(parse_key).collect()
}

fn parse_key(key: &str) -> Result<u8> {
    let invalid = || MuxError::InvalidDetachKeys(format!("unknown key {:?}", key));

    if let Some(rest) = key.strip_prefix("ctrl-") {
        let mut chars = rest.chars();
        let (Some(c), None) = (chars.next(), chars.next()) else {
            return Err(invalid());
        };
        return match c {
            'a'..='z' => Ok(c as u8 - b'a' + 1),
            '@' => Ok(0),
            '[' => Ok(27),
            '\\' => Ok(28),
            ']' => Ok(29),
            '^' => Ok(30),
            '_' => Ok(31),
            _ => Err(invalid()),
        };
    }

    let mut chars = key.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii() => Ok(c as u8),
        _ => Err(invalid()),
    }
}

/// Resolve the detach sequence for a session.
///
/// `None` means the caller did not ask for anything and the process default
/// applies; `Some("")` explicitly disables detaching.
pub fn resolve(requested: Option<&str>, default: &str) -> Result<Vec<u8>> {
    match requested {
        None => parse(default),
        Some(spec) => parse(spec),
    }
}

/// Incremental matcher for a detach sequence split across reads.
#[derive(Debug, Clone)]
pub struct DetachMatcher {
    keys: Vec<u8>,
    /// `fallback[i]` is the length of the longest proper prefix of `keys[..=i]`
    /// that is also a suffix of it.
    fallback: Vec<usize>,
    matched: usize,
}

/// What the caller should forward after feeding one chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum Scan {
    /// Forward these bytes; no complete sequence yet.
    Forward(Vec<u8>),
    /// Forward these bytes, then stop: the sequence was typed.
    Detach(Vec<u8>),
}

impl DetachMatcher {
    pub fn new(keys: Vec<u8>) -> Self {
        let mut fallback = vec![0; keys.len()];
        let mut len = 0;
        for i in 1..keys.len() {
            while len > 0 && keys[i] != keys[len] {
                len = fallback[len - 1];
            }
            if keys[i] == keys[len] {
                len += 1;
            }
            fallback[i] = len;
        }
        Self {
            keys,
            fallback,
            matched: 0,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.keys.is_empty()
    }

    /// Feed one chunk of client input.
    ///
    /// Bytes that might start the sequence are withheld until a mismatch
    /// releases them.
    pub fn scan(&mut self, chunk: &[u8]) -> Scan {
        if self.keys.is_empty() {
            return Scan::Forward(chunk.to_vec());
        }

        let mut out = Vec::with_capacity(chunk.len());
        for &b in chunk {
            // Shrink the withheld prefix to the longest one this byte can
            // still extend, releasing whatever falls off the front.
            while self.matched > 0 && b != self.keys[self.matched] {
                let keep = self.fallback[self.matched - 1];
                out.extend_from_slice(&self.keys[..self.matched - keep]);
                self.matched = keep;
            }

            if b != self.keys[self.matched] {
                out.push(b);
                continue;
            }
            self.matched += 1;
            if self.matched == self.keys.len() {
                self.matched = 0;
                return Scan::Detach(out);
            }
        }
        Scan::Forward(out)
    }

    /// Bytes still withheld when input ends.
    pub fn pending(&self) -> &[u8] {
        &self.keys[..self.matched]
    }
}

/// Copy client input into a container's stdin until EOF or detach.
///
/// Returns the number of bytes forwarded, or [`MuxError::Detached`] once the
/// detach sequence has been read.
pub async fn copy_detachable<R, W>(reader: &mut R, writer: &mut W, keys: Vec<u8>) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut matcher = DetachMatcher::new(keys);
    let mut buf = vec![0u8; 32 * 1024];
    let mut written = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let tail = matcher.pending().to_vec();
            if !tail.is_empty() {
                writer.write_all(&tail).await?;
                written += tail.len() as u64;
            }
            writer.flush().await?;
            return Ok(written);
        }

        match matcher.scan(&buf[..n]) {
            Scan::Forward(out) => {
                writer.write_all(&out).await?;
                written += out.len() as u64;
            }
            Scan::Detach(out) => {
                writer.write_all(&out).await?;
                writer.flush().await?;
                return Err(MuxError::Detached);
            }
        }
    }
}
