//! Body length disciplines and read-side progress tracking.

use crate::buffer::Buf;
use crate::chunked;
use crate::config::Config;
use crate::error::Error;
use crate::headers::HeaderMap;

/// Body length discipline of a message, chosen deterministically from the
/// header set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// Exactly this many bytes; zero means no body.
    Fixed(u64),
    /// RFC 7230 chunk stream terminated by a zero-length chunk.
    Chunked,
    /// Delimited by connection close (responses only).
    Eof,
}

/// Progress through one response body.
#[derive(Debug)]
pub(crate) enum BodyProgress {
    Fixed { left: u64 },
    Chunked(chunked::State),
    Eof,
}

impl BodyProgress {
    pub fn new(kind: BodyKind) -> BodyProgress {
        match kind {
            BodyKind::Fixed(n) => BodyProgress::Fixed { left: n },
            BodyKind::Chunked => BodyProgress::Chunked(chunked::State::new()),
            BodyKind::Eof => BodyProgress::Eof,
        }
    }

    /// Hand on-wire bytes to the caller instead of decoding them.
    pub fn set_raw(&mut self) {
        if let BodyProgress::Chunked(ref mut s) = *self {
            s.set_raw();
        }
    }

    /// Advance framing recognition over the buffered bytes.
    pub fn parse(
        &mut self,
        buf: &mut Buf,
        trailers: &mut HeaderMap,
        cfg: &Config,
    ) -> Result<(), Error> {
        match *self {
            BodyProgress::Chunked(ref mut s) => s.parse(buf, trailers, cfg.max_line_size),
            _ => Ok(()),
        }
    }

    /// Payload bytes ready at the buffer front, and whether the body is
    /// complete.
    pub fn available(&self, buf: &Buf, eof: bool) -> (usize, bool) {
        match *self {
            BodyProgress::Fixed { left } => (left.min(buf.len() as u64) as usize, left == 0),
            BodyProgress::Chunked(ref s) => (s.buffered(), s.is_done() && s.buffered() == 0),
            BodyProgress::Eof => (buf.len(), eof && buf.is_empty()),
        }
    }

    /// Account `n` bytes as returned to the caller.
    pub fn consume(&mut self, buf: &mut Buf, n: usize) {
        buf.consume(n);
        match *self {
            BodyProgress::Fixed { ref mut left } => {
                debug_assert!(*left >= n as u64);
                *left -= n as u64;
            }
            BodyProgress::Chunked(ref mut s) => s.consume(n),
            BodyProgress::Eof => {}
        }
    }
}
