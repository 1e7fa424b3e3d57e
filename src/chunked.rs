//! Incremental decoder for chunked transfer encoding.

use matches::matches;

use crate::buffer::{find, Buf};
use crate::error::{Error, InvalidResponse};
use crate::headers::HeaderMap;

/// Headers accepted in a trailer block.
const MAX_TRAILERS: usize = 64;

#[derive(Debug)]
enum Phase {
    Size,
    Data,
    DataEnd,
    Trailer,
    Done,
}

/// Decoding state for one chunked body.
///
/// In decoded mode framing bytes are stripped from the buffer as they are
/// recognized, so the unread prefix is always payload. In raw mode framing
/// stays in place and is merely accounted for, which is what `read_raw`
/// hands to the caller.
#[derive(Debug)]
pub struct State {
    /// Bytes at the buffer front already accounted to the caller.
    buffered: usize,
    /// Payload bytes of the current chunk still on the wire.
    pending: u64,
    phase: Phase,
    raw: bool,
}

impl State {
    pub fn new() -> State {
        State {
            buffered: 0,
            pending: 0,
            phase: Phase::Size,
            raw: false,
        }
    }

    pub(crate) fn set_raw(&mut self) {
        self.raw = true;
    }

    pub fn is_done(&self) -> bool {
        matches!(self.phase, Phase::Done)
    }

    pub fn buffered(&self) -> usize {
        self.buffered
    }

    pub fn consume(&mut self, n: usize) {
        assert!(self.buffered >= n);
        self.buffered -= n;
    }

    /// Advance over whatever the buffer holds.
    pub(crate) fn parse(
        &mut self,
        buf: &mut Buf,
        trailers: &mut HeaderMap,
        max_line: usize,
    ) -> Result<(), Error> {
        loop {
            match self.phase {
                Phase::Size => {
                    let (consumed, size) = match httparse::parse_chunk_size(&buf[self.buffered..])
                    {
                        Ok(httparse::Status::Complete(v)) => v,
                        Ok(httparse::Status::Partial) => {
                            if buf.len() - self.buffered > max_line {
                                return Err(InvalidResponse::LineTooLong.into());
                            }
                            return Ok(());
                        }
                        Err(e) => return Err(InvalidResponse::ChunkSize(e).into()),
                    };
                    self.eat(buf, consumed);
                    if size == 0 {
                        self.phase = Phase::Trailer;
                    } else {
                        self.pending = size;
                        self.phase = Phase::Data;
                    }
                }
                Phase::Data => {
                    let avail = (buf.len() - self.buffered) as u64;
                    if avail == 0 {
                        return Ok(());
                    }
                    let take = avail.min(self.pending) as usize;
                    self.buffered += take; // payload stays put in both modes
                    self.pending -= take as u64;
                    if self.pending > 0 {
                        return Ok(());
                    }
                    self.phase = Phase::DataEnd;
                }
                Phase::DataEnd => {
                    if buf.len() - self.buffered < 2 {
                        return Ok(());
                    }
                    if &buf[self.buffered..self.buffered + 2] != b"\r\n" {
                        return Err(InvalidResponse::MissingChunkDelimiter.into());
                    }
                    self.eat(buf, 2);
                    self.phase = Phase::Size;
                }
                Phase::Trailer => {
                    if !self.parse_trailers(buf, trailers, max_line)? {
                        return Ok(());
                    }
                    self.phase = Phase::Done;
                }
                Phase::Done => return Ok(()),
            }
        }
    }

    // Swallow framing bytes: strip them in decoded mode, keep and count
    // them in raw mode.
    fn eat(&mut self, buf: &mut Buf, n: usize) {
        if self.raw {
            self.buffered += n;
        } else {
            buf.remove_range(self.buffered..self.buffered + n);
        }
    }

    // Returns true once the (possibly empty) trailer block is complete.
    fn parse_trailers(
        &mut self,
        buf: &mut Buf,
        trailers: &mut HeaderMap,
        max_block: usize,
    ) -> Result<bool, Error> {
        let start = self.buffered;
        let end = if buf[start..].starts_with(b"\r\n") {
            start + 2
        } else {
            match find(&buf[start..], b"\r\n\r\n") {
                Some(p) => start + p + 4,
                None => {
                    if buf.len() - start > max_block {
                        return Err(InvalidResponse::HeadersTooLong.into());
                    }
                    return Ok(false);
                }
            }
        };
        if self.raw {
            // the caller gets the raw block; no header parsing
            self.buffered += end - start;
            return Ok(true);
        }
        let end = crate::parser::unfold(buf, start, end);
        let mut hdrs = [httparse::EMPTY_HEADER; MAX_TRAILERS];
        match httparse::parse_headers(&buf[start..end], &mut hdrs) {
            Ok(httparse::Status::Complete((n, parsed))) => {
                for h in parsed {
                    if let Err(name) = trailers.add_wire(h.name, h.value) {
                        return Err(InvalidResponse::DuplicateHeader(name).into());
                    }
                }
                buf.remove_range(start..start + n);
                Ok(true)
            }
            // the terminator was found above, so a partial parse means the
            // block itself is malformed
            Ok(httparse::Status::Partial) => Err(InvalidResponse::HeadersTooLong.into()),
            Err(e) => Err(InvalidResponse::Header(e).into()),
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use matches::matches;

    use super::State;
    use crate::buffer::Buf;
    use crate::error::{Error, InvalidResponse};
    use crate::headers::HeaderMap;

    const WIRE: &[u8] = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";

    fn drain(state: &mut State, buf: &mut Buf) -> Vec<u8> {
        let mut out = Vec::new();
        let n = state.buffered();
        out.extend_from_slice(&buf[..n]);
        buf.consume(n);
        state.consume(n);
        out
    }

    #[test]
    fn decodes_whole_body() {
        let mut buf = Buf::new();
        buf.write_all(WIRE).unwrap();
        let mut trailers = HeaderMap::new();
        let mut state = State::new();
        state.parse(&mut buf, &mut trailers, 65536).unwrap();
        let body = drain(&mut state, &mut buf);
        assert_eq!(body, b"hello world".to_vec());
        assert!(state.is_done());
        assert!(buf.is_empty());
        assert!(trailers.is_empty());
    }

    #[test]
    fn decodes_byte_by_byte() {
        let mut buf = Buf::new();
        let mut trailers = HeaderMap::new();
        let mut state = State::new();
        let mut body = Vec::new();
        for &b in WIRE {
            buf.write_all(&[b]).unwrap();
            state.parse(&mut buf, &mut trailers, 65536).unwrap();
            body.extend(drain(&mut state, &mut buf));
        }
        assert_eq!(body, b"hello world".to_vec());
        assert!(state.is_done());
    }

    #[test]
    fn chunk_extensions_are_ignored() {
        let mut buf = Buf::new();
        buf.write_all(b"5;name=value\r\nhello\r\n0\r\n\r\n").unwrap();
        let mut trailers = HeaderMap::new();
        let mut state = State::new();
        state.parse(&mut buf, &mut trailers, 65536).unwrap();
        assert_eq!(drain(&mut state, &mut buf), b"hello".to_vec());
        assert!(state.is_done());
    }

    #[test]
    fn trailers_are_collected() {
        let mut buf = Buf::new();
        buf.write_all(b"3\r\nabc\r\n0\r\nX-Check: sum\r\nX-More: yes\r\n\r\n")
            .unwrap();
        let mut trailers = HeaderMap::new();
        let mut state = State::new();
        state.parse(&mut buf, &mut trailers, 65536).unwrap();
        assert_eq!(drain(&mut state, &mut buf), b"abc".to_vec());
        assert!(state.is_done());
        assert_eq!(trailers.get("x-check"), Some("sum"));
        assert_eq!(trailers.get("X-MORE"), Some("yes"));
    }

    #[test]
    fn raw_mode_keeps_framing() {
        let mut buf = Buf::new();
        buf.write_all(WIRE).unwrap();
        let mut trailers = HeaderMap::new();
        let mut state = State::new();
        state.set_raw();
        state.parse(&mut buf, &mut trailers, 65536).unwrap();
        assert_eq!(state.buffered(), WIRE.len());
        assert!(state.is_done());
        assert_eq!(drain(&mut state, &mut buf), WIRE.to_vec());
    }

    #[test]
    fn missing_crlf_after_chunk() {
        let mut buf = Buf::new();
        buf.write_all(b"3\r\nabcXX").unwrap();
        let mut state = State::new();
        let err = state
            .parse(&mut buf, &mut HeaderMap::new(), 65536)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Invalid(InvalidResponse::MissingChunkDelimiter)
        ));
    }

    #[test]
    fn bad_chunk_size() {
        let mut buf = Buf::new();
        buf.write_all(b"zz\r\nabc").unwrap();
        let mut state = State::new();
        let err = state
            .parse(&mut buf, &mut HeaderMap::new(), 65536)
            .unwrap_err();
        assert!(matches!(err, Error::Invalid(InvalidResponse::ChunkSize(..))));
    }

    #[test]
    fn oversize_size_line() {
        let mut buf = Buf::new();
        buf.write_all(b"5;").unwrap();
        for _ in 0..64 {
            buf.write_all(b"padpadpad").unwrap();
        }
        let mut state = State::new();
        let err = state.parse(&mut buf, &mut HeaderMap::new(), 128).unwrap_err();
        assert!(matches!(err, Error::Invalid(InvalidResponse::LineTooLong)));
    }
}
