//! Incremental response head parsing.

use crate::body::BodyKind;
use crate::buffer::{find, Buf};
use crate::config::Config;
use crate::error::{Error, InvalidResponse};
use crate::headers::{self, HeaderMap};

/// Number of headers to allocate on a stack
const MIN_HEADERS: usize = 16;
/// A hard limit on the number of headers
const MAX_HEADERS: usize = 1024;

/// Parsed response head, before correlation with the pending request.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub code: u16,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: BodyKind,
    pub close: bool,
}

/// Join obs-fold continuation lines in `buf[start..end]` with a single
/// space, returning the new end offset.
pub(crate) fn unfold(buf: &mut Buf, start: usize, mut end: usize) -> usize {
    let mut i = start;
    while i + 2 < end {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' && (buf[i + 2] == b' ' || buf[i + 2] == b'\t') {
            let mut j = i + 2;
            while j < end && (buf[j] == b' ' || buf[j] == b'\t') {
                j += 1;
            }
            buf.remove_range(i..j - 1);
            end -= j - 1 - i;
            buf[i] = b' ';
            i += 1;
        } else {
            i += 1;
        }
    }
    end
}

/// Try to parse one response head out of the buffer.
///
/// `Ok(None)` means more bytes are needed. The buffer is consumed only on
/// success, so a failed parse can be retried (and will fail the same way).
pub(crate) fn parse_response_head(
    buf: &mut Buf,
    is_head: bool,
    cfg: &Config,
) -> Result<Option<ResponseHead>, Error> {
    let head_end = match find(&buf[..], b"\r\n\r\n") {
        Some(p) => p + 4,
        None => {
            if find(&buf[..], b"\r\n").is_none() && buf.len() > cfg.max_line_size {
                return Err(InvalidResponse::LineTooLong.into());
            }
            if buf.len() > cfg.max_headers_size {
                return Err(InvalidResponse::HeadersTooLong.into());
            }
            return Ok(None);
        }
    };
    if head_end > cfg.max_headers_size {
        return Err(InvalidResponse::HeadersTooLong.into());
    }
    let head_end = unfold(buf, 0, head_end);

    let mut vec;
    let mut stack = [httparse::EMPTY_HEADER; MIN_HEADERS];
    let (head, bytes) = {
        let mut raw = httparse::Response::new(&mut stack);
        let mut result = raw.parse(&buf[..head_end]);
        if let Err(httparse::Error::TooManyHeaders) = result {
            vec = vec![httparse::EMPTY_HEADER; MAX_HEADERS];
            raw = httparse::Response::new(&mut vec);
            result = raw.parse(&buf[..head_end]);
        }
        let bytes = match result.map_err(InvalidResponse::Header)? {
            httparse::Status::Complete(bytes) => bytes,
            // the end-of-headers sentinel was already found
            httparse::Status::Partial => return Ok(None),
        };
        if raw.version != Some(1) {
            return Err(Error::Unsupported("HTTP version below 1.1"));
        }
        let code = raw.code.unwrap();
        let reason = raw.reason.unwrap_or("").to_string();
        let mut map = HeaderMap::new();
        for h in raw.headers.iter() {
            if let Err(name) = map.add_wire(h.name, h.value) {
                return Err(InvalidResponse::DuplicateHeader(name).into());
            }
        }
        let (body, close) = body_framing(is_head, code, &map)?;
        (
            ResponseHead {
                code,
                reason,
                headers: map,
                body,
                close,
            },
            bytes,
        )
    };
    buf.consume(bytes);
    Ok(Some(head))
}

/// The body length algorithm of RFC 7230 §3.3.3, restricted to what the
/// engine supports:
///
/// 1. HEAD, 1xx, 204, 304 -- no body
/// 2. Transfer-Encoding ending in chunked -> chunked
/// 3. Content-Length -> fixed
/// 4. Connection: close -> read until EOF
/// 5. anything else is unsupported
fn body_framing(is_head: bool, code: u16, headers: &HeaderMap) -> Result<(BodyKind, bool), Error> {
    let close = headers.get_all("Connection").any(headers::is_close);
    if is_head || (code >= 100 && code < 200) || code == 204 || code == 304 {
        return Ok((BodyKind::Fixed(0), close));
    }
    if let Some(te) = headers.get("Transfer-Encoding") {
        if headers::is_chunked(te) {
            // chunked wins over Content-Length, but such a message is not
            // safe to keep alive
            let close = close || headers.contains("Content-Length");
            return Ok((BodyKind::Chunked, close));
        }
        return Err(Error::Unsupported("transfer coding other than chunked"));
    }
    if let Some(v) = headers.get("Content-Length") {
        let t = v.trim();
        if t.is_empty() || !t.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidResponse::BadContentLength.into());
        }
        let n = t
            .parse::<u64>()
            .map_err(|_| InvalidResponse::BadContentLength)?;
        return Ok((BodyKind::Fixed(n), close));
    }
    if let Some(ct) = headers.get("Content-Type") {
        if ct
            .trim()
            .to_ascii_lowercase()
            .starts_with("multipart/byteranges")
        {
            return Err(Error::Unsupported("multipart/byteranges without a length"));
        }
    }
    if close {
        return Ok((BodyKind::Eof, true));
    }
    Err(Error::Unsupported("response with no framing"))
}
