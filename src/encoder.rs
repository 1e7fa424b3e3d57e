//! Request serialization: head staging and body framing.
//!
//! The encoder writes into the connection's staging buffer and never
//! touches the transport; the pipeline decides when to push bytes. Partial
//! writes are therefore normal and invisible here.

use std::io::Write;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use matches::matches;

use crate::buffer::Buf;
use crate::config::Config;
use crate::error::Error;
use crate::headers::{self, HeaderMap};
use crate::version::Version;

/// Request body as supplied by the caller.
#[derive(Debug)]
pub enum RequestBody<'a> {
    /// The request has no body.
    None,
    /// The whole body is available up front.
    Inline(&'a [u8]),
    /// Exactly this many bytes will arrive through later `write` calls.
    Following(u64),
}

/// Progress of the request body on the wire.
#[derive(Debug)]
pub(crate) enum BodyState {
    Fixed { left: u64 },
    Chunked,
    Done,
}

impl BodyState {
    pub fn fixed(n: u64) -> BodyState {
        if n == 0 {
            BodyState::Done
        } else {
            BodyState::Fixed { left: n }
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(*self, BodyState::Done)
    }

    /// Stage body bytes with the framing chosen at header time.
    ///
    /// For a chunked body an empty `data` emits the terminating chunk.
    /// Writing past a declared fixed length stages the allowed prefix and
    /// fails with `ExcessBodyData`, so the wire never carries more than
    /// the declaration.
    pub fn write(&mut self, buf: &mut Buf, data: &[u8]) -> Result<usize, Error> {
        match self {
            BodyState::Fixed { left } => {
                if data.is_empty() {
                    return Ok(0);
                }
                if (data.len() as u64) > *left {
                    let take = *left as usize;
                    buf.write_all(&data[..take]).unwrap();
                    *self = BodyState::Done;
                    return Err(Error::ExcessBodyData);
                }
                buf.write_all(data).unwrap();
                *left -= data.len() as u64;
                if *left == 0 {
                    *self = BodyState::Done;
                }
                Ok(data.len())
            }
            BodyState::Chunked => {
                if data.is_empty() {
                    buf.write_all(b"0\r\n\r\n").unwrap();
                    *self = BodyState::Done;
                    return Ok(0);
                }
                write!(buf, "{:x}\r\n", data.len()).unwrap();
                buf.write_all(data).unwrap();
                buf.write_all(b"\r\n").unwrap();
                Ok(data.len())
            }
            BodyState::Done => {
                if data.is_empty() {
                    Ok(0)
                } else {
                    Err(Error::ExcessBodyData)
                }
            }
        }
    }
}

/// Everything decided at header time.
pub(crate) struct EncodedRequest {
    pub body: BodyState,
    pub expect_continue: bool,
    /// Staged length of the request line, headers and blank line; the
    /// pending record is queued once this many bytes reached the wire.
    pub head_len: usize,
}

fn valid_method(method: &str) -> bool {
    !method.is_empty()
        && method
            .bytes()
            .all(|b| b > 0x20 && b < 0x7f && !b"()<>@,;:\\\"/[]?={}".contains(&b))
}

/// Stage one request head and choose the body framing.
///
/// All validation happens before the first byte is staged, so an error
/// leaves the buffer untouched.
pub(crate) fn encode_request(
    out: &mut Buf,
    cfg: &Config,
    host: &str,
    port: u16,
    default_port: u16,
    method: &str,
    path: &str,
    headers: &HeaderMap,
    body: &RequestBody,
    expect_continue: bool,
) -> Result<EncodedRequest, Error> {
    if !valid_method(method) {
        return Err(Error::State("method is not an HTTP token"));
    }
    if path.is_empty() || !path.starts_with('/') {
        return Err(Error::State("request path must start with a slash"));
    }
    let chunked = headers
        .get("Transfer-Encoding")
        .map_or(false, headers::is_chunked);
    if !chunked && headers.contains("Content-Length") {
        return Err(Error::State(
            "Content-Length is derived from the body argument",
        ));
    }
    let mut expect = expect_continue;
    if let Some(v) = headers.get("Expect") {
        if headers::is_continue(v) {
            expect = true;
        }
    }

    let start = out.len();
    if cfg.proxy.is_some() {
        // absolute-form target for CONNECT-less proxying
        if port == default_port {
            write!(out, "{} http://{}{} {}\r\n", method, host, path, Version::Http11).unwrap();
        } else {
            write!(
                out,
                "{} http://{}:{}{} {}\r\n",
                method, host, port, path, Version::Http11
            )
            .unwrap();
        }
    } else {
        write!(out, "{} {} {}\r\n", method, path, Version::Http11).unwrap();
    }

    if !headers.contains("Host") {
        if port == default_port {
            write!(out, "Host: {}\r\n", host).unwrap();
        } else {
            write!(out, "Host: {}:{}\r\n", host, port).unwrap();
        }
    }
    for (name, value) in headers.iter() {
        out.write_all(name.as_bytes()).unwrap();
        out.write_all(b": ").unwrap();
        write_latin1(out, value);
        out.write_all(b"\r\n").unwrap();
    }
    if expect && !headers.contains("Expect") {
        out.write_all(b"Expect: 100-continue\r\n").unwrap();
    }

    let state = if chunked {
        BodyState::Chunked
    } else {
        match *body {
            RequestBody::None => BodyState::Done,
            RequestBody::Inline(data) => {
                write!(out, "Content-Length: {}\r\n", data.len()).unwrap();
                BodyState::fixed(data.len() as u64)
            }
            RequestBody::Following(n) => {
                write!(out, "Content-Length: {}\r\n", n).unwrap();
                BodyState::fixed(n)
            }
        }
    };
    if let RequestBody::Inline(data) = *body {
        if cfg.send_content_md5 && !headers.contains("Content-MD5") {
            let digest = md5::compute(data);
            write!(out, "Content-MD5: {}\r\n", BASE64.encode(digest.0)).unwrap();
        }
    }
    out.write_all(b"\r\n").unwrap();
    Ok(EncodedRequest {
        body: state,
        expect_continue: expect,
        head_len: out.len() - start,
    })
}

// values were validated to the latin-1 range on insertion
fn write_latin1(out: &mut Buf, value: &str) {
    for c in value.chars() {
        out.write_all(&[c as u8]).unwrap();
    }
}

#[cfg(test)]
mod test {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use matches::matches;

    use super::{encode_request, BodyState, RequestBody};
    use crate::buffer::Buf;
    use crate::config::Config;
    use crate::error::Error;
    use crate::headers::HeaderMap;

    fn encode<F>(cfg: &Config, fun: F) -> (Buf, super::EncodedRequest)
    where
        F: FnOnce(&mut HeaderMap) -> (String, RequestBody<'static>, bool),
    {
        let mut headers = HeaderMap::new();
        let (path, body, expect) = fun(&mut headers);
        let mut buf = Buf::new();
        let enc = encode_request(
            &mut buf,
            cfg,
            "example.com",
            80,
            80,
            "GET",
            &path,
            &headers,
            &body,
            expect,
        )
        .unwrap();
        (buf, enc)
    }

    #[test]
    fn minimal_request() {
        let (buf, enc) = encode(&Config::new(), |_h| {
            ("/".to_string(), RequestBody::None, false)
        });
        assert_eq!(
            &buf[..],
            b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n" as &[u8]
        );
        assert_eq!(enc.head_len, buf.len());
        assert!(enc.body.is_done());
        assert!(!enc.expect_continue);
    }

    #[test]
    fn host_with_port() {
        let mut buf = Buf::new();
        let headers = HeaderMap::new();
        encode_request(
            &mut buf,
            &Config::new(),
            "example.com",
            8080,
            80,
            "GET",
            "/x",
            &headers,
            &RequestBody::None,
            false,
        )
        .unwrap();
        assert_eq!(
            &buf[..],
            b"GET /x HTTP/1.1\r\nHost: example.com:8080\r\n\r\n" as &[u8]
        );
    }

    #[test]
    fn caller_host_wins() {
        let (buf, _) = encode(&Config::new(), |h| {
            h.add("Host", "other.example").unwrap();
            ("/".to_string(), RequestBody::None, false)
        });
        assert_eq!(
            &buf[..],
            b"GET / HTTP/1.1\r\nHost: other.example\r\n\r\n" as &[u8]
        );
    }

    #[test]
    fn inline_body_gets_length() {
        let (buf, enc) = encode(&Config::new(), |_h| {
            ("/post".to_string(), RequestBody::Inline(b"hello"), false)
        });
        assert_eq!(
            &buf[..],
            b"GET /post HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\n" as &[u8]
        );
        // staging the body itself is the pipeline's job
        assert!(matches!(enc.body, BodyState::Fixed { left: 5 }));
    }

    #[test]
    fn following_body_promises_length() {
        let (buf, enc) = encode(&Config::new(), |_h| {
            ("/up".to_string(), RequestBody::Following(12), false)
        });
        assert!(buf.ends_with(b"Content-Length: 12\r\n\r\n"));
        assert!(matches!(enc.body, BodyState::Fixed { left: 12 }));
    }

    #[test]
    fn chunked_drops_content_length() {
        let (buf, enc) = encode(&Config::new(), |h| {
            h.add("Transfer-Encoding", "chunked").unwrap();
            ("/up".to_string(), RequestBody::Following(99), false)
        });
        let text = String::from_utf8_lossy(&buf[..]).to_string();
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!text.contains("Content-Length"));
        assert!(matches!(enc.body, BodyState::Chunked));
    }

    #[test]
    fn explicit_content_length_rejected() {
        let mut headers = HeaderMap::new();
        headers.add("Content-Length", "5").unwrap();
        let mut buf = Buf::new();
        let res = encode_request(
            &mut buf,
            &Config::new(),
            "example.com",
            80,
            80,
            "POST",
            "/",
            &headers,
            &RequestBody::Inline(b"hello"),
            false,
        );
        assert!(matches!(res, Err(Error::State(..))));
        assert!(buf.is_empty());
    }

    #[test]
    fn expect_header_is_injected() {
        let (buf, enc) = encode(&Config::new(), |_h| {
            ("/up".to_string(), RequestBody::Following(4), true)
        });
        assert!(String::from_utf8_lossy(&buf[..]).contains("Expect: 100-continue\r\n"));
        assert!(enc.expect_continue);
    }

    #[test]
    fn caller_expect_header_implies_rendezvous() {
        let (_buf, enc) = encode(&Config::new(), |h| {
            h.add("Expect", "100-continue").unwrap();
            ("/up".to_string(), RequestBody::Following(4), false)
        });
        assert!(enc.expect_continue);
    }

    #[test]
    fn content_md5_is_opt_in() {
        let (buf, _) = encode(&Config::new(), |_h| {
            ("/".to_string(), RequestBody::Inline(b"data"), false)
        });
        assert!(!String::from_utf8_lossy(&buf[..]).contains("Content-MD5"));

        let mut cfg = Config::new();
        cfg.send_content_md5(true);
        let (buf, _) = encode(&cfg, |_h| {
            ("/".to_string(), RequestBody::Inline(b"data"), false)
        });
        let expected = format!("Content-MD5: {}\r\n", BASE64.encode(md5::compute(b"data").0));
        assert!(String::from_utf8_lossy(&buf[..]).contains(&expected));
    }

    #[test]
    fn proxy_uses_absolute_form() {
        let mut cfg = Config::new();
        cfg.proxy("proxy.local", 3128);
        let mut buf = Buf::new();
        let headers = HeaderMap::new();
        encode_request(
            &mut buf,
            &cfg,
            "example.com",
            8080,
            80,
            "GET",
            "/y",
            &headers,
            &RequestBody::None,
            false,
        )
        .unwrap();
        assert!(buf.starts_with(b"GET http://example.com:8080/y HTTP/1.1\r\n"));
    }

    #[test]
    fn bad_method_and_path() {
        let mut buf = Buf::new();
        let headers = HeaderMap::new();
        for (method, path) in &[("GE T", "/"), ("GET", "no-slash"), ("", "/")] {
            let res = encode_request(
                &mut buf,
                &Config::new(),
                "example.com",
                80,
                80,
                method,
                path,
                &headers,
                &RequestBody::None,
                false,
            );
            assert!(matches!(res, Err(Error::State(..))));
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn body_state_fixed_accounting() {
        let mut buf = Buf::new();
        let mut state = BodyState::fixed(6);
        assert_eq!(state.write(&mut buf, b"abc").unwrap(), 3);
        assert_eq!(state.write(&mut buf, b"def").unwrap(), 3);
        assert!(state.is_done());
        assert_eq!(&buf[..], b"abcdef");
        assert!(matches!(
            state.write(&mut buf, b"g"),
            Err(Error::ExcessBodyData)
        ));
    }

    #[test]
    fn body_state_truncates_excess_on_the_wire() {
        let mut buf = Buf::new();
        let mut state = BodyState::fixed(4);
        assert!(matches!(
            state.write(&mut buf, b"toolong"),
            Err(Error::ExcessBodyData)
        ));
        assert_eq!(&buf[..], b"tool");
        assert!(state.is_done());
    }

    #[test]
    fn body_state_chunked_framing() {
        let mut buf = Buf::new();
        let mut state = BodyState::Chunked;
        state.write(&mut buf, b"hello").unwrap();
        state.write(&mut buf, b" world").unwrap();
        state.write(&mut buf, b"").unwrap();
        assert!(state.is_done());
        assert_eq!(&buf[..], b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n" as &[u8]);
    }
}
