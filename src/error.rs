//! Failure taxonomy of the connection engine.

use std::io;

use matches::matches;
use quick_error::quick_error;

use crate::headers::HeaderError;

quick_error! {
    /// Wire-level malformedness in a response.
    #[derive(Debug)]
    pub enum InvalidResponse {
        /// Bad status line or header block
        Header(err: httparse::Error) {
            description("malformed response head")
            display("malformed response head: {}", err)
            from()
        }
        /// Bad chunk-size line
        ChunkSize(err: httparse::InvalidChunkSize) {
            description("invalid chunk size")
            display("invalid chunk size")
            from()
        }
        /// `Content-Length` is not a plain decimal number
        BadContentLength {
            description("bad Content-Length header")
        }
        /// A header that must be unique appeared twice
        DuplicateHeader(name: &'static str) {
            description("duplicate singleton header")
            display("duplicate {} header", name)
        }
        /// A single line exceeded the configured bound
        LineTooLong {
            description("line exceeds the configured bound")
        }
        /// The header block exceeded the configured bound
        HeadersTooLong {
            description("header block exceeds the configured bound")
        }
        /// Chunk data was not followed by CRLF
        MissingChunkDelimiter {
            description("chunk data not terminated by CRLF")
        }
        /// Bytes arrived although no request is awaiting a response
        Unexpected {
            description("response data received with no outstanding request")
        }
    }
}

quick_error! {
    /// Failure of a connection operation.
    #[derive(Debug)]
    pub enum Error {
        /// I/O (basically networking) error on the underlying socket
        Io(err: io::Error) {
            description("IO error")
            display("IO error: {}", err)
            from()
        }
        /// Transport EOF or reset where more data was required
        Closed {
            description("connection closed")
        }
        /// No progress within the configured deadline
        TimedOut {
            description("operation timed out")
        }
        /// The response violates HTTP/1.1 framing
        Invalid(err: InvalidResponse) {
            description("invalid response")
            display("invalid response: {}", err)
            from()
        }
        /// Wire-legal framing the engine does not support
        Unsupported(what: &'static str) {
            description("unsupported response")
            display("unsupported response: {}", what)
        }
        /// More body bytes were written than the request declared
        ExcessBodyData {
            description("more body data written than was declared")
        }
        /// Operation called in a state that does not allow it
        State(what: &'static str) {
            description("operation called in the wrong state")
            display("wrong state: {}", what)
        }
        /// The request could not be serialized as given
        BadRequest(err: HeaderError) {
            description("request rejected")
            display("request rejected: {}", err)
            from()
        }
        /// The hostname did not resolve to any address
        NameNotResolved(host: String) {
            description("hostname did not resolve")
            display("hostname {:?} did not resolve", host)
        }
        /// The resolver itself was unreachable
        DnsUnavailable(err: io::Error) {
            description("resolver unavailable")
            display("resolver unavailable: {}", err)
        }
    }
}

impl Error {
    /// Advisory classifier for caller-side retry loops: does this failure
    /// look like a transient network condition rather than a protocol or
    /// usage problem?
    pub fn is_transient(&self) -> bool {
        use std::io::ErrorKind::*;
        match *self {
            Error::TimedOut | Error::Closed | Error::DnsUnavailable(..) => true,
            Error::Io(ref e) => matches!(
                e.kind(),
                ConnectionReset | ConnectionAborted | ConnectionRefused
                    | BrokenPipe | TimedOut | AddrNotAvailable
            ),
            _ => false,
        }
    }
}
