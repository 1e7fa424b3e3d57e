//! The connection pipeline: a send cursor, a receive cursor and the FIFO
//! of pending-response records that ties them together.
//!
//! Both cursors advance independently over one transport. The send side
//! appends a record to the FIFO the moment a request head has fully
//! reached the wire; the receive side pops it once the matching response
//! body has been consumed. Every public operation exists in a cooperative
//! `poll_*` form, which never blocks, and a blocking convenience form that
//! waits on the suspension values with the configured timeout.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};
use matches::matches;

use crate::body::{BodyKind, BodyProgress};
use crate::buffer::Buf;
use crate::config::Config;
use crate::encoder::{self, BodyState, RequestBody};
use crate::error::{Error, InvalidResponse};
use crate::headers::HeaderMap;
use crate::parser;
use crate::poll::{Async, Interest, Poll, PollNeeded};
use crate::response::Response;
use crate::transport::Transport;

/// Stop accepting body bytes while this much staged output is unflushed.
const OUT_HIGHWATER: usize = 65536;

/// One sent request awaiting its response.
#[derive(Debug)]
struct PendingResponse {
    method: String,
    path: String,
    expect_continue: bool,
    continue_seen: bool,
}

enum OutState {
    Idle,
    /// Head staged; the pending record is queued once `head_left` bytes
    /// reached the wire.
    SendingHead {
        record: Option<PendingResponse>,
        head_left: usize,
        body: BodyState,
        deferred: Option<Vec<u8>>,
        expect: bool,
    },
    /// Holding the body back until the interim 100 has been consumed.
    AwaitContinue {
        body: BodyState,
        deferred: Option<Vec<u8>>,
    },
    /// The request body is streaming (or draining) to the transport.
    SendingBody { body: BodyState },
    Void,
}

enum InState {
    Idle,
    /// Reading the body of the response at the queue front.
    Body {
        progress: BodyProgress,
        mode: ReadMode,
        close: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadMode {
    Unset,
    Decoded,
    Raw,
}

/// Send-side state. Disjoint from `RecvSide`; the two only meet at the
/// pending FIFO, which the send completion step appends to and the receive
/// completion step pops.
struct SendSide {
    state: OutState,
    out: Buf,
    /// The transport broke mid-request; the body counts as sent so an
    /// early error response stays readable.
    broken: bool,
}

struct RecvSide {
    state: InState,
    buf: Buf,
    eof: bool,
    trailers: HeaderMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Health {
    Usable,
    /// Peer closed, or `disconnect` was called.
    Closed,
    /// The peer violated the protocol; nothing on this connection can be
    /// trusted any more.
    Invalid,
}

enum ReadStep {
    Data(Vec<u8>),
    Complete(bool),
    NeedMore,
    Failed(Error),
}

/// A single pipelined HTTP/1.1 connection.
pub struct Connection {
    transport: Transport,
    send: SendSide,
    recv: RecvSide,
    pending: VecDeque<PendingResponse>,
    health: Health,
    timeout: Option<Duration>,
    config: Arc<Config>,
    host: String,
    port: u16,
    default_port: u16,
}

impl Connection {
    /// Open a plain-HTTP connection (through the configured proxy, if any).
    pub fn connect(host: &str, port: u16, config: &Arc<Config>) -> Result<Connection, Error> {
        let transport = match config.proxy {
            Some((ref proxy_host, proxy_port)) => {
                Transport::connect(proxy_host, proxy_port, config.timeout)?
            }
            None => Transport::connect(host, port, config.timeout)?,
        };
        Ok(Connection::new(transport, host, port, 80, config))
    }

    /// Open a TLS connection using a caller-built client config.
    ///
    /// The handshake is driven to completion before this returns.
    #[cfg(feature = "tls")]
    pub fn connect_tls(
        host: &str,
        port: u16,
        tls: &Arc<rustls::ClientConfig>,
        config: &Arc<Config>,
    ) -> Result<Connection, Error> {
        if config.proxy.is_some() {
            return Err(Error::State("proxy mode supports plain HTTP only"));
        }
        let transport = Transport::connect_tls(host, port, tls, config.timeout)?;
        Ok(Connection::new(transport, host, port, 443, config))
    }

    fn new(
        transport: Transport,
        host: &str,
        port: u16,
        default_port: u16,
        config: &Arc<Config>,
    ) -> Connection {
        Connection {
            transport,
            send: SendSide {
                state: OutState::Idle,
                out: Buf::new(),
                broken: false,
            },
            recv: RecvSide {
                state: InState::Idle,
                buf: Buf::new(),
                eof: false,
                trailers: HeaderMap::new(),
            },
            pending: VecDeque::new(),
            health: Health::Usable,
            timeout: config.timeout,
            config: config.clone(),
            host: host.to_string(),
            port,
            default_port,
        }
    }

    /// Per-operation soft deadline used by the blocking wrappers.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// True while at least one sent request still awaits its response.
    pub fn response_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Trailer headers of the last fully read chunked response.
    ///
    /// Valid until the next response head is read.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        if self.recv.trailers.is_empty() {
            None
        } else {
            Some(&self.recv.trailers)
        }
    }

    /// The certificate the peer presented during the TLS handshake.
    #[cfg(feature = "tls")]
    pub fn peer_certificate(&self) -> Option<&rustls::Certificate> {
        self.transport.peer_certificate()
    }

    /// Tear down the transport and discard all state. Idempotent; the only
    /// operation that is always allowed.
    pub fn disconnect(&mut self) {
        trace!("disconnect");
        self.transport.shutdown();
        self.health = Health::Closed;
        self.send.state = OutState::Idle;
        self.send.out.clear();
        self.recv.state = InState::Idle;
        self.pending.clear();
    }

    fn check_usable(&self) -> Result<(), Error> {
        match self.health {
            Health::Usable => Ok(()),
            Health::Closed => Err(Error::Closed),
            Health::Invalid => Err(InvalidResponse::Unexpected.into()),
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| Instant::now() + t)
    }

    fn wait(&self, poll: &PollNeeded, deadline: Option<Instant>) -> Result<(), Error> {
        let left = match deadline {
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return Err(Error::TimedOut);
                }
                Some(d - now)
            }
            None => None,
        };
        if poll.wait(left).map_err(Error::Io)? {
            Ok(())
        } else {
            Err(Error::TimedOut)
        }
    }

    // ----- send side -------------------------------------------------

    /// Stage a request head (and, without an expect rendezvous, its inline
    /// body). Nothing reaches the wire until `poll_flush` or one of the
    /// blocking wrappers pushes the staged bytes.
    pub fn start_request(
        &mut self,
        method: &str,
        path: &str,
        headers: &HeaderMap,
        body: RequestBody,
        expect_continue: bool,
    ) -> Result<(), Error> {
        self.check_usable()?;
        if self.send.broken {
            return Err(Error::Closed);
        }
        if !matches!(self.send.state, OutState::Idle) {
            return Err(Error::State("a request is already in progress"));
        }
        let enc = encoder::encode_request(
            &mut self.send.out,
            &self.config,
            &self.host,
            self.port,
            self.default_port,
            method,
            path,
            headers,
            &body,
            expect_continue,
        )?;
        let record = PendingResponse {
            method: method.to_string(),
            path: path.to_string(),
            expect_continue: enc.expect_continue,
            continue_seen: false,
        };
        let mut body_state = enc.body;
        let mut deferred = None;
        match body {
            RequestBody::Inline(data) if enc.expect_continue => {
                // held back until the interim response has been consumed
                deferred = Some(data.to_vec());
            }
            RequestBody::Inline(data) => {
                body_state.write(&mut self.send.out, data)?;
                if matches!(body_state, BodyState::Chunked) {
                    body_state.write(&mut self.send.out, b"")?;
                }
            }
            _ => {}
        }
        debug!("{} {} staged ({} bytes of head)", method, path, enc.head_len);
        self.send.state = OutState::SendingHead {
            record: Some(record),
            head_left: enc.head_len,
            body: body_state,
            deferred,
            expect: enc.expect_continue,
        };
        Ok(())
    }

    /// Push staged request bytes into the transport.
    ///
    /// `Ready` means everything staged so far has been handed to the
    /// socket.
    pub fn poll_flush(&mut self) -> Poll<()> {
        self.check_usable()?;
        if self.send.broken {
            return Err(Error::Closed);
        }
        while !self.send.out.is_empty() {
            let n = match self.transport.try_write(&mut self.send.out) {
                Ok(Async::Ready(n)) => n,
                Ok(Async::NotReady(p)) => return Ok(Async::NotReady(p)),
                Err(e) => return Err(self.send_failed(e)),
            };
            trace!("flushed {} bytes", n);
            self.after_write(n);
        }
        match self.transport.try_flush() {
            Ok(Async::Ready(())) => {}
            Ok(Async::NotReady(p)) => return Ok(Async::NotReady(p)),
            Err(e) => return Err(self.send_failed(e)),
        }
        self.after_write(0);
        Ok(Async::Ready(()))
    }

    /// Feed body bytes for a request declared with a length promise or
    /// chunked framing. `Ready(n)` is the number of bytes accepted; for a
    /// chunked body an empty span emits the terminating chunk.
    pub fn poll_write(&mut self, data: &[u8]) -> Poll<usize> {
        self.check_usable()?;
        if self.send.broken {
            return Err(Error::Closed);
        }
        match self.send.state {
            OutState::SendingBody { .. } => {}
            OutState::SendingHead { expect: false, .. } => {}
            OutState::SendingHead { expect: true, .. } | OutState::AwaitContinue { .. } => {
                return Err(Error::State(
                    "body is held back until the interim response is read",
                ));
            }
            OutState::Idle => {
                return Err(Error::State("no request body is being streamed"));
            }
            OutState::Void => unreachable!(),
        }
        if let Async::NotReady(p) = self.poll_flush()? {
            if self.send.out.len() >= OUT_HIGHWATER {
                return Ok(Async::NotReady(p));
            }
        }
        let n = {
            let SendSide {
                ref mut state,
                ref mut out,
                ..
            } = self.send;
            let body = match *state {
                OutState::SendingBody { ref mut body } => body,
                OutState::SendingHead { ref mut body, .. } => body,
                _ => unreachable!(),
            };
            body.write(out, data)?
        };
        let _ = self.poll_flush()?;
        Ok(Async::Ready(n))
    }

    /// Blocking `start_request` + flush. For a length-promise or chunked
    /// body this returns once the head is on the wire; the body follows
    /// through `write`.
    pub fn send_request(
        &mut self,
        method: &str,
        path: &str,
        headers: &HeaderMap,
        body: RequestBody,
        expect_continue: bool,
    ) -> Result<(), Error> {
        let deadline = self.deadline();
        self.start_request(method, path, headers, body, expect_continue)?;
        loop {
            match self.poll_flush()? {
                Async::Ready(()) => return Ok(()),
                Async::NotReady(p) => self.wait(&p, deadline)?,
            }
        }
    }

    /// Blocking body write. With `partial` the call returns as soon as the
    /// bytes are staged and flushing continues opportunistically; without
    /// it the bytes are on the wire when the call returns.
    pub fn write(&mut self, data: &[u8], partial: bool) -> Result<usize, Error> {
        let deadline = self.deadline();
        let n = loop {
            match self.poll_write(data)? {
                Async::Ready(n) => break n,
                Async::NotReady(p) => self.wait(&p, deadline)?,
            }
        };
        if !partial {
            loop {
                match self.poll_flush()? {
                    Async::Ready(()) => break,
                    Async::NotReady(p) => self.wait(&p, deadline)?,
                }
            }
        }
        Ok(n)
    }

    /// Synchronous convenience: send one request and read its response
    /// head in a single call.
    pub fn request(
        &mut self,
        method: &str,
        path: &str,
        headers: &HeaderMap,
        body: RequestBody,
    ) -> Result<Response, Error> {
        self.send_request(method, path, headers, body, false)?;
        self.read_response()
    }

    // Bookkeeping after `n` bytes reached the wire.
    fn after_write(&mut self, n: usize) {
        let state = mem::replace(&mut self.send.state, OutState::Void);
        self.send.state = match state {
            OutState::SendingHead {
                record,
                head_left,
                body,
                deferred,
                expect,
            } => {
                if n < head_left {
                    OutState::SendingHead {
                        record,
                        head_left: head_left - n,
                        body,
                        deferred,
                        expect,
                    }
                } else {
                    if let Some(r) = record {
                        self.pending.push_back(r);
                        trace!("request head sent; {} pending", self.pending.len());
                    }
                    if expect {
                        OutState::AwaitContinue { body, deferred }
                    } else if body.is_done() && self.send.out.is_empty() {
                        OutState::Idle
                    } else {
                        OutState::SendingBody { body }
                    }
                }
            }
            OutState::SendingBody { body } => {
                if body.is_done() && self.send.out.is_empty() {
                    OutState::Idle
                } else {
                    OutState::SendingBody { body }
                }
            }
            other => other,
        };
    }

    // A send-side transport failure. A peer close mid-body counts the
    // body as sent, so the caller can still collect an early error
    // response; a failure before the head reached the wire ends the
    // connection, because no response can be correlated.
    fn send_failed(&mut self, e: Error) -> Error {
        let state = mem::replace(&mut self.send.state, OutState::Void);
        match state {
            OutState::AwaitContinue { .. } | OutState::SendingBody { .. }
                if matches!(e, Error::Closed) =>
            {
                debug!("peer closed mid-request; body counts as sent");
                self.send.broken = true;
            }
            _ => {
                self.health = Health::Closed;
            }
        }
        self.send.state = OutState::Idle;
        self.send.out.clear();
        e
    }

    // The interim 100 arrived; release the held-back request body.
    fn unblock_send(&mut self) {
        let state = mem::replace(&mut self.send.state, OutState::Void);
        self.send.state = match state {
            OutState::AwaitContinue { mut body, deferred } => {
                if let Some(data) = deferred {
                    body.write(&mut self.send.out, &data)
                        .expect("deferred body matches its declared length");
                    if matches!(body, BodyState::Chunked) {
                        body.write(&mut self.send.out, b"")
                            .expect("chunked terminator is infallible");
                    }
                }
                if body.is_done() && self.send.out.is_empty() {
                    OutState::Idle
                } else {
                    OutState::SendingBody { body }
                }
            }
            other => other,
        };
    }

    // The server answered without waiting for the body; drop what was
    // held back so the send side returns to idle.
    fn abandon_request_body(&mut self) {
        if matches!(self.send.state, OutState::AwaitContinue { .. }) {
            self.send.state = OutState::Idle;
        }
    }

    // Opportunistically push staged request bytes while the receive side
    // runs. Failures are recorded by `send_failed` and resurface on the
    // next send-side call.
    fn nudge_send(&mut self) {
        if self.send.broken || self.send.out.is_empty() {
            return;
        }
        if let Err(e) = self.poll_flush() {
            debug!("send side failed while reading: {}", e);
        }
    }

    // While request bytes are staged, a read suspension must also watch
    // for writability, or a server waiting for our body would deadlock us.
    fn read_suspend(&self, p: PollNeeded) -> PollNeeded {
        if !self.send.out.is_empty() && !self.send.broken {
            PollNeeded::new(p.fd(), p.interest() | Interest::WRITABLE)
        } else {
            p
        }
    }

    // ----- receive side ----------------------------------------------

    /// Parse the next response head for the request at the queue front.
    ///
    /// Unsolicited interim (1xx) responses are consumed transparently; an
    /// expected interim 100 is returned to the caller and does not pop the
    /// queue.
    pub fn poll_read_response(&mut self) -> Poll<Response> {
        self.check_usable()?;
        if matches!(self.recv.state, InState::Body { .. }) {
            return Err(Error::State("previous response body has not been consumed"));
        }
        if self.pending.is_empty() {
            return Err(Error::State("no response is pending"));
        }
        loop {
            self.nudge_send();
            let is_head = self
                .pending
                .front()
                .map_or(false, |r| r.method.eq_ignore_ascii_case("HEAD"));
            let parsed = match parser::parse_response_head(&mut self.recv.buf, is_head, &self.config)
            {
                Ok(v) => v,
                Err(e) => return Err(self.recv_failed(e)),
            };
            let head = match parsed {
                Some(head) => head,
                None => {
                    if self.recv.eof {
                        return Err(self.recv_failed(Error::Closed));
                    }
                    match self
                        .transport
                        .try_read(&mut self.recv.buf, self.config.max_headers_size)
                    {
                        Ok(Async::Ready(0)) => {
                            trace!("eof while waiting for response head");
                            self.recv.eof = true;
                        }
                        Ok(Async::Ready(n)) => trace!("read {} bytes", n),
                        Ok(Async::NotReady(p)) => {
                            let p = self.read_suspend(p);
                            return Ok(Async::NotReady(p));
                        }
                        Err(e) => return Err(self.recv_failed(e)),
                    }
                    continue;
                }
            };
            if head.code == 100 {
                let expected = {
                    let front = self.pending.front_mut().unwrap();
                    if front.expect_continue && !front.continue_seen {
                        front.continue_seen = true;
                        true
                    } else {
                        false
                    }
                };
                if expected {
                    self.unblock_send();
                    let front = self.pending.front().unwrap();
                    let resp = Response {
                        code: head.code,
                        reason: head.reason,
                        headers: head.headers,
                        method: front.method.clone(),
                        path: front.path.clone(),
                        body: BodyKind::Fixed(0),
                    };
                    debug!("interim 100 for {} {}", resp.method, resp.path);
                    return Ok(Async::Ready(resp));
                }
                trace!("discarding unsolicited 100");
                continue;
            }
            if head.code > 100 && head.code < 200 {
                let expecting = {
                    let front = self.pending.front().unwrap();
                    front.expect_continue && !front.continue_seen
                };
                if !expecting {
                    trace!("skipping interim {} response", head.code);
                    continue;
                }
                // a non-100 during the rendezvous is a refusal; treat it
                // as the real response below
            }
            let refused = {
                let front = self.pending.front_mut().unwrap();
                let r = front.expect_continue && !front.continue_seen;
                if r {
                    front.continue_seen = true;
                }
                r
            };
            if refused {
                debug!("expect rendezvous refused with status {}", head.code);
                self.abandon_request_body();
            }
            let (method, path) = {
                let front = self.pending.front().unwrap();
                (front.method.clone(), front.path.clone())
            };
            let resp = Response {
                code: head.code,
                reason: head.reason,
                headers: head.headers,
                method,
                path,
                body: head.body,
            };
            self.recv.trailers = HeaderMap::new();
            debug!(
                "response {} {:?} for {} {}",
                resp.code, resp.reason, resp.method, resp.path
            );
            match head.body {
                BodyKind::Fixed(0) => {
                    if let Err(e) = self.finish_response(head.close) {
                        return Err(e);
                    }
                }
                kind => {
                    self.recv.state = InState::Body {
                        progress: BodyProgress::new(kind),
                        mode: ReadMode::Unset,
                        close: head.close,
                    };
                }
            }
            return Ok(Async::Ready(resp));
        }
    }

    /// Yield up to `max` decoded body bytes; an empty result marks the
    /// body complete and pops the pending record.
    pub fn poll_read(&mut self, max: usize) -> Poll<Vec<u8>> {
        self.poll_read_body(max, ReadMode::Decoded)
    }

    /// Like `poll_read` but hands out on-wire bytes, bypassing chunked
    /// decoding. Cannot be mixed with `poll_read` within one response.
    pub fn poll_read_raw(&mut self, max: usize) -> Poll<Vec<u8>> {
        self.poll_read_body(max, ReadMode::Raw)
    }

    fn poll_read_body(&mut self, max: usize, want: ReadMode) -> Poll<Vec<u8>> {
        self.check_usable()?;
        if max == 0 {
            // an empty result is the body-done marker
            return Err(Error::State("read of zero bytes is ambiguous"));
        }
        match self.recv.state {
            InState::Body {
                ref mut progress,
                ref mut mode,
                ..
            } => match *mode {
                ReadMode::Unset => {
                    *mode = want;
                    if want == ReadMode::Raw {
                        progress.set_raw();
                    }
                }
                m if m != want => {
                    return Err(Error::State(
                        "read and read_raw cannot be mixed within one response",
                    ));
                }
                _ => {}
            },
            InState::Idle => {
                return Err(Error::State("no response body is being read"));
            }
        }
        loop {
            self.nudge_send();
            let step = {
                let RecvSide {
                    ref mut state,
                    ref mut buf,
                    ref mut trailers,
                    eof,
                } = self.recv;
                let (progress, close) = match *state {
                    InState::Body {
                        ref mut progress,
                        close,
                        ..
                    } => (progress, close),
                    InState::Idle => unreachable!(),
                };
                match progress.parse(buf, trailers, &self.config) {
                    Ok(()) => {
                        let (avail, done) = progress.available(buf, eof);
                        if avail > 0 {
                            let n = avail.min(max);
                            let data = buf[..n].to_vec();
                            progress.consume(buf, n);
                            ReadStep::Data(data)
                        } else if done {
                            ReadStep::Complete(close)
                        } else if eof {
                            // a short body is never silently delivered
                            ReadStep::Failed(Error::Closed)
                        } else {
                            ReadStep::NeedMore
                        }
                    }
                    Err(e) => ReadStep::Failed(e),
                }
            };
            match step {
                ReadStep::Data(data) => return Ok(Async::Ready(data)),
                ReadStep::Complete(close) => {
                    self.finish_response(close)?;
                    return Ok(Async::Ready(Vec::new()));
                }
                ReadStep::Failed(e) => return Err(self.recv_failed(e)),
                ReadStep::NeedMore => {
                    match self
                        .transport
                        .try_read(&mut self.recv.buf, self.config.max_headers_size)
                    {
                        Ok(Async::Ready(0)) => {
                            trace!("eof in response body");
                            self.recv.eof = true;
                        }
                        Ok(Async::Ready(_)) => {}
                        Ok(Async::NotReady(p)) => {
                            let p = self.read_suspend(p);
                            return Ok(Async::NotReady(p));
                        }
                        Err(e) => return Err(self.recv_failed(e)),
                    }
                }
            }
        }
    }

    /// Blocking `poll_read_response`.
    pub fn read_response(&mut self) -> Result<Response, Error> {
        let deadline = self.deadline();
        loop {
            match self.poll_read_response()? {
                Async::Ready(resp) => return Ok(resp),
                Async::NotReady(p) => self.wait(&p, deadline)?,
            }
        }
    }

    /// Blocking `poll_read`. An empty result means the body is done.
    pub fn read(&mut self, max: usize) -> Result<Vec<u8>, Error> {
        let deadline = self.deadline();
        loop {
            match self.poll_read(max)? {
                Async::Ready(data) => return Ok(data),
                Async::NotReady(p) => self.wait(&p, deadline)?,
            }
        }
    }

    /// Blocking `poll_read_raw`.
    pub fn read_raw(&mut self, max: usize) -> Result<Vec<u8>, Error> {
        let deadline = self.deadline();
        loop {
            match self.poll_read_raw(max)? {
                Async::Ready(data) => return Ok(data),
                Async::NotReady(p) => self.wait(&p, deadline)?,
            }
        }
    }

    // The response at the queue front is fully read.
    fn finish_response(&mut self, close: bool) -> Result<(), Error> {
        self.pending.pop_front();
        self.recv.state = InState::Idle;
        if close {
            trace!("server signalled close; connection is finished");
            self.health = Health::Closed;
        } else if self.pending.is_empty() && !self.recv.buf.is_empty() {
            // data with nothing outstanding: the peer is talking out of turn
            return Err(self.recv_failed(InvalidResponse::Unexpected.into()));
        }
        Ok(())
    }

    fn recv_failed(&mut self, e: Error) -> Error {
        match e {
            Error::Invalid(..) => self.health = Health::Invalid,
            Error::Closed | Error::Io(..) => self.health = Health::Closed,
            _ => {}
        }
        e
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.transport.shutdown();
    }
}
