//! Non-blocking transport over a plain or TLS-wrapped stream socket.
//!
//! "Not ready" surfaces as a suspension value carrying the socket's file
//! descriptor and the readiness the *transport* needs, which for TLS may
//! be the opposite direction of the logical operation. Interrupted system
//! calls retry transparently; a clean EOF on read is not an error here.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use log::debug;

use crate::buffer::Buf;
use crate::error::Error;
use crate::poll::{Async, Interest, Poll, PollNeeded};

#[cfg(feature = "tls")]
use std::convert::TryFrom;
#[cfg(feature = "tls")]
use std::sync::Arc;

#[cfg(feature = "tls")]
use rustls::{ClientConfig, ClientConnection, ServerName, StreamOwned};

enum Io {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

pub(crate) struct Transport {
    io: Io,
    fd: RawFd,
}

fn connect_stream(host: &str, port: u16, timeout: Option<Duration>) -> Result<TcpStream, Error> {
    let addrs: Vec<SocketAddr> = match (host, port).to_socket_addrs() {
        Ok(iter) => iter.collect(),
        Err(_) => return Err(Error::NameNotResolved(host.to_string())),
    };
    let mut last = None;
    for addr in &addrs {
        let res = match timeout {
            Some(t) => TcpStream::connect_timeout(addr, t),
            None => TcpStream::connect(addr),
        };
        match res {
            Ok(sock) => {
                sock.set_nodelay(true).map_err(Error::Io)?;
                sock.set_nonblocking(true).map_err(Error::Io)?;
                debug!("connected to {}:{} via {}", host, port, addr);
                return Ok(sock);
            }
            Err(e) => last = Some(e),
        }
    }
    Err(match last {
        Some(e) => Error::Io(e),
        None => Error::NameNotResolved(host.to_string()),
    })
}

fn map_io(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => Error::Closed,
        _ => Error::Io(e),
    }
}

#[cfg(feature = "tls")]
fn session_interest(conn: &ClientConnection) -> Interest {
    match (conn.wants_read(), conn.wants_write()) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (false, true) => Interest::WRITABLE,
        // when the session wants nothing, progress comes from reading
        _ => Interest::READABLE,
    }
}

impl Transport {
    pub fn connect(host: &str, port: u16, timeout: Option<Duration>) -> Result<Transport, Error> {
        let sock = connect_stream(host, port, timeout)?;
        let fd = sock.as_raw_fd();
        Ok(Transport {
            io: Io::Plain(sock),
            fd,
        })
    }

    #[cfg(feature = "tls")]
    pub fn connect_tls(
        host: &str,
        port: u16,
        tls: &Arc<ClientConfig>,
        timeout: Option<Duration>,
    ) -> Result<Transport, Error> {
        let mut sock = connect_stream(host, port, timeout)?;
        let name = ServerName::try_from(host)
            .map_err(|_| Error::State("hostname is not a valid TLS server name"))?;
        let mut conn = ClientConnection::new(tls.clone(), name)
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        let fd = sock.as_raw_fd();
        // drive the handshake here so the peer certificate is available as
        // soon as the connection exists
        while conn.is_handshaking() {
            match conn.complete_io(&mut sock) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let ready = PollNeeded::new(fd, session_interest(&conn))
                        .wait(timeout)
                        .map_err(Error::Io)?;
                    if !ready {
                        return Err(Error::TimedOut);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(map_io(e)),
            }
        }
        debug!("TLS handshake complete with {}:{}", host, port);
        Ok(Transport {
            io: Io::Tls(Box::new(StreamOwned::new(conn, sock))),
            fd,
        })
    }

    /// Pull bytes into `buf`; `Ready(0)` is clean EOF.
    pub fn try_read(&mut self, buf: &mut Buf, max: usize) -> Poll<usize> {
        loop {
            let res = match self.io {
                Io::Plain(ref mut s) => buf.fill(s, max),
                #[cfg(feature = "tls")]
                Io::Tls(ref mut s) => buf.fill(&mut **s, max),
            };
            match res {
                Ok(n) => return Ok(Async::Ready(n)),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Async::NotReady(self.poll_needed(Interest::READABLE)));
                }
                // a peer that skips close_notify still delivered its data
                Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(Async::Ready(0));
                }
                Err(e) => return Err(map_io(e)),
            }
        }
    }

    /// Push staged bytes from `buf`; `Ready(n)` is the count accepted.
    pub fn try_write(&mut self, buf: &mut Buf) -> Poll<usize> {
        loop {
            let res = match self.io {
                Io::Plain(ref mut s) => buf.write_to(s),
                #[cfg(feature = "tls")]
                Io::Tls(ref mut s) => buf.write_to(&mut **s),
            };
            match res {
                Ok(n) => return Ok(Async::Ready(n)),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Async::NotReady(self.poll_needed(Interest::WRITABLE)));
                }
                Err(e) => return Err(map_io(e)),
            }
        }
    }

    /// Drain transport-level buffering; a no-op for plain TCP, pending TLS
    /// records for a session.
    pub fn try_flush(&mut self) -> Poll<()> {
        match self.io {
            Io::Plain(..) => Ok(Async::Ready(())),
            #[cfg(feature = "tls")]
            Io::Tls(ref mut s) => loop {
                if !s.conn.wants_write() {
                    return Ok(Async::Ready(()));
                }
                match s.conn.write_tls(&mut s.sock) {
                    Ok(_) => {}
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(Async::NotReady(PollNeeded::new(self.fd, Interest::WRITABLE)));
                    }
                    Err(e) => return Err(map_io(e)),
                }
            },
        }
    }

    #[cfg(feature = "tls")]
    pub fn peer_certificate(&self) -> Option<&rustls::Certificate> {
        match self.io {
            Io::Plain(..) => None,
            Io::Tls(ref s) => s.conn.peer_certificates().and_then(|certs| certs.first()),
        }
    }

    pub fn shutdown(&mut self) {
        match self.io {
            Io::Plain(ref sock) => {
                let _ = sock.shutdown(Shutdown::Both);
            }
            #[cfg(feature = "tls")]
            Io::Tls(ref mut s) => {
                s.conn.send_close_notify();
                let _ = s.conn.write_tls(&mut s.sock);
                let _ = s.sock.shutdown(Shutdown::Both);
            }
        }
    }

    fn poll_needed(&self, logical: Interest) -> PollNeeded {
        let interest = match self.io {
            Io::Plain(..) => logical,
            #[cfg(feature = "tls")]
            Io::Tls(ref s) => session_interest(&s.conn),
        };
        PollNeeded::new(self.fd, interest)
    }
}
