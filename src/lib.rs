//! A single-connection HTTP/1.1 client engine with explicit pipelining.
//!
//! The engine drives one connection through two independent cursors: the
//! send side serializes requests, the receive side parses responses, and a
//! FIFO of pending-response records ties them together. Cooperative steps
//! that would block return [`Async::NotReady`] carrying the file descriptor
//! and the readiness direction the transport needs, so the caller (or the
//! built-in blocking wrappers) decides how to wait. The engine never owns
//! an event loop.

#[macro_use]
mod poll;

mod body;
mod buffer;
mod chunked;
mod config;
mod connection;
mod encoder;
mod error;
mod headers;
mod parser;
mod response;
mod transport;
mod version;

pub use crate::body::BodyKind;
pub use crate::config::Config;
pub use crate::connection::Connection;
pub use crate::encoder::RequestBody;
pub use crate::error::{Error, InvalidResponse};
pub use crate::headers::{HeaderError, HeaderMap};
pub use crate::poll::{Async, Interest, Poll, PollNeeded};
pub use crate::response::Response;
pub use crate::version::Version;
