use std::fmt;

/// HTTP version as it appears on request and status lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// Version 1.0 of the HTTP protocol (recognized only to be rejected)
    Http10,
    /// Version 1.1 of the HTTP protocol
    Http11,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Version::Http10 => f.write_str("HTTP/1.0"),
            Version::Http11 => f.write_str("HTTP/1.1"),
        }
    }
}
