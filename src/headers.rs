//! Case-insensitive, order-preserving header multimap.

use quick_error::quick_error;

/// Headers that must not occur more than once in one message.
const SINGLETON: &[&str] = &["Content-Length", "Transfer-Encoding", "Expect", "Host"];

quick_error! {
    /// A header rejected at construction time.
    #[derive(Debug)]
    pub enum HeaderError {
        InvalidHeaderName {
            description("header name contains invalid characters")
        }
        InvalidHeaderValue {
            description("header value contains invalid characters")
        }
        DuplicateSingleton(name: &'static str) {
            description("singleton header appears twice")
            display("{} must not appear twice", name)
        }
    }
}

fn valid_name(name: &str) -> bool {
    // a field name is a token: visible ASCII minus the colon
    !name.is_empty() && name.bytes().all(|b| b > 0x20 && b < 0x7f && b != b':')
}

fn valid_value(value: &str) -> bool {
    // values are latin-1 on the wire; CR, LF and NUL can not be encoded
    value
        .chars()
        .all(|c| c != '\0' && c != '\r' && c != '\n' && (c as u32) <= 0xff)
}

fn singleton(name: &str) -> Option<&'static str> {
    SINGLETON
        .iter()
        .find(|s| name.eq_ignore_ascii_case(s))
        .copied()
}

/// Decode wire bytes as latin-1.
pub(crate) fn latin1(value: &[u8]) -> String {
    value.iter().map(|&b| b as char).collect()
}

/// An order-preserving multimap with case-insensitive keys.
///
/// Keys keep their original case for emission; lookups fold case. Duplicate
/// keys are allowed except for the singletons `Content-Length`,
/// `Transfer-Encoding`, `Expect` and `Host`.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    items: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> HeaderMap {
        HeaderMap { items: Vec::new() }
    }

    /// Append a header, validating the name, the value and the singleton
    /// rule.
    pub fn add(&mut self, name: &str, value: &str) -> Result<(), HeaderError> {
        if !valid_name(name) {
            return Err(HeaderError::InvalidHeaderName);
        }
        if !valid_value(value) {
            return Err(HeaderError::InvalidHeaderValue);
        }
        if let Some(canon) = singleton(name) {
            if self.contains(name) {
                return Err(HeaderError::DuplicateSingleton(canon));
            }
        }
        self.items.push((name.to_string(), value.to_string()));
        Ok(())
    }

    /// Append a header decoded from the wire. Only the singleton rule is
    /// checked; the wire parser already rejected malformed lines.
    pub(crate) fn add_wire(&mut self, name: &str, value: &[u8]) -> Result<(), &'static str> {
        if let Some(canon) = singleton(name) {
            if self.contains(name) {
                return Err(canon);
            }
        }
        self.items.push((name.to_string(), latin1(value)));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.items.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// The last value stored under `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.items
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values stored under `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.items
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All `(name, value)` pairs in insertion order, original case.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// Header values are comma-separated lists on the wire; whitespace around
// the tokens is insignificant.

pub(crate) fn is_close(value: &str) -> bool {
    value
        .split(',')
        .any(|t| t.trim().eq_ignore_ascii_case("close"))
}

pub(crate) fn is_chunked(value: &str) -> bool {
    // only the last applied transfer coding makes the body chunked
    value
        .split(',')
        .last()
        .map_or(false, |t| t.trim().eq_ignore_ascii_case("chunked"))
}

pub(crate) fn is_continue(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("100-continue")
}
