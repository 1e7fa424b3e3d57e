use crate::body::BodyKind;
use crate::headers::HeaderMap;

/// A parsed response head, immutable once produced.
///
/// The method and path of the request it answers are echoed for
/// correlation, since pipelined responses arrive strictly in send order.
#[derive(Debug)]
pub struct Response {
    pub(crate) code: u16,
    pub(crate) reason: String,
    pub(crate) headers: HeaderMap,
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) body: BodyKind,
}

impl Response {
    /// Raw status code as received.
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Reason phrase as received.
    ///
    /// Note: the reason string may not match the status code or may even
    /// be an empty string.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Method of the request this response answers.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Path of the request this response answers.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The body length discipline decided from the header set.
    pub fn body_kind(&self) -> BodyKind {
        self.body
    }

    /// True for interim (1xx) responses.
    pub fn is_interim(&self) -> bool {
        self.code >= 100 && self.code < 200
    }
}
