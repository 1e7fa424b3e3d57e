use std::sync::Arc;
use std::time::Duration;

/// Fine-grained configuration of the HTTP connection.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) max_line_size: usize,
    pub(crate) max_headers_size: usize,
    pub(crate) timeout: Option<Duration>,
    pub(crate) proxy: Option<(String, u16)>,
    pub(crate) send_content_md5: bool,
}

impl Config {
    /// Create a config with defaults.
    pub fn new() -> Config {
        Config {
            max_line_size: 65536,
            max_headers_size: 65536,
            timeout: None,
            proxy: None,
            send_content_md5: false,
        }
    }

    /// Upper bound on any single header or chunk-size line.
    pub fn max_line_size(&mut self, value: usize) -> &mut Self {
        self.max_line_size = value;
        self
    }

    /// Upper bound on a full header block.
    pub fn max_headers_size(&mut self, value: usize) -> &mut Self {
        self.max_headers_size = value;
        self
    }

    /// Soft per-operation deadline applied by the blocking wrappers.
    ///
    /// Cooperative (`poll_*`) callers are expected to enforce their own
    /// deadlines; the engine does not.
    pub fn timeout(&mut self, value: Option<Duration>) -> &mut Self {
        self.timeout = value;
        self
    }

    /// Route requests through a plain-HTTP proxy.
    ///
    /// The connection dials the proxy instead of the origin and emits
    /// absolute-form request targets. Not available together with TLS.
    pub fn proxy(&mut self, host: &str, port: u16) -> &mut Self {
        self.proxy = Some((host.to_string(), port));
        self
    }

    /// Attach a `Content-MD5` header to inline request bodies.
    pub fn send_content_md5(&mut self, value: bool) -> &mut Self {
        self.send_content_md5 = value;
        self
    }

    /// Create an Arc'd config clone to pass to the constructor.
    ///
    /// This is just a convenience method.
    pub fn done(&mut self) -> Arc<Config> {
        Arc::new(self.clone())
    }
}
