use std::net::SocketAddr;
use std::time::Duration;

/// Default OpenADR 2.0b simpleHttp path prefix.
pub const DEFAULT_PATH_PREFIX: &str = "/OpenADR2/Simple/2.0b";

/// Default listener address for a VTN.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

/// Configuration shared by [`HttpClient`](crate::HttpClient) and
/// [`VtnListener`](crate::VtnListener).
///
/// Builder style, everything has a default:
///
/// ```rust
/// use oadr_transport::HttpConfig;
///
/// let config = HttpConfig::new()
///     .vtn_url("http://localhost:8080/OpenADR2/Simple/2.0b")
///     .request_timeout(std::time::Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// VTN base URL including the path prefix (client side).
    pub(crate) vtn_url: Option<String>,
    /// Path prefix the listener serves under (server side).
    pub(crate) path_prefix: String,
    /// Socket the listener binds (server side).
    pub(crate) listen_addr: SocketAddr,
    pub(crate) content_type: String,
    pub(crate) request_timeout: Duration,
    pub(crate) max_message_size: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpConfig {
    /// Create a config with defaults.
    ///
    /// `OADR_VTN_URL` and `OADR_LISTEN_ADDR` are picked up from the
    /// environment when set; the builder methods override them.
    pub fn new() -> Self {
        let vtn_url = std::env::var("OADR_VTN_URL").ok();
        let listen_addr = std::env::var("OADR_LISTEN_ADDR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| {
                DEFAULT_LISTEN_ADDR
                    .parse()
                    .unwrap_or(SocketAddr::from(([127, 0, 0, 1], 8080)))
            });

        Self {
            vtn_url,
            path_prefix: DEFAULT_PATH_PREFIX.to_string(),
            listen_addr,
            content_type: "application/xml".to_string(),
            request_timeout: Duration::from_secs(30),
            max_message_size: 1024 * 1024, // 1 MB
        }
    }

    /// VTN base URL, e.g. `http://vtn.example.com/OpenADR2/Simple/2.0b`.
    pub fn vtn_url(mut self, url: impl Into<String>) -> Self {
        self.vtn_url = Some(url.into().trim_end_matches('/').to_string());
        self
    }

    /// Path prefix for the listener (default `/OpenADR2/Simple/2.0b`).
    pub fn path_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let trimmed = prefix.trim_end_matches('/');
        self.path_prefix = if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{trimmed}")
        };
        self
    }

    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Content type put on requests and responses (default `application/xml`).
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Largest accepted message body in bytes (default 1 MB).
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    pub fn get_path_prefix(&self) -> &str {
        &self.path_prefix
    }

    pub fn get_vtn_url(&self) -> Option<&str> {
        self.vtn_url.as_deref()
    }
}
