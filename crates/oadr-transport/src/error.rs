use std::net::SocketAddr;

/// Errors returned by the OpenADR HTTP transport.
#[derive(Debug, thiserror::Error)]
pub enum OadrTransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("could not connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with HTTP {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("listener is shut down")]
    Shutdown,

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl OadrTransportError {
    /// Connection failures and non-2xx answers. Callers treat these as
    /// "no message received" and carry on.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OadrTransportError::Connect { .. }
                | OadrTransportError::Request { .. }
                | OadrTransportError::Status { .. }
        )
    }
}
