use reqwest::header::CONTENT_TYPE;

use crate::config::HttpConfig;
use crate::{OadrTransportError, Service};

/// VEN-side HTTP client: one POST per OpenADR request, response body returned.
///
/// Cheap to clone; the underlying connection pool is shared.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
    base_url: String,
    content_type: String,
    max_message_size: usize,
}

impl HttpClient {
    /// Build a client for the VTN configured in `config`.
    pub fn new(config: &HttpConfig) -> Result<Self, OadrTransportError> {
        let base_url = config
            .vtn_url
            .clone()
            .ok_or_else(|| OadrTransportError::Config("no VTN URL configured".into()))?;
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(OadrTransportError::Config(format!(
                "VTN URL must start with http:// or https://, got {base_url}"
            )));
        }

        let inner = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| OadrTransportError::Request {
                url: base_url.clone(),
                source: e,
            })?;

        Ok(Self {
            inner,
            base_url,
            content_type: config.content_type.clone(),
            max_message_size: config.max_message_size,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full URL of a service endpoint.
    pub fn url_for(&self, service: Service) -> String {
        format!("{}/{}", self.base_url, service)
    }

    /// POST `body` to the given service and return the response body.
    ///
    /// Non-2xx answers come back as [`OadrTransportError::Status`].
    pub async fn post(&self, service: Service, body: Vec<u8>) -> Result<Vec<u8>, OadrTransportError> {
        if body.len() > self.max_message_size {
            return Err(OadrTransportError::MessageTooLarge {
                size: body.len(),
                max: self.max_message_size,
            });
        }

        let url = self.url_for(service);
        tracing::debug!(%url, bytes = body.len(), "POST");

        let response = self
            .inner
            .post(&url)
            .header(CONTENT_TYPE, &self.content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    OadrTransportError::Connect {
                        url: url.clone(),
                        source: e,
                    }
                } else {
                    OadrTransportError::Request {
                        url: url.clone(),
                        source: e,
                    }
                }
            })?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| OadrTransportError::Request {
                url: url.clone(),
                source: e,
            })?;

        if !status.is_success() {
            return Err(OadrTransportError::Status {
                url,
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        if bytes.len() > self.max_message_size {
            return Err(OadrTransportError::MessageTooLarge {
                size: bytes.len(),
                max: self.max_message_size,
            });
        }

        Ok(bytes.to_vec())
    }
}
