//! Transport abstraction for the VEN engine.
//!
//! The engine only needs "post these bytes to that service and give me the
//! answer". `HttpClient` does it over HTTP; [`Loopback`] hands the bytes
//! straight to an in-process VTN.

use std::sync::Arc;

use async_trait::async_trait;
use oadr_transport::{HttpClient, OadrTransportError, RequestHandler, Service};

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Posts `body` to `service`. Non-success statuses are errors.
    async fn post(&self, service: Service, body: Vec<u8>) -> Result<Vec<u8>, OadrTransportError>;
}

#[async_trait]
impl Transport for HttpClient {
    async fn post(&self, service: Service, body: Vec<u8>) -> Result<Vec<u8>, OadrTransportError> {
        HttpClient::post(self, service, body).await
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn post(&self, service: Service, body: Vec<u8>) -> Result<Vec<u8>, OadrTransportError> {
        (**self).post(service, body).await
    }
}

/// In-process transport calling a [`RequestHandler`] directly.
pub struct Loopback<H> {
    handler: Arc<H>,
}

impl<H: RequestHandler> Loopback<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }
}

impl<H> Clone for Loopback<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
        }
    }
}

#[async_trait]
impl<H: RequestHandler> Transport for Loopback<H> {
    async fn post(&self, service: Service, body: Vec<u8>) -> Result<Vec<u8>, OadrTransportError> {
        let reply = self.handler.handle(service, body).await;
        if (200..300).contains(&reply.status) {
            Ok(reply.body)
        } else {
            Err(OadrTransportError::Status {
                url: format!("loopback:/{}", service.as_str()),
                status: reply.status,
                body: String::from_utf8_lossy(&reply.body).into_owned(),
            })
        }
    }
}
