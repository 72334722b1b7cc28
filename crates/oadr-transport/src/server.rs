use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::HttpConfig;
use crate::{OadrTransportError, Service};

/// What the VTN engine answers for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn ok(body: Vec<u8>) -> Self {
        Self { status: 200, body }
    }

    /// Empty body with the given status (dropped or unauthenticated messages).
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
        }
    }
}

/// Server-side seam: the VTN engine implements this, the listener calls it.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, service: Service, body: Vec<u8>) -> HttpReply;
}

struct ListenerState<H> {
    handler: Arc<H>,
    path_prefix: String,
    content_type: String,
    max_message_size: usize,
}

/// HTTP/1 listener serving one sub-path per [`Service`] under the prefix.
pub struct VtnListener {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl VtnListener {
    /// Bind the configured address and start accepting connections.
    pub async fn bind<H: RequestHandler>(
        config: &HttpConfig,
        handler: Arc<H>,
    ) -> Result<Self, OadrTransportError> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|e| OadrTransportError::Bind {
                addr: config.listen_addr,
                source: e,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| OadrTransportError::Bind {
                addr: config.listen_addr,
                source: e,
            })?;

        let state = Arc::new(ListenerState {
            handler,
            path_prefix: config.path_prefix.clone(),
            content_type: config.content_type.clone(),
            max_message_size: config.max_message_size,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tracing::info!(%local_addr, prefix = %config.path_prefix, "VTN listening");
        let task = tokio::spawn(accept_loop(listener, state, shutdown_rx));

        Ok(Self {
            local_addr,
            shutdown_tx,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections. In-flight requests finish on their own tasks.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

async fn accept_loop<H: RequestHandler>(
    listener: TcpListener,
    state: Arc<ListenerState<H>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("accept failed: {e}");
                        continue;
                    }
                };
                let state = state.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(serve(req, &state).await) }
                    });
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        tracing::debug!(%peer, "connection closed with error: {e}");
                    }
                });
            }
            _ = shutdown_rx.changed() => {
                tracing::info!("VTN listener shutting down");
                break;
            }
        }
    }
}

async fn serve<H: RequestHandler>(
    req: Request<Incoming>,
    state: &ListenerState<H>,
) -> Response<Full<Bytes>> {
    let Some(service) = route(&state.path_prefix, req.uri().path()) else {
        return respond(StatusCode::NOT_FOUND, &state.content_type, Vec::new());
    };
    if req.method() != Method::POST {
        return respond(StatusCode::METHOD_NOT_ALLOWED, &state.content_type, Vec::new());
    }

    let body = match Limited::new(req.into_body(), state.max_message_size)
        .collect()
        .await
    {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => {
            tracing::warn!(%service, max = state.max_message_size, "request body too large");
            return respond(StatusCode::PAYLOAD_TOO_LARGE, &state.content_type, Vec::new());
        }
        Err(e) => {
            tracing::warn!(%service, "failed to read request body: {e}");
            return respond(StatusCode::BAD_REQUEST, &state.content_type, Vec::new());
        }
    };

    let reply = state.handler.handle(service, body.to_vec()).await;
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    respond(status, &state.content_type, reply.body)
}

/// Map a request path to its service, if it lives under `prefix`.
fn route(prefix: &str, path: &str) -> Option<Service> {
    let rest = path.strip_prefix(prefix)?;
    let name = rest.trim_matches('/');
    name.parse().ok()
}

fn respond(status: StatusCode, content_type: &str, body: Vec<u8>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_under_prefix() {
        let prefix = "/OpenADR2/Simple/2.0b";
        assert_eq!(
            route(prefix, "/OpenADR2/Simple/2.0b/OadrPoll"),
            Some(Service::OadrPoll)
        );
        assert_eq!(
            route(prefix, "/OpenADR2/Simple/2.0b/EiEvent/"),
            Some(Service::EiEvent)
        );
    }

    #[test]
    fn route_rejects_foreign_paths() {
        let prefix = "/OpenADR2/Simple/2.0b";
        assert_eq!(route(prefix, "/other/OadrPoll"), None);
        assert_eq!(route(prefix, "/OpenADR2/Simple/2.0b/Nope"), None);
        assert_eq!(route(prefix, "/OpenADR2/Simple/2.0b"), None);
    }
}
