//! Integration tests: HttpClient against a VtnListener on localhost.

use std::net::SocketAddr;
use std::sync::Arc;

use oadr_transport::{
    HttpClient, HttpConfig, HttpReply, OadrTransportError, RequestHandler, Service, VtnListener,
};

/// Echoes the body back, prefixed with the service name. Rejects EiOpt.
struct EchoHandler;

#[async_trait::async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(&self, service: Service, body: Vec<u8>) -> HttpReply {
        if service == Service::EiOpt {
            return HttpReply::empty(400);
        }
        let mut out = format!("{service}:").into_bytes();
        out.extend_from_slice(&body);
        HttpReply::ok(out)
    }
}

async fn start() -> (VtnListener, HttpClient) {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();

    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server_config = HttpConfig::new().listen_addr(addr);
    let listener = VtnListener::bind(&server_config, Arc::new(EchoHandler))
        .await
        .unwrap();

    let url = format!(
        "http://{}{}",
        listener.local_addr(),
        server_config.get_path_prefix()
    );
    let client = HttpClient::new(&HttpConfig::new().vtn_url(url)).unwrap();
    (listener, client)
}

#[tokio::test]
async fn post_reaches_the_right_service() {
    let (listener, client) = start().await;

    let reply = client
        .post(Service::OadrPoll, b"hello".to_vec())
        .await
        .unwrap();
    assert_eq!(reply, b"OadrPoll:hello");

    let reply = client.post(Service::EiEvent, Vec::new()).await.unwrap();
    assert_eq!(reply, b"EiEvent:");

    listener.shutdown().await;
}

#[tokio::test]
async fn non_success_status_is_a_transient_error() {
    let (listener, client) = start().await;

    let err = client
        .post(Service::EiOpt, b"x".to_vec())
        .await
        .unwrap_err();
    match &err {
        OadrTransportError::Status { status, .. } => assert_eq!(*status, 400),
        other => panic!("expected Status error, got {other:?}"),
    }
    assert!(err.is_transient());

    listener.shutdown().await;
}

#[tokio::test]
async fn unreachable_vtn_is_a_transient_error() {
    // Bind then drop to get a port nobody listens on.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let client = HttpClient::new(
        &HttpConfig::new().vtn_url(format!("http://{addr}/OpenADR2/Simple/2.0b")),
    )
    .unwrap();
    let err = client
        .post(Service::OadrPoll, b"x".to_vec())
        .await
        .unwrap_err();
    assert!(err.is_transient(), "got {err:?}");
}

#[tokio::test]
async fn oversized_body_is_refused_client_side() {
    let config = HttpConfig::new()
        .vtn_url("http://127.0.0.1:9/OpenADR2/Simple/2.0b")
        .max_message_size(4);
    let client = HttpClient::new(&config).unwrap();
    let err = client
        .post(Service::EiReport, vec![0u8; 5])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OadrTransportError::MessageTooLarge { size: 5, max: 4 }
    ));
}

#[tokio::test]
async fn oversized_body_is_refused_by_the_listener() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server_config = HttpConfig::new().listen_addr(addr).max_message_size(8);
    let listener = VtnListener::bind(&server_config, Arc::new(EchoHandler))
        .await
        .unwrap();
    let url = format!(
        "http://{}{}",
        listener.local_addr(),
        server_config.get_path_prefix()
    );
    let client = HttpClient::new(&HttpConfig::new().vtn_url(url)).unwrap();

    let reply = client.post(Service::OadrPoll, vec![1u8; 8]).await.unwrap();
    assert_eq!(reply.len(), "OadrPoll:".len() + 8);

    let err = client
        .post(Service::OadrPoll, vec![1u8; 1024])
        .await
        .unwrap_err();
    match err {
        OadrTransportError::Status { status, .. } => assert_eq!(status, 413),
        other => panic!("expected Status error, got {other:?}"),
    }

    listener.shutdown().await;
}
