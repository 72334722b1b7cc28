//! OpenADR 2.0b simpleHttp transport.
//!
//! The VEN side POSTs one request per OpenADR exchange with [`HttpClient`];
//! the VTN side serves one sub-path per [`Service`] with [`VtnListener`]
//! and hands bodies to a [`RequestHandler`]. Bodies are opaque bytes here:
//! signing, replay protection and message decoding live in `oadr-protocol`.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use oadr_transport::{HttpClient, HttpConfig, Service};
//!
//! # async fn example() -> Result<(), oadr_transport::OadrTransportError> {
//! let config = HttpConfig::new().vtn_url("http://localhost:8080/OpenADR2/Simple/2.0b");
//! let client = HttpClient::new(&config)?;
//! let reply = client.post(Service::OadrPoll, b"...".to_vec()).await?;
//! println!("{} bytes back", reply.len());
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;
mod server;
mod service;

pub use client::HttpClient;
pub use config::{HttpConfig, DEFAULT_LISTEN_ADDR, DEFAULT_PATH_PREFIX};
pub use error::OadrTransportError;
pub use server::{HttpReply, RequestHandler, VtnListener};
pub use service::Service;
