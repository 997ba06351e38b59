//! In-memory gRPC servers for integration tests.
//!
//! A [`TestServer`] serves tonic services over in-process pipes instead of a
//! socket: no ports, no kernel I/O, but the full HTTP/2 + gRPC stack,
//! interceptors included.
//!
//! ```no_run
//! # use grpctest::TestServer;
//! # async fn example<S>(svc: S) -> Result<(), Box<dyn std::error::Error>>
//! # where
//! #     S: tower::Service<http::Request<tonic::body::Body>, Error = std::convert::Infallible>
//! #         + tonic::server::NamedService + Clone + Send + Sync + 'static,
//! #     S::Response: axum::response::IntoResponse,
//! #     S::Future: Send + 'static,
//! # {
//! let server = TestServer::new();
//! let _guard = server.close_on_cleanup();
//!
//! server.add_service(svc);
//! server.start();
//!
//! let conn = server.client_conn().await?;
//! let channel = conn.channel();
//! // Build a generated client from `channel` and issue RPCs.
//! # let _ = channel;
//! # Ok(())
//! # }
//! ```
//!
//! The pipe capacity defaults to [`DEFAULT_BUFFER_SIZE`] and can be changed
//! process-wide with [`set_buffer_size`] or per server with
//! [`TestServerBuilder::buffer_size`].

pub mod bufconn;
pub mod client;
pub mod config;
pub mod error;
pub mod server;
pub mod tracing;

pub use bufconn::{BufConn, BufConnInfo, BufListener};
pub use client::{ClientConn, ConnectContext, ConnectivityState, READY_TIMEOUT};
pub use config::{
    BufferSizeGuard, DEFAULT_BUFFER_SIZE, buffer_size, override_buffer_size, reset_buffer_size,
    set_buffer_size,
};
pub use error::{BufconnError, ConnectError, ServeError};
pub use server::{CloseGuard, TestServer, TestServerBuilder};
