use std::sync::Arc;

use crate::client::ConnectivityState;

/// Errors from the in-memory listener.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufconnError {
    #[error("bufconn: listener closed")]
    Closed,
    #[error("bufconn: incoming connections already taken")]
    IncomingTaken,
    #[error("bufconn: connection shut down")]
    Shutdown,
}

/// Terminal result of a server's serve task, shared by every `err()` caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServeError {
    /// Graceful-stop sentinel: the server was closed before it could serve.
    #[error("grpctest: server stopped")]
    Stopped,
    #[error("grpctest: listener unavailable: {0}")]
    Listener(#[from] BufconnError),
    #[error("grpctest: serve failed: {0}")]
    Transport(#[source] Arc<tonic::transport::Error>),
}

impl ServeError {
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl From<tonic::transport::Error> for ServeError {
    fn from(err: tonic::transport::Error) -> Self {
        Self::Transport(Arc::new(err))
    }
}

/// Failure to obtain a ready client connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    #[error("grpctest: deadline exceeded waiting for connection (state: {state}{})", fmt_last(.last_error))]
    DeadlineExceeded {
        state: ConnectivityState,
        last_error: Option<String>,
    },
    #[error("grpctest: connection attempt cancelled")]
    Cancelled,
}

impl ConnectError {
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

fn fmt_last(last_error: &Option<String>) -> String {
    match last_error {
        Some(err) => format!(", last error: {err}"),
        None => String::new(),
    }
}
