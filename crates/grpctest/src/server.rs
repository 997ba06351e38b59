//! In-memory tonic server with a one-shot serve lifecycle.

use std::convert::Infallible;
use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::response::IntoResponse;
use tokio::sync::watch;
use tonic::body::Body;
use tonic::server::NamedService;
use tonic::service::RoutesBuilder;
use tonic::transport::{self, Endpoint};
use tower::Service;
use tracing::{debug, warn};

use crate::bufconn::BufListener;
use crate::client::{self, ClientConn, ConnectContext};
use crate::config;
use crate::error::{ConnectError, ServeError};

enum State {
    /// Services can still be registered.
    Idle {
        server: transport::Server,
        routes: RoutesBuilder,
    },
    Serving,
    Stopped {
        served: bool,
    },
}

struct Shared {
    listener: BufListener,
    state: Mutex<State>,
    shutdown: watch::Sender<bool>,
    done: watch::Sender<Option<Result<(), ServeError>>>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the terminal result. Only the first call has any effect.
    fn publish(&self, result: Result<(), ServeError>) {
        self.done.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        });
    }
}

/// A gRPC server listening on an in-memory [`BufListener`].
///
/// Register services with [`TestServer::add_service`], call
/// [`TestServer::start`], then obtain connections with
/// [`TestServer::client_conn`]. Clones share the same server.
#[derive(Clone)]
pub struct TestServer {
    shared: Arc<Shared>,
}

impl TestServer {
    /// Server with default tonic settings and the current default buffer size.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Server using a pre-configured tonic server builder.
    pub fn with_server(server: transport::Server) -> Self {
        Self::builder().server(server).build()
    }

    pub fn builder() -> TestServerBuilder {
        TestServerBuilder::default()
    }

    /// Register a service. Generated `*Server` types (optionally wrapped with
    /// an interceptor) are accepted as-is.
    ///
    /// # Panics
    ///
    /// Panics if the server has already been started or closed.
    pub fn add_service<S>(&self, svc: S) -> &Self
    where
        S: Service<http::Request<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Response: IntoResponse,
        S::Future: Send + 'static,
    {
        let registered = match &mut *self.shared.lock_state() {
            State::Idle { routes, .. } => {
                routes.add_service(svc);
                true
            }
            State::Serving | State::Stopped { .. } => false,
        };
        assert!(
            registered,
            "grpctest: services must be registered before the server is started"
        );
        debug!(service = S::NAME, "grpctest: registered service");
        self
    }

    /// Spawn the serve task on the current tokio runtime. Only the first call
    /// does anything.
    ///
    /// Starting a server that was already closed spawns nothing and makes
    /// [`TestServer::err`] report [`ServeError::Stopped`].
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn start(&self) {
        let mut state = self.shared.lock_state();
        let (mut server, routes) = match mem::replace(&mut *state, State::Serving) {
            State::Idle { server, routes } => (server, routes),
            State::Serving => return,
            State::Stopped { served } => {
                *state = State::Stopped { served };
                drop(state);
                if !served {
                    self.shared.publish(Err(ServeError::Stopped));
                }
                return;
            }
        };

        let incoming = match self.shared.listener.incoming() {
            Ok(incoming) => incoming,
            Err(err) => {
                *state = State::Stopped { served: false };
                drop(state);
                self.shared.publish(Err(err.into()));
                return;
            }
        };
        let mut shutdown = self.shared.shutdown.subscribe();
        drop(state);

        let router = server.add_routes(routes.routes());
        let shared = Arc::clone(&self.shared);
        debug!(
            buffer_size = shared.listener.capacity(),
            "grpctest: serving"
        );
        tokio::spawn(async move {
            let signal = async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            };
            let result = router
                .serve_with_incoming_shutdown(incoming, signal)
                .await
                .map_err(ServeError::from);
            match &result {
                Ok(()) => debug!("grpctest: server stopped"),
                Err(err) => warn!(error = %err, "grpctest: serve failed"),
            }
            shared.publish(result);
        });
    }

    /// Wait for the serve task to finish and return its result.
    ///
    /// `Ok(())` means the server was closed while serving. Every caller gets
    /// the same result. Never returns if the server is never started.
    ///
    /// ```no_run
    /// # async fn check(server: grpctest::TestServer) {
    /// match server.err().await {
    ///     Ok(()) => {}
    ///     Err(err) if err.is_stopped() => {}
    ///     Err(err) => panic!("server error: {err}"),
    /// }
    /// # }
    /// ```
    pub async fn err(&self) -> Result<(), ServeError> {
        let mut done = self.shared.done.subscribe();
        let outcome = done.wait_for(Option::is_some).await;
        match outcome.as_deref() {
            Ok(Some(result)) => result.clone(),
            _ => Err(ServeError::Stopped),
        }
    }

    /// Stop serving and close the listener, severing every established
    /// connection, then wait for the serve task to exit. RPCs still in flight
    /// fail; their handlers are not waited for. Safe to call repeatedly and
    /// before [`TestServer::start`].
    pub async fn close(&self) {
        if self.shutdown() {
            let _ = self.err().await;
        }
    }

    /// Close the server when the returned guard is dropped, including while
    /// a failing test unwinds.
    pub fn close_on_cleanup(&self) -> CloseGuard {
        CloseGuard {
            server: self.clone(),
        }
    }

    /// Synchronous part of close. Returns whether the server had been serving.
    fn shutdown(&self) -> bool {
        let served = {
            let mut state = self.shared.lock_state();
            let served = match &*state {
                State::Idle { .. } => false,
                State::Serving => true,
                State::Stopped { served } => *served,
            };
            *state = State::Stopped { served };
            served
        };
        if !self.shared.shutdown.send_replace(true) {
            debug!(served, "grpctest: closing server");
        }
        self.shared.listener.close();
        served
    }

    /// A ready connection with default settings.
    pub async fn client_conn(&self) -> Result<ClientConn, ConnectError> {
        self.client_conn_context(&ConnectContext::background(), None)
            .await
    }

    /// A ready connection using the caller's endpoint settings. The endpoint's
    /// target is never dialed; traffic always goes through this server's
    /// listener.
    pub async fn client_conn_with(&self, endpoint: Endpoint) -> Result<ClientConn, ConnectError> {
        self.client_conn_context(&ConnectContext::background(), Some(endpoint))
            .await
    }

    /// Like [`TestServer::client_conn_with`], bounded by `ctx` as well as
    /// [`READY_TIMEOUT`](crate::READY_TIMEOUT).
    pub async fn client_conn_context(
        &self,
        ctx: &ConnectContext,
        endpoint: Option<Endpoint>,
    ) -> Result<ClientConn, ConnectError> {
        client::connect(&self.shared.listener, ctx, endpoint).await
    }

    /// Buffer size of this server's pipes, fixed at construction.
    pub fn buffer_size(&self) -> usize {
        self.shared.listener.capacity()
    }

    pub fn listener(&self) -> &BufListener {
        &self.shared.listener
    }
}

impl Default for TestServer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TestServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.shared.lock_state() {
            State::Idle { .. } => "idle",
            State::Serving => "serving",
            State::Stopped { .. } => "stopped",
        };
        f.debug_struct("TestServer")
            .field("state", &state)
            .field("listener", &self.shared.listener)
            .finish()
    }
}

/// Builder for [`TestServer`].
#[derive(Default)]
pub struct TestServerBuilder {
    server: Option<transport::Server>,
    buffer_size: Option<usize>,
}

impl TestServerBuilder {
    pub fn server(mut self, server: transport::Server) -> Self {
        self.server = Some(server);
        self
    }

    /// Pipe capacity for this server, instead of the process-wide default.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    /// # Panics
    ///
    /// Panics if an explicit buffer size of zero was given.
    pub fn build(self) -> TestServer {
        let capacity = self.buffer_size.unwrap_or_else(config::buffer_size);
        let (shutdown, _) = watch::channel(false);
        let (done, _) = watch::channel(None);
        TestServer {
            shared: Arc::new(Shared {
                listener: BufListener::new(capacity),
                state: Mutex::new(State::Idle {
                    server: self.server.unwrap_or_else(transport::Server::builder),
                    routes: RoutesBuilder::default(),
                }),
                shutdown,
                done,
            }),
        }
    }
}

/// Closes its server on drop. See [`TestServer::close_on_cleanup`].
#[must_use = "the server is closed as soon as the guard is dropped"]
pub struct CloseGuard {
    server: TestServer,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}
