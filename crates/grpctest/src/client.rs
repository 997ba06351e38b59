//! Client connections dialed through a server's in-memory listener.
//!
//! The connection factory builds a tonic [`Channel`] whose connector always
//! dials the [`BufListener`], drives it out of [`ConnectivityState::Idle`] and
//! waits until it reports [`ConnectivityState::Ready`], bounded by
//! [`READY_TIMEOUT`] and the caller's [`ConnectContext`].

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use http::Uri;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tower::Service;
use tracing::{debug, trace};

use crate::bufconn::{BufConn, BufListener};
use crate::error::{BufconnError, ConnectError};

/// Upper bound on how long the factory waits for a connection to become ready.
///
/// This is a ceiling, not a target: the factory returns as soon as the
/// connection is ready, and a sooner context deadline wins.
pub const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Synthetic target. The connector ignores it; it only fills `:authority`.
const TARGET: &str = "http://grpctest.bufconn";

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Lifecycle states of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    /// Terminal.
    Shutdown,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Ready => "READY",
            Self::TransientFailure => "TRANSIENT_FAILURE",
            Self::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// Deadline and cancellation for a connection attempt.
///
/// The default context has neither, so only [`READY_TIMEOUT`] applies.
#[derive(Debug, Clone, Default)]
pub struct ConnectContext {
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
}

impl ConnectContext {
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: None,
        }
    }

    /// Abort the attempt when `token` is cancelled.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The error this context already carries, if it is cancelled or expired.
    pub fn err(&self) -> Option<ConnectError> {
        if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Some(ConnectError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Some(ConnectError::DeadlineExceeded {
                state: ConnectivityState::Idle,
                last_error: None,
            }),
            _ => None,
        }
    }

    fn effective_deadline(&self, ceiling: Instant) -> Instant {
        match self.deadline {
            Some(deadline) => deadline.min(ceiling),
            None => ceiling,
        }
    }

    async fn cancelled(&self) {
        match &self.cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    }
}

/// Connectivity state shared by the driver, the dialer and the tracked I/O.
#[derive(Clone)]
struct StateCell {
    tx: Arc<watch::Sender<ConnectivityState>>,
    last_error: Arc<Mutex<Option<String>>>,
    /// Bumped on every successful dial; only the newest pipe reports failures.
    generation: Arc<AtomicU64>,
}

impl StateCell {
    fn new() -> Self {
        let (tx, _) = watch::channel(ConnectivityState::Idle);
        Self {
            tx: Arc::new(tx),
            last_error: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn get(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    fn set(&self, next: ConnectivityState) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == next || *current == ConnectivityState::Shutdown {
                return false;
            }
            trace!(from = %current, to = %next, "grpctest: connectivity change");
            *current = next;
            true
        })
    }

    fn fail(&self, err: &(dyn StdError + 'static)) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(describe(err));
        self.set(ConnectivityState::TransientFailure);
    }

    fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }

    async fn wait_for_change(&self, from: ConnectivityState) -> ConnectivityState {
        let mut rx = self.subscribe();
        match rx.wait_for(|state| *state != from).await {
            Ok(state) => *state,
            Err(_) => ConnectivityState::Shutdown,
        }
    }

    async fn shutdown_requested(&self) {
        self.wait_for_change_to(ConnectivityState::Shutdown).await;
    }

    async fn wait_for_change_to(&self, target: ConnectivityState) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| *state == target).await;
    }
}

fn describe(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Connector handed to tonic. Whatever target the endpoint names, it dials
/// the in-memory listener.
#[derive(Clone)]
struct BufDialer {
    listener: BufListener,
    state: StateCell,
    established: Arc<AtomicBool>,
}

impl BufDialer {
    async fn dial(self) -> Result<TokioIo<TrackedConn>, BufconnError> {
        if self.state.get() == ConnectivityState::Shutdown {
            return Err(BufconnError::Shutdown);
        }
        self.state.set(ConnectivityState::Connecting);

        match self.listener.dial().await {
            Ok(conn) => {
                debug!(id = conn.id(), "grpctest: dialed in-memory connection");
                let generation = self.state.next_generation();
                Ok(TokioIo::new(TrackedConn {
                    conn,
                    state: self.state,
                    generation,
                    // tonic reconnecting an established channel.
                    ready_on_read: self.established.load(Ordering::SeqCst),
                }))
            }
            Err(err) => {
                self.state.fail(&err);
                Err(err)
            }
        }
    }
}

impl Service<Uri> for BufDialer {
    type Response = TokioIo<TrackedConn>;
    type Error = BufconnError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _target: Uri) -> Self::Future {
        Box::pin(self.clone().dial())
    }
}

/// Client end of a pipe that reports EOF, I/O errors and being dropped while
/// ready as transient failure, and refuses I/O once the connection is shut down.
struct TrackedConn {
    conn: BufConn,
    state: StateCell,
    generation: u64,
    /// Mark the connection ready once the server first answers on this pipe.
    ready_on_read: bool,
}

impl TrackedConn {
    fn fail(&self, err: &(dyn StdError + 'static)) {
        if self.state.is_current(self.generation) {
            self.state.fail(err);
        }
    }

    fn check_open(&self) -> io::Result<()> {
        if self.state.get() == ConnectivityState::Shutdown {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                BufconnError::Shutdown,
            ));
        }
        Ok(())
    }
}

impl AsyncRead for TrackedConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check_open()?;

        let wanted = buf.remaining() > 0;
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.conn).poll_read(cx, buf);
        match &poll {
            Poll::Ready(Ok(())) if wanted && buf.filled().len() == before => {
                let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer");
                this.fail(&eof);
            }
            Poll::Ready(Ok(())) if this.ready_on_read && buf.filled().len() > before => {
                this.ready_on_read = false;
                if this.state.is_current(this.generation) {
                    this.state.set(ConnectivityState::Ready);
                }
            }
            Poll::Ready(Err(err)) => this.fail(err),
            _ => {}
        }
        poll
    }
}

impl AsyncWrite for TrackedConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.check_open()?;

        let poll = Pin::new(&mut this.conn).poll_write(cx, buf);
        if let Poll::Ready(Err(err)) = &poll {
            this.fail(err);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check_open()?;
        Pin::new(&mut this.conn).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().conn).poll_shutdown(cx)
    }
}

impl Drop for TrackedConn {
    fn drop(&mut self) {
        if self.state.get() == ConnectivityState::Ready {
            let closed = io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed");
            self.fail(&closed);
        }
    }
}

/// A connection that has not been handed to the caller yet.
struct Dial {
    endpoint: Endpoint,
    dialer: BufDialer,
    channel: Arc<OnceLock<Channel>>,
}

impl Dial {
    /// Lazily constructed: nothing is dialed until [`Dial::connect`].
    fn new(listener: BufListener, endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            dialer: BufDialer {
                listener,
                state: StateCell::new(),
                established: Arc::new(AtomicBool::new(false)),
            },
            channel: Arc::new(OnceLock::new()),
        }
    }

    fn state(&self) -> &StateCell {
        &self.dialer.state
    }

    /// Leave idle and keep trying to establish the channel until it is ready
    /// or the dial is shut down.
    fn connect(&self) {
        let state = self.state().clone();
        if !state.set(ConnectivityState::Connecting) {
            return;
        }

        let endpoint = self.endpoint.clone();
        let dialer = self.dialer.clone();
        let channel = Arc::clone(&self.channel);
        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            loop {
                let attempt = tokio::select! {
                    result = endpoint.connect_with_connector(dialer.clone()) => result,
                    () = state.shutdown_requested() => return,
                };
                match attempt {
                    Ok(established) => {
                        let _ = channel.set(established);
                        dialer.established.store(true, Ordering::SeqCst);
                        state.set(ConnectivityState::Ready);
                        return;
                    }
                    Err(err) => {
                        state.fail(&err);
                        debug!(
                            error = %describe(&err),
                            backoff_ms = backoff.as_millis() as u64,
                            "grpctest: connection attempt failed"
                        );
                        tokio::select! {
                            () = tokio::time::sleep(backoff) => {}
                            () = state.shutdown_requested() => return,
                        }
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                        state.set(ConnectivityState::Connecting);
                    }
                }
            }
        });
    }

    fn ready_conn(&self) -> Option<ClientConn> {
        let channel = self.channel.get()?.clone();
        Some(ClientConn {
            channel,
            state: self.state().clone(),
        })
    }

    fn abandon(&self) {
        self.state().set(ConnectivityState::Shutdown);
    }
}

/// Dial `listener` and wait until the connection is ready.
pub(crate) async fn connect(
    listener: &BufListener,
    ctx: &ConnectContext,
    endpoint: Option<Endpoint>,
) -> Result<ClientConn, ConnectError> {
    let started = Instant::now();
    if let Some(err) = ctx.err() {
        return Err(err);
    }

    let dial = Dial::new(
        listener.clone(),
        endpoint.unwrap_or_else(|| Endpoint::from_static(TARGET)),
    );
    dial.connect();

    let deadline = ctx.effective_deadline(started + READY_TIMEOUT);
    let mut rx = dial.state().subscribe();
    loop {
        let state = *rx.borrow_and_update();
        if state == ConnectivityState::Ready {
            if let Some(conn) = dial.ready_conn() {
                return Ok(conn);
            }
        }

        let changed = tokio::select! {
            biased;
            () = ctx.cancelled() => {
                dial.abandon();
                return Err(ConnectError::Cancelled);
            }
            () = tokio::time::sleep_until(deadline) => false,
            changed = rx.changed() => changed.is_ok(),
        };
        if !changed {
            let err = ConnectError::DeadlineExceeded {
                state: dial.state().get(),
                last_error: dial.state().last_error(),
            };
            dial.abandon();
            return Err(err);
        }
    }
}

/// A ready client connection to a [`TestServer`](crate::TestServer).
///
/// Build generated clients from [`ClientConn::channel`]; interceptors and
/// message limits are configured on the generated client as usual.
#[derive(Clone)]
pub struct ClientConn {
    channel: Channel,
    state: StateCell,
}

impl ClientConn {
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn state(&self) -> ConnectivityState {
        self.state.get()
    }

    /// Wait until the state differs from `from`. Returns immediately if it
    /// already does.
    pub async fn wait_for_state_change(&self, from: ConnectivityState) -> ConnectivityState {
        self.state.wait_for_change(from).await
    }

    /// Shut the connection down. RPCs on this connection (and its clones)
    /// fail from now on; other connections to the same server are unaffected.
    pub fn close(&self) {
        self.state.set(ConnectivityState::Shutdown);
    }
}

impl fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConn")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
