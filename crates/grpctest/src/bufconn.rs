//! In-memory listener backed by `tokio::io::duplex` pipes.
//!
//! Every [`BufListener::dial`] creates a fresh pipe pair and queues the server
//! half for the accept side ([`BufListener::incoming`]). The dial completes
//! once the accept side has taken the connection, so a listener nobody serves
//! leaves dialers waiting, the same way a real backlog would.
//!
//! Closing the listener also severs every pipe it handed out: pending and
//! later reads and writes on either end fail with `BrokenPipe`.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tonic::transport::server::Connected;
use tracing::{debug, trace};

use crate::error::BufconnError;

struct PendingConn {
    conn: BufConn,
    accepted: oneshot::Sender<()>,
}

/// Listener handing out in-memory connections with a fixed pipe capacity.
#[derive(Clone)]
pub struct BufListener {
    inner: Arc<Inner>,
}

struct Inner {
    capacity: usize,
    next_id: AtomicU64,
    closed: AtomicBool,
    /// Cancelled on close; every handed-out pipe watches it.
    severed: CancellationToken,
    queue: Mutex<Option<mpsc::UnboundedSender<PendingConn>>>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<PendingConn>>>,
}

impl BufListener {
    /// Create a listener whose pipes buffer up to `capacity` bytes per direction.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "grpctest: buffer size must be positive");
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                capacity,
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                severed: CancellationToken::new(),
                queue: Mutex::new(Some(tx)),
                incoming: Mutex::new(Some(rx)),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Open a new connection and wait for the accept side to take it.
    pub async fn dial(&self) -> Result<BufConn, BufconnError> {
        let (client, server) = tokio::io::duplex(self.inner.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (accepted_tx, accepted_rx) = oneshot::channel();

        {
            let queue = lock(&self.inner.queue);
            let tx = queue.as_ref().ok_or(BufconnError::Closed)?;
            tx.send(PendingConn {
                conn: BufConn::new(server, id, &self.inner.severed),
                accepted: accepted_tx,
            })
            .map_err(|_| BufconnError::Closed)?;
        }

        accepted_rx.await.map_err(|_| BufconnError::Closed)?;
        trace!(id, "bufconn: dial accepted");
        Ok(BufConn::new(client, id, &self.inner.severed))
    }

    /// Take the accept side. Only the first call succeeds.
    pub fn incoming(&self) -> Result<Incoming, BufconnError> {
        if self.is_closed() {
            return Err(BufconnError::Closed);
        }
        let rx = lock(&self.inner.incoming)
            .take()
            .ok_or(BufconnError::IncomingTaken)?;
        Ok(Incoming {
            rx,
            listener: Arc::clone(&self.inner),
        })
    }

    /// Stop accepting, fail every pending and future dial, and sever the
    /// connections already established.
    ///
    /// Returns `false` if the listener was already closed.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        lock(&self.inner.queue).take();
        // Dropping an untaken receiver releases dialers queued on it.
        lock(&self.inner.incoming).take();
        self.inner.severed.cancel();
        debug!(capacity = self.inner.capacity, "bufconn: listener closed");
        true
    }
}

impl std::fmt::Debug for BufListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufListener")
            .field("capacity", &self.inner.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Stream of accepted connections, ending when the listener closes.
pub struct Incoming {
    rx: mpsc::UnboundedReceiver<PendingConn>,
    listener: Arc<Inner>,
}

impl Stream for Incoming {
    type Item = io::Result<BufConn>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.listener.closed.load(Ordering::SeqCst) {
                this.rx.close();
                while this.rx.try_recv().is_ok() {}
                return Poll::Ready(None);
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(pending)) => {
                    // The dialer gave up; drop its half and keep accepting.
                    if pending.accepted.send(()).is_err() {
                        continue;
                    }
                    trace!(id = pending.conn.id, "bufconn: accepted");
                    return Poll::Ready(Some(Ok(pending.conn)));
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// One end of an in-memory connection.
pub struct BufConn {
    stream: DuplexStream,
    id: u64,
    severed: Pin<Box<WaitForCancellationFutureOwned>>,
}

/// Connection info exposed to tonic handlers through request extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufConnInfo {
    pub id: u64,
}

impl BufConn {
    fn new(stream: DuplexStream, id: u64, severed: &CancellationToken) -> Self {
        Self {
            stream,
            id,
            severed: Box::pin(severed.clone().cancelled_owned()),
        }
    }

    /// Identifier shared by both ends of the pipe.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Fails once the listener has been closed. Polling registers the task
    /// so a read or write parked on the pipe wakes up when that happens.
    fn poll_severed(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        match self.severed.as_mut().poll(cx) {
            Poll::Ready(()) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                BufconnError::Closed,
            )),
            Poll::Pending => Ok(()),
        }
    }
}

impl std::fmt::Debug for BufConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufConn")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Connected for BufConn {
    type ConnectInfo = BufConnInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        BufConnInfo { id: self.id }
    }
}

impl AsyncRead for BufConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.poll_severed(cx)?;
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for BufConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_severed(cx)?;
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_severed(cx)?;
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
