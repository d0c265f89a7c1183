//! Connection identity, progress tracking and the single close path.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Record forward progress (bytes read/written) for the timeout monitor
//! - Provide the one authoritative close path shared by the connection's
//!   own completion, the timeout monitor and server shutdown

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Duration, Instant};

use crate::net::admission::{ConnectionAdmission, ConnectionSlot};
use crate::net::timeout::TimeoutHandle;
use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The handler finished or the peer disconnected.
    Completed,
    /// No bytes moved within the idle window.
    IdleTimeout,
    /// The connection outlived its maximum lifetime.
    LifetimeExceeded,
    /// The TLS handshake failed.
    HandshakeFailed,
    /// Certificate or principal checks rejected the peer.
    AuthenticationFailed,
    /// The handler returned an I/O error.
    Error,
    /// The server is stopping.
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Completed => "completed",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::LifetimeExceeded => "lifetime_exceeded",
            CloseReason::HandshakeFailed => "handshake_failed",
            CloseReason::AuthenticationFailed => "authentication_failed",
            CloseReason::Error => "error",
            CloseReason::Shutdown => "shutdown",
        }
    }

    /// Closes initiated by the server rather than the peer or handler.
    pub fn is_forced(&self) -> bool {
        matches!(
            self,
            CloseReason::IdleTimeout | CloseReason::LifetimeExceeded | CloseReason::Shutdown
        )
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last time a connection moved bytes in either direction.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    origin: Instant,
    /// Milliseconds since `origin` of the last read or write.
    last_progress_ms: Arc<AtomicU64>,
    bytes: Arc<AtomicU64>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_progress_ms: Arc::new(AtomicU64::new(0)),
            bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record `n` transferred bytes. Zero-byte transfers are not progress.
    pub fn record(&self, n: usize) {
        if n == 0 {
            return;
        }
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_progress_ms.fetch_max(elapsed, Ordering::AcqRel);
        self.bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// When the connection started.
    pub fn started_at(&self) -> Instant {
        self.origin
    }

    /// When the connection last made progress (its start if it never has).
    pub fn last_progress(&self) -> Instant {
        self.origin + Duration::from_millis(self.last_progress_ms.load(Ordering::Acquire))
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream wrapper that reports every non-empty read and write to a tracker.
#[derive(Debug)]
pub struct TrackedStream<S> {
    inner: S,
    progress: ProgressTracker,
}

impl<S> TrackedStream<S> {
    pub fn new(inner: S, progress: ProgressTracker) -> Self {
        Self { inner, progress }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            this.progress.record(buf.filled().len() - before);
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            this.progress.record(*n);
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// The single close path of a connection.
///
/// Cloned into every party that may end the connection. The first `close`
/// cancels the timeout timer, releases the admission slot and signals the
/// worker; later calls are no-ops.
#[derive(Clone)]
pub struct ConnectionCloser {
    inner: Arc<CloserInner>,
}

struct CloserInner {
    slot: ConnectionSlot,
    admission: ConnectionAdmission,
    closed: AtomicBool,
    timer: Mutex<Option<TimeoutHandle>>,
}

impl ConnectionCloser {
    pub fn new(slot: ConnectionSlot, admission: ConnectionAdmission) -> Self {
        Self {
            inner: Arc::new(CloserInner {
                slot,
                admission,
                closed: AtomicBool::new(false),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Hand the connection's timeout timer to the closer so `close` can cancel it.
    pub fn attach_timer(&self, handle: TimeoutHandle) {
        let mut timer = self.inner.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            handle.cancel();
            return;
        }
        *timer = Some(handle);
    }

    /// Close the connection. Returns `true` only for the call that performed the close.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let timer = self
            .inner
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = timer {
            timer.cancel();
        }

        let slot = &self.inner.slot;
        slot.request_close(reason);
        self.inner.admission.release(slot);

        if reason.is_forced() {
            tracing::info!(
                component = "connection",
                connection_id = %slot.id(),
                reason = %reason,
                "Connection force-closed"
            );
            metrics::record_forced_close(reason.as_str());
        } else {
            tracing::debug!(
                component = "connection",
                connection_id = %slot.id(),
                reason = %reason,
                lifetime_ms = slot.acquired_at().elapsed().as_millis() as u64,
                "Connection closed"
            );
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn slot(&self) -> &ConnectionSlot {
        &self.inner.slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::net::admission::DefaultWorkerIdentity;

    fn peer() -> SocketAddr {
        "192.0.2.10:40000".parse().unwrap()
    }

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn close_runs_exactly_once() {
        let admission = ConnectionAdmission::new(1, Arc::new(DefaultWorkerIdentity::new("test", false)));
        let slot = admission.try_acquire(peer()).unwrap();
        let closer = ConnectionCloser::new(slot.clone(), admission.clone());

        assert!(closer.close(CloseReason::IdleTimeout));
        assert!(!closer.close(CloseReason::Completed));
        assert!(closer.is_closed());
        assert!(slot.is_released());
        assert_eq!(*slot.close_requested().borrow(), Some(CloseReason::IdleTimeout));
        assert_eq!(admission.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tracked_stream_records_progress() {
        let (client, server) = tokio::io::duplex(64);
        let tracker = ProgressTracker::new();
        let mut tracked = TrackedStream::new(server, tracker.clone());
        let mut client = client;

        assert_eq!(tracker.last_progress(), tracker.started_at());

        tokio::time::advance(Duration::from_secs(3)).await;
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tracked.read_exact(&mut buf).await.unwrap();

        assert_eq!(tracker.bytes_transferred(), 4);
        assert_eq!(tracker.last_progress(), tracker.started_at() + Duration::from_secs(3));

        tracked.write_all(b"pong").await.unwrap();
        assert_eq!(tracker.bytes_transferred(), 8);
    }
}
