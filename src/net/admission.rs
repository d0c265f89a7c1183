//! Connection admission with a hard concurrency cap.
//!
//! # Responsibilities
//! - Grant or reject a slot for every accepted TCP connection
//! - Never exceed `max_connections` live slots, even transiently
//! - Name each connection worker and assign its scheduling class
//! - Make slot release idempotent so competing close triggers are harmless
//!
//! # Design Decisions
//! - Backed by a Tokio semaphore; `try_acquire` never waits, so the
//!   accept loop never suspends while holding admission state
//! - The live-slot registry exists for shutdown draining, the semaphore
//!   alone is authoritative for the count

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;

use crate::net::connection::{CloseReason, ConnectionId};
use crate::observability::metrics;

/// Host-scheduling hint attached to a connection worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulingClass {
    Background,
    Normal,
    Elevated,
}

impl SchedulingClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulingClass::Background => "background",
            SchedulingClass::Normal => "normal",
            SchedulingClass::Elevated => "elevated",
        }
    }
}

/// Name and scheduling class of the worker serving one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub name: String,
    pub scheduling: SchedulingClass,
}

/// Builds the worker identity for a newly admitted connection.
///
/// Receives the remote endpoint so implementations can derive tracing names
/// from it without upper layers ever touching the socket.
pub trait WorkerIdentityBuilder: Send + Sync {
    fn build(&self, id: ConnectionId, remote: &SocketAddr) -> WorkerIdentity;
}

impl<F> WorkerIdentityBuilder for F
where
    F: Fn(ConnectionId, &SocketAddr) -> WorkerIdentity + Send + Sync,
{
    fn build(&self, id: ConnectionId, remote: &SocketAddr) -> WorkerIdentity {
        self(id, remote)
    }
}

/// Names workers `<service>-worker-<n>` with a fixed scheduling class.
#[derive(Debug, Clone)]
pub struct DefaultWorkerIdentity {
    service_name: String,
    scheduling: SchedulingClass,
}

impl DefaultWorkerIdentity {
    pub fn new(service_name: impl Into<String>, background: bool) -> Self {
        Self {
            service_name: service_name.into(),
            scheduling: if background {
                SchedulingClass::Background
            } else {
                SchedulingClass::Normal
            },
        }
    }
}

impl WorkerIdentityBuilder for DefaultWorkerIdentity {
    fn build(&self, id: ConnectionId, _remote: &SocketAddr) -> WorkerIdentity {
        WorkerIdentity {
            name: format!("{}-worker-{}", self.service_name, id.as_u64()),
            scheduling: self.scheduling,
        }
    }
}

/// Admission was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejected {
    #[error("admission rejected: all {limit} connection slots are in use")]
    AtCapacity { limit: usize },

    #[error("admission rejected: server is shutting down")]
    ShuttingDown,
}

/// A granted connection slot.
///
/// Cheap to clone; every clone refers to the same slot. The slot stays live
/// until `ConnectionAdmission::release` is called once for it.
#[derive(Clone)]
pub struct ConnectionSlot {
    inner: Arc<SlotInner>,
}

struct SlotInner {
    id: ConnectionId,
    acquired_at: Instant,
    worker: WorkerIdentity,
    remote: SocketAddr,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    close_tx: watch::Sender<Option<CloseReason>>,
}

impl ConnectionSlot {
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn acquired_at(&self) -> Instant {
        self.inner.acquired_at
    }

    pub fn worker(&self) -> &WorkerIdentity {
        &self.inner.worker
    }

    pub fn remote_endpoint(&self) -> SocketAddr {
        self.inner.remote
    }

    pub fn is_released(&self) -> bool {
        self.inner
            .permit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Ask the worker owning this slot to close. The first reason wins.
    pub fn request_close(&self, reason: CloseReason) {
        self.inner.close_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    /// Observe close requests for this slot.
    pub fn close_requested(&self) -> watch::Receiver<Option<CloseReason>> {
        self.inner.close_tx.subscribe()
    }

    fn take_permit(&self) -> Option<OwnedSemaphorePermit> {
        self.inner
            .permit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl std::fmt::Debug for ConnectionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSlot")
            .field("id", &self.inner.id)
            .field("worker", &self.inner.worker.name)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Bounded admission of concurrent connections.
#[derive(Clone)]
pub struct ConnectionAdmission {
    inner: Arc<AdmissionInner>,
}

struct AdmissionInner {
    limit: usize,
    semaphore: Arc<Semaphore>,
    live: DashMap<ConnectionId, ConnectionSlot>,
    identity: Arc<dyn WorkerIdentityBuilder>,
}

impl ConnectionAdmission {
    pub fn new(limit: usize, identity: Arc<dyn WorkerIdentityBuilder>) -> Self {
        Self {
            inner: Arc::new(AdmissionInner {
                limit,
                semaphore: Arc::new(Semaphore::new(limit)),
                live: DashMap::new(),
                identity,
            }),
        }
    }

    /// Try to take a slot for a connection from `remote`.
    pub fn try_acquire(&self, remote: SocketAddr) -> Result<ConnectionSlot, Rejected> {
        let permit = match self.inner.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                metrics::record_admission_rejected();
                tracing::warn!(
                    component = "admission",
                    peer_addr = %remote,
                    max_connections = self.inner.limit,
                    "Connection rejected: limit reached"
                );
                return Err(Rejected::AtCapacity { limit: self.inner.limit });
            }
            Err(TryAcquireError::Closed) => return Err(Rejected::ShuttingDown),
        };

        let id = ConnectionId::new();
        let worker = self.inner.identity.build(id, &remote);
        let (close_tx, _) = watch::channel(None);
        let slot = ConnectionSlot {
            inner: Arc::new(SlotInner {
                id,
                acquired_at: Instant::now(),
                worker,
                remote,
                permit: Mutex::new(Some(permit)),
                close_tx,
            }),
        };
        self.inner.live.insert(id, slot.clone());

        let live = self.live_count();
        metrics::record_admission_granted(live);
        tracing::debug!(
            component = "admission",
            connection_id = %id,
            worker = %slot.worker().name,
            live_connections = live,
            "Connection admitted"
        );
        Ok(slot)
    }

    /// Return a slot to the pool. Returns `false` if it was already released.
    pub fn release(&self, slot: &ConnectionSlot) -> bool {
        let Some(permit) = slot.take_permit() else {
            return false;
        };
        self.inner.live.remove(&slot.id());
        drop(permit);
        metrics::set_live_connections(self.live_count());
        true
    }

    /// Number of slots currently held.
    pub fn live_count(&self) -> usize {
        self.inner
            .limit
            .saturating_sub(self.inner.semaphore.available_permits())
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// Snapshot of all live slots.
    pub fn live_slots(&self) -> Vec<ConnectionSlot> {
        self.inner.live.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Stop granting slots. Live slots are unaffected.
    pub fn close(&self) {
        self.inner.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.semaphore.is_closed()
    }

    /// Ask every live connection to close, then release all slots that remain.
    pub fn release_all(&self, reason: CloseReason) -> usize {
        self.live_slots()
            .into_iter()
            .filter(|slot| {
                slot.request_close(reason);
                self.release(slot)
            })
            .count()
    }
}

impl std::fmt::Debug for ConnectionAdmission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionAdmission")
            .field("limit", &self.inner.limit)
            .field("live", &self.live_count())
            .finish()
    }
}
