//! Engine assembly and lifecycle.
//!
//! # Responsibilities
//! - Validate configuration and build every collaborator up front
//! - Own the `Constructed → Started → Stopped` state machine
//! - Run the accept loop and one worker task per admitted connection
//! - Drain live connections on stop, then force-release what remains
//!
//! # Design Decisions
//! - Construction fails fast; nothing is bound until `start`
//! - A connection worker owns the stream, the slot and the timer; the
//!   handler only ever sees a `Connection`
//! - Certificate principals are resolved right after the handshake, so an
//!   unbound certificate never reaches the handler

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::auth::accounts::AccountService;
use crate::auth::certificate::{PeerCertificates, TlsIdentity, Verdict};
use crate::auth::password::{Argon2Hasher, CredentialHasher, HashError, MinLengthPolicy, PasswordPolicy};
use crate::auth::principal::{AccountStore, Credential, InMemoryAccountStore, NameRules, PrincipalResolver};
use crate::auth::session::{SessionManager, SessionPolicy, TransportSecurity, MAX_LIFETIME_SECS};
use crate::auth::throttle::SignInThrottle;
use crate::clock::{Clock, SystemClock};
use crate::config::{validate_config, ConfigError, GatehouseConfig};
use crate::error::GatehouseError;
use crate::lifecycle::Shutdown;
use crate::net::admission::{ConnectionAdmission, ConnectionSlot, DefaultWorkerIdentity, WorkerIdentityBuilder};
use crate::net::connection::{CloseReason, ConnectionCloser, ProgressTracker, TrackedStream};
use crate::net::listener::{Accepted, Listener, ListenerError};
use crate::net::timeout::{ConnectionTimeoutMonitor, TimeoutPolicy};
use crate::net::tls::{build_tls, TlsSetup, TlsSetupError};
use crate::notifications::{MessageSender, NotificationDispatcher, NotificationWorker};
use crate::observability::tracing::{connection_span, record_principal};
use crate::protocol::{Connection, ConnectionHandler, LineProtocolHandler, Reply};

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);
/// How often `stop` re-checks the live connection count while draining.
const DRAIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("tls setup failed: {0}")]
    Tls(#[from] TlsSetupError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("credential hasher failed: {0}")]
    Hasher(#[from] HashError),

    #[error("cannot {action} a server that is {state}")]
    InvalidState {
        action: &'static str,
        state: ServerState,
    },
}

/// Lifecycle state of a `Gatehouse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Constructed,
    Started,
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServerState::Constructed => "constructed",
            ServerState::Started => "started",
            ServerState::Stopped => "stopped",
        })
    }
}

/// Assembles a `Gatehouse`, with defaults for every collaborator.
pub struct GatehouseBuilder {
    config: GatehouseConfig,
    store: Option<Arc<dyn AccountStore>>,
    hasher: Option<Arc<dyn CredentialHasher>>,
    password_policy: Option<Arc<dyn PasswordPolicy>>,
    senders: Vec<Arc<dyn MessageSender>>,
    worker_identity: Option<Arc<dyn WorkerIdentityBuilder>>,
    handler: Option<Arc<dyn ConnectionHandler>>,
    clock: Option<Arc<dyn Clock>>,
}

impl GatehouseBuilder {
    pub fn new(config: GatehouseConfig) -> Self {
        Self {
            config,
            store: None,
            hasher: None,
            password_policy: None,
            senders: Vec::new(),
            worker_identity: None,
            handler: None,
            clock: None,
        }
    }

    pub fn with_account_store(mut self, store: Arc<dyn AccountStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn CredentialHasher>) -> Self {
        self.hasher = Some(hasher);
        self
    }

    pub fn with_password_policy(mut self, policy: Arc<dyn PasswordPolicy>) -> Self {
        self.password_policy = Some(policy);
        self
    }

    /// Add a notification channel. May be called once per channel.
    pub fn with_sender(mut self, sender: Arc<dyn MessageSender>) -> Self {
        self.senders.push(sender);
        self
    }

    pub fn with_worker_identity(mut self, identity: Arc<dyn WorkerIdentityBuilder>) -> Self {
        self.worker_identity = Some(identity);
        self
    }

    /// Replace the built-in line protocol.
    pub fn with_handler(mut self, handler: Arc<dyn ConnectionHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and wire every component.
    pub fn build(self) -> Result<Gatehouse, ServerError> {
        let config = self.config;
        validate_config(&config).map_err(ConfigError::Validation)?;

        let tls = config.tls.as_ref().map(build_tls).transpose()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let resolver = PrincipalResolver::new(
            self.store.unwrap_or_else(|| Arc::new(InMemoryAccountStore::new())),
            self.hasher.unwrap_or_else(|| Arc::new(Argon2Hasher::new())),
            NameRules::from(&config.accounts),
            SignInThrottle::from_config(&config.throttle),
        )?;
        let sessions = Arc::new(SessionManager::new(
            SessionPolicy::from(&config.session),
            Arc::clone(&clock),
        ));
        let (notifier, notification_worker) = NotificationDispatcher::new(&config.notifications, self.senders);
        let password_policy = self
            .password_policy
            .unwrap_or_else(|| Arc::new(MinLengthPolicy::new(config.accounts.min_password_length)));
        let reset_lifetime = chrono::Duration::seconds(
            config.session.reset_token_lifetime_secs.min(MAX_LIFETIME_SECS) as i64,
        );
        let accounts = Arc::new(AccountService::new(
            resolver,
            sessions,
            password_policy,
            notifier,
            clock,
            reset_lifetime,
        ));

        let identity = self.worker_identity.unwrap_or_else(|| {
            Arc::new(DefaultWorkerIdentity::new(
                config.service_name.clone(),
                config.listener.background_workers,
            ))
        });
        let admission = ConnectionAdmission::new(config.listener.max_connections, identity);
        let timeouts = ConnectionTimeoutMonitor::new(TimeoutPolicy::from(&config.timeouts));
        let handler = self.handler.unwrap_or_else(|| {
            Arc::new(LineProtocolHandler::new(config.service_name.clone(), Arc::clone(&accounts)))
        });

        tracing::info!(
            component = "server",
            service = %config.service_name,
            max_connections = config.listener.max_connections,
            tls = tls.is_some(),
            "Gatehouse constructed"
        );

        Ok(Gatehouse {
            engine: Arc::new(Engine {
                admission,
                timeouts,
                tls,
                accounts,
                handler,
            }),
            config,
            lifecycle: Mutex::new(Lifecycle {
                state: ServerState::Constructed,
                local_addr: None,
                notification_worker: Some(notification_worker),
                tasks: Vec::new(),
            }),
            accept_shutdown: Shutdown::new(),
            background_shutdown: Shutdown::new(),
        })
    }
}

/// State shared by the accept loop and every connection worker.
struct Engine {
    admission: ConnectionAdmission,
    timeouts: ConnectionTimeoutMonitor,
    tls: Option<TlsSetup>,
    accounts: Arc<AccountService>,
    handler: Arc<dyn ConnectionHandler>,
}

struct Lifecycle {
    state: ServerState,
    local_addr: Option<SocketAddr>,
    notification_worker: Option<NotificationWorker>,
    tasks: Vec<JoinHandle<()>>,
}

/// The connection admission and session lifecycle engine.
pub struct Gatehouse {
    engine: Arc<Engine>,
    config: GatehouseConfig,
    lifecycle: Mutex<Lifecycle>,
    accept_shutdown: Shutdown,
    background_shutdown: Shutdown,
}

impl Gatehouse {
    pub fn builder(config: GatehouseConfig) -> GatehouseBuilder {
        GatehouseBuilder::new(config)
    }

    /// Build with every collaborator defaulted.
    pub fn new(config: GatehouseConfig) -> Result<Self, ServerError> {
        GatehouseBuilder::new(config).build()
    }

    /// Bind the listener and begin accepting connections.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let state = self.state();
        if state != ServerState::Constructed {
            return Err(ServerError::InvalidState { action: "start", state });
        }

        let listener = Listener::bind(&self.config.listener, self.engine.admission.clone()).await?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Listener(ListenerError::Bind(e)))?;

        let mut lifecycle = self.lock();
        if lifecycle.state != ServerState::Constructed {
            return Err(ServerError::InvalidState {
                action: "start",
                state: lifecycle.state,
            });
        }

        let engine = Arc::clone(&self.engine);
        lifecycle
            .tasks
            .push(tokio::spawn(accept_loop(engine, listener, self.accept_shutdown.clone())));
        lifecycle.tasks.push(self.engine.accounts.sessions().spawn_cleanup(
            Duration::from_secs(self.config.session.cleanup_interval_secs),
            self.background_shutdown.clone(),
        ));
        lifecycle.tasks.push(self.engine.accounts.spawn_maintenance(
            Duration::from_secs(self.config.session.cleanup_interval_secs),
            self.background_shutdown.clone(),
        ));
        if let Some(worker) = lifecycle.notification_worker.take() {
            lifecycle.tasks.push(worker.spawn(self.background_shutdown.clone()));
        }
        lifecycle.local_addr = Some(local_addr);
        lifecycle.state = ServerState::Started;

        tracing::info!(component = "server", address = %local_addr, "Gatehouse started");
        Ok(local_addr)
    }

    /// Stop accepting, drain live connections, then force-release the rest.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let tasks = {
            let mut lifecycle = self.lock();
            if lifecycle.state != ServerState::Started {
                return Err(ServerError::InvalidState {
                    action: "stop",
                    state: lifecycle.state,
                });
            }
            lifecycle.state = ServerState::Stopped;
            std::mem::take(&mut lifecycle.tasks)
        };
        tracing::info!(component = "server", "Gatehouse stopping");

        self.engine.admission.close();
        self.accept_shutdown.trigger();

        let admission = &self.engine.admission;
        let live = admission.live_slots();
        for slot in &live {
            slot.request_close(CloseReason::Shutdown);
        }
        tracing::debug!(component = "server", live = live.len(), "Close requested on live connections");

        let drain = self.config.listener.drain_timeout();
        let drained = tokio::time::timeout(drain, async {
            while admission.live_count() > 0 {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        })
        .await
        .is_ok();

        if !drained {
            let forced = admission.release_all(CloseReason::Shutdown);
            tracing::warn!(
                component = "server",
                forced,
                drain_timeout_secs = drain.as_secs(),
                "Drain timeout reached, force-closed remaining connections"
            );
        }

        self.background_shutdown.trigger();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(component = "server", error = %e, "Background task failed");
            }
        }

        tracing::info!(component = "server", "Gatehouse stopped");
        Ok(())
    }

    pub fn state(&self) -> ServerState {
        self.lock().state
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().local_addr
    }

    pub fn accounts(&self) -> &Arc<AccountService> {
        &self.engine.accounts
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        self.engine.accounts.sessions()
    }

    pub fn admission(&self) -> &ConnectionAdmission {
        &self.engine.admission
    }

    pub fn config(&self) -> &GatehouseConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Gatehouse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gatehouse")
            .field("service", &self.config.service_name)
            .field("state", &self.state())
            .field("admission", &self.engine.admission)
            .finish_non_exhaustive()
    }
}

async fn accept_loop(engine: Arc<Engine>, listener: Listener, shutdown: Shutdown) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(Accepted::Admitted { stream, slot }) => {
                tokio::spawn(serve_connection(Arc::clone(&engine), stream, slot));
            }
            Ok(Accepted::Rejected { stream, remote, reason }) => {
                if engine.tls.is_none() {
                    let reply = Reply::from(&GatehouseError::from(reason));
                    // Best effort only; the socket is dropped either way.
                    let _ = stream.try_write(format!("{reply}\n").as_bytes());
                }
                tracing::debug!(component = "server", peer_addr = %remote, "Rejected connection closed");
            }
            Err(e) => {
                tracing::error!(component = "server", error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    tracing::info!(component = "server", "Accept loop stopped");
}

async fn serve_connection(engine: Arc<Engine>, stream: TcpStream, slot: ConnectionSlot) {
    let span = connection_span(&slot);
    async move {
        let closer = ConnectionCloser::new(slot.clone(), engine.admission.clone());
        let progress = ProgressTracker::new();
        let timer_closer = closer.clone();
        closer.attach_timer(engine.timeouts.watch(progress.clone(), move |reason| {
            timer_closer.close(reason);
        }));

        let stream = TrackedStream::new(stream, progress);
        let reason = tokio::select! {
            reason = close_requested(slot.close_requested()) => reason,
            reason = run_connection(&engine, stream, &slot) => reason,
        };
        closer.close(reason);
    }
    .instrument(span)
    .await
}

async fn close_requested(mut rx: watch::Receiver<Option<CloseReason>>) -> CloseReason {
    match rx.wait_for(Option::is_some).await {
        Ok(reason) => (*reason).unwrap_or(CloseReason::Shutdown),
        Err(_) => CloseReason::Shutdown,
    }
}

async fn run_connection(engine: &Engine, stream: TrackedStream<TcpStream>, slot: &ConnectionSlot) -> CloseReason {
    let connection = match &engine.tls {
        None => Connection {
            id: slot.id(),
            worker: slot.worker().clone(),
            remote: slot.remote_endpoint(),
            transport: TransportSecurity::Plain,
            identity: None,
            stream: Box::new(stream),
        },
        Some(tls) => {
            let mut tls_stream = match tls.acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    tracing::info!(component = "server", error = %e, "TLS handshake failed");
                    return CloseReason::HandshakeFailed;
                }
            };

            let peer = PeerCertificates::from_connection(tls_stream.get_ref().1);
            let identity = TlsIdentity::establish(peer, &tls.policy);
            if let Err(err) = authorize_identity(engine, &identity) {
                tracing::warn!(component = "server", error = %err, "Peer certificate refused");
                // The peer may already be gone; close regardless.
                let _ = tls_stream.shutdown().await;
                return CloseReason::AuthenticationFailed;
            }

            Connection {
                id: slot.id(),
                worker: slot.worker().clone(),
                remote: slot.remote_endpoint(),
                transport: TransportSecurity::Tls,
                identity: Some(identity),
                stream: Box::new(tls_stream),
            }
        }
    };

    match engine.handler.handle(connection).await {
        Ok(()) => CloseReason::Completed,
        Err(e) => {
            tracing::debug!(component = "server", error = %e, "Handler ended with an error");
            CloseReason::Error
        }
    }
}

/// A presented certificate must be valid and bound to an account.
fn authorize_identity(engine: &Engine, identity: &TlsIdentity) -> Result<(), GatehouseError> {
    match &identity.verdict {
        Verdict::Anonymous => Ok(()),
        Verdict::Rejected(reason) => Err(GatehouseError::Certificate(reason.clone())),
        Verdict::Accepted(_) => {
            let user_id = engine
                .accounts
                .resolver()
                .resolve(Credential::Certificate(identity))?;
            record_principal(&tracing::Span::current(), &user_id);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsConfig;

    fn test_config() -> GatehouseConfig {
        let mut config = GatehouseConfig::default();
        config.listener.bind_address = "127.0.0.1:0".to_string();
        config.session.secure_cookies = false;
        config
    }

    fn fast_hasher() -> Arc<dyn CredentialHasher> {
        Arc::new(Argon2Hasher::with_cost(8, 1, 1))
    }

    #[test]
    fn invalid_config_fails_at_construction() {
        let mut config = test_config();
        config.listener.max_connections = 0;
        let err = Gatehouse::builder(config).with_hasher(fast_hasher()).build().unwrap_err();
        assert!(matches!(err, ServerError::Config(ConfigError::Validation(_))));
    }

    #[test]
    fn unreadable_tls_material_fails_at_construction() {
        let mut config = test_config();
        config.tls = Some(TlsConfig {
            cert_path: "/nonexistent/cert.pem".to_string(),
            key_path: "/nonexistent/key.pem".to_string(),
            client_ca_path: None,
            protocols: vec!["1.3".to_string()],
            client_auth: Default::default(),
        });
        let err = Gatehouse::builder(config).with_hasher(fast_hasher()).build().unwrap_err();
        assert!(matches!(err, ServerError::Tls(TlsSetupError::Read { .. })));
    }

    #[tokio::test]
    async fn lifecycle_transitions_are_enforced() {
        let server = Gatehouse::builder(test_config())
            .with_hasher(fast_hasher())
            .build()
            .unwrap();
        assert_eq!(server.state(), ServerState::Constructed);
        assert!(matches!(
            server.stop().await,
            Err(ServerError::InvalidState { action: "stop", state: ServerState::Constructed })
        ));

        let addr = server.start().await.unwrap();
        assert_eq!(server.local_addr(), Some(addr));
        assert_eq!(server.state(), ServerState::Started);
        assert!(matches!(server.start().await, Err(ServerError::InvalidState { .. })));

        server.stop().await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(matches!(server.start().await, Err(ServerError::InvalidState { .. })));
        assert!(matches!(server.stop().await, Err(ServerError::InvalidState { .. })));
        assert!(server.admission().is_closed());
    }

    #[tokio::test]
    async fn stop_releases_live_connections() {
        let mut config = test_config();
        config.listener.drain_timeout_secs = 0;
        let server = Gatehouse::builder(config).with_hasher(fast_hasher()).build().unwrap();
        let addr = server.start().await.unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        for _ in 0..100 {
            if server.admission().live_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.admission().live_count(), 1);

        server.stop().await.unwrap();
        assert_eq!(server.admission().live_count(), 0);
    }
}
