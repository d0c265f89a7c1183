//! TCP listener with admission control.
//!
//! # Responsibilities
//! - Bind to the configured address
//! - Accept incoming TCP connections
//! - Ask `ConnectionAdmission` for a slot before anything else happens
//!
//! # Design Decisions
//! - Admission never waits: a connection over the limit is handed back as
//!   rejected immediately, so the accept loop keeps draining the backlog

use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};

use crate::config::ListenerConfig;
use crate::net::admission::{ConnectionAdmission, ConnectionSlot, Rejected};

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Failed to bind to address.
    #[error("failed to bind: {0}")]
    Bind(std::io::Error),

    /// Failed to accept connection.
    #[error("failed to accept: {0}")]
    Accept(std::io::Error),
}

/// Outcome of one accepted TCP connection.
#[derive(Debug)]
pub enum Accepted {
    Admitted {
        stream: TcpStream,
        slot: ConnectionSlot,
    },
    Rejected {
        stream: TcpStream,
        remote: SocketAddr,
        reason: Rejected,
    },
}

/// A TCP listener that admits connections through `ConnectionAdmission`.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    admission: ConnectionAdmission,
}

impl Listener {
    /// Bind to the configured address.
    pub async fn bind(config: &ListenerConfig, admission: ConnectionAdmission) -> Result<Self, ListenerError> {
        let addr: SocketAddr = config
            .bind_address
            .parse()
            .map_err(|e| ListenerError::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;

        let listener = TcpListener::bind(addr).await.map_err(ListenerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

        tracing::info!(
            component = "listener",
            address = %local_addr,
            max_connections = admission.limit(),
            "Listener bound"
        );

        Ok(Self {
            inner: listener,
            admission,
        })
    }

    /// Accept the next connection and decide its admission.
    pub async fn accept(&self) -> Result<Accepted, ListenerError> {
        let (stream, remote) = self.inner.accept().await.map_err(ListenerError::Accept)?;

        match self.admission.try_acquire(remote) {
            Ok(slot) => {
                tracing::debug!(
                    component = "listener",
                    peer_addr = %remote,
                    connection_id = %slot.id(),
                    "Connection accepted"
                );
                Ok(Accepted::Admitted { stream, slot })
            }
            Err(reason) => Ok(Accepted::Rejected {
                stream,
                remote,
                reason,
            }),
        }
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    pub fn admission(&self) -> &ConnectionAdmission {
        &self.admission
    }
}
