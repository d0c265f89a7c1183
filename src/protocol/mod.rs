//! Application protocol seam.
//!
//! # Data Flow
//! ```text
//! server.rs (admitted, handshaken, certificate-checked connection)
//!     → Connection (stream + identity, no raw socket)
//!     → ConnectionHandler::handle
//!         → handler.rs (built-in line protocol)
//!         → command.rs (parse commands, render replies)
//!         → AccountService
//! ```
//!
//! # Design Decisions
//! - Handlers only ever see a boxed stream; the engine keeps the socket,
//!   the admission slot and the timeout timer
//! - Returning from `handle` is the normal close path

pub mod command;
pub mod handler;

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::auth::certificate::TlsIdentity;
use crate::auth::session::TransportSecurity;
use crate::net::admission::WorkerIdentity;
use crate::net::connection::ConnectionId;

pub use command::{Command, ErrorCode, ParseError, Reply};
pub use handler::LineProtocolHandler;

/// Byte stream a handler reads and writes.
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

/// An admitted connection handed to the application.
pub struct Connection {
    pub id: ConnectionId,
    pub worker: WorkerIdentity,
    pub remote: SocketAddr,
    pub transport: TransportSecurity,
    /// Present on TLS connections.
    pub identity: Option<TlsIdentity>,
    pub stream: Box<dyn IoStream>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("worker", &self.worker.name)
            .field("transport", &self.transport)
            .field("identity", &self.identity.as_ref().map(|i| &i.verdict))
            .finish_non_exhaustive()
    }
}

/// Serves one connection until it completes.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn handle(&self, connection: Connection) -> io::Result<()>;
}
