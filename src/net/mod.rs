//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop)
//!     → admission.rs (slot or rejection, worker identity)
//!     → connection.rs (progress tracking, single close path)
//!         ↳ timeout.rs (idle / lifetime timer per connection)
//!     → tls.rs (optional TLS handshake, client certificate policy)
//!     → Hand off to the protocol handler
//!
//! Connection States:
//!     Admitted → Handshaking → Active → Closed
//! ```
//!
//! # Design Decisions
//! - Admission is a strict counting semaphore; rejected sockets are
//!   closed immediately
//! - Every close trigger (handler done, timer, shutdown) funnels through
//!   one `ConnectionCloser`
//! - TLS is optional and handled transparently

pub mod admission;
pub mod connection;
pub mod listener;
pub mod timeout;
pub mod tls;
