//! Lifecycle notification subsystem.
//!
//! # Data Flow
//! ```text
//! AccountService (sign-up, reset, password change)
//!     → event.rs (NotificationEvent, built and handed off immediately)
//!     → dispatcher.rs (bounded queue, try_send, never blocks)
//!     → NotificationWorker (routing: admins / account holder)
//!     → sender.rs (MessageSender per channel: e-mail, SMS)
//! ```
//!
//! # Design Decisions
//! - Delivery is best-effort: failures are logged and counted, the
//!   triggering state change is never rolled back

pub mod dispatcher;
pub mod event;
pub mod sender;

pub use dispatcher::{NotificationDispatcher, NotificationWorker};
pub use event::{NotificationEvent, NotificationKind, NotificationTarget};
pub use sender::{Channel, DeliveryError, LoggingSender, MessageSender};
