//! Gatehouse: connection admission and session lifecycle engine.
//!
//! # Architecture Overview
//!
//! ```text
//!                  ┌──────────────────────────────────────────────────────┐
//!                  │                      GATEHOUSE                       │
//!                  │                                                      │
//!  TCP connect     │  ┌──────────┐   ┌───────────┐   ┌────────────────┐   │
//!  ────────────────┼─▶│ listener │──▶│ admission │──▶│ tls handshake  │   │
//!                  │  └──────────┘   └─────┬─────┘   │ + cert policy  │   │
//!                  │                       │         └───────┬────────┘   │
//!                  │              ┌────────▼───────┐         │            │
//!                  │              │ timeout timer  │         ▼            │
//!                  │              │ (idle/lifetime)│   ┌────────────┐     │
//!                  │              └────────────────┘   │  protocol  │     │
//!                  │                                   │  handler   │     │
//!                  │                                   └─────┬──────┘     │
//!                  │                                         ▼            │
//!                  │  ┌───────────┐   ┌───────────┐   ┌────────────┐      │
//!                  │  │ notifier  │◀──│ accounts  │──▶│ principal  │      │
//!                  │  │ (queue)   │   │ + sessions│   │ resolver   │      │
//!                  │  └───────────┘   └───────────┘   └────────────┘      │
//!                  │                                                      │
//!                  │  Cross-cutting: config, observability, lifecycle     │
//!                  └──────────────────────────────────────────────────────┘
//! ```

// Core subsystems
pub mod auth;
pub mod config;
pub mod net;
pub mod protocol;
pub mod server;

// Side effects
pub mod notifications;

// Cross-cutting concerns
pub mod clock;
pub mod error;
pub mod lifecycle;
pub mod observability;

pub use config::schema::GatehouseConfig;
pub use error::{GatehouseError, StorageError};
pub use lifecycle::Shutdown;
pub use server::{Gatehouse, GatehouseBuilder, ServerError, ServerState};
