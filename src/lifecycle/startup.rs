//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize logging and metrics from the loaded configuration
//! - Build the engine (validation runs there) and bind the listener
//! - Block until a stop signal, then run the ordered shutdown
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - Listener starts last (traffic only when ready)

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;

use crate::config::GatehouseConfig;
use crate::lifecycle::signals::wait_for_signal;
use crate::notifications::{Channel, LoggingSender};
use crate::observability::{logging, metrics};
use crate::server::{Gatehouse, ServerError};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to initialize logging: {0}")]
    Logging(#[from] tracing_subscriber::util::TryInitError),

    #[error("invalid metrics address {0:?}")]
    MetricsAddress(String),

    #[error("failed to start metrics exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Run the gatehouse until SIGINT or SIGTERM.
pub async fn run(config: GatehouseConfig) -> Result<(), StartupError> {
    logging::init_logging(&config.observability)?;
    tracing::info!(component = "startup", version = env!("CARGO_PKG_VERSION"), "gatehouse starting");

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config
            .observability
            .metrics_address
            .parse()
            .map_err(|_| StartupError::MetricsAddress(config.observability.metrics_address.clone()))?;
        metrics::init_metrics(addr)?;
        tracing::info!(component = "startup", address = %addr, "Metrics exporter listening");
    }

    let server = Gatehouse::builder(config)
        .with_sender(Arc::new(LoggingSender::new(Channel::Email)))
        .with_sender(Arc::new(LoggingSender::new(Channel::Sms)))
        .build()?;
    let addr = server.start().await?;
    tracing::info!(component = "startup", address = %addr, "Accepting connections");

    wait_for_signal().await;
    server.stop().await?;

    tracing::info!(component = "startup", "Shutdown complete");
    Ok(())
}
