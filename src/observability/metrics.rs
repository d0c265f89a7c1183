//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define engine metrics (admission, connections, sessions, auth, notifications)
//! - Expose a Prometheus-compatible scrape endpoint when enabled
//!
//! # Metrics
//! - `gatehouse_connections_admitted_total` (counter)
//! - `gatehouse_connections_rejected_total` (counter)
//! - `gatehouse_connections_force_closed_total` (counter): by reason
//! - `gatehouse_live_connections` (gauge)
//! - `gatehouse_sessions_issued_total` / `_revoked_total` / `_expired_total` (counters)
//! - `gatehouse_auth_failures_total` (counter): by kind
//! - `gatehouse_notifications_total` (counter): by outcome (delivered, failed, dropped)
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op, so tests need no setup

use std::net::SocketAddr;

use ::metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    describe();
    tracing::info!(component = "metrics", address = %addr, "Metrics endpoint listening");
    Ok(())
}

fn describe() {
    describe_counter!("gatehouse_connections_admitted_total", "Connections granted a slot");
    describe_counter!("gatehouse_connections_rejected_total", "Connections refused at capacity");
    describe_counter!("gatehouse_connections_force_closed_total", "Connections closed by the server");
    describe_gauge!("gatehouse_live_connections", "Connection slots currently held");
    describe_counter!("gatehouse_sessions_issued_total", "Sessions issued");
    describe_counter!("gatehouse_sessions_revoked_total", "Sessions revoked");
    describe_counter!("gatehouse_sessions_expired_total", "Sessions found expired on validation");
    describe_counter!("gatehouse_auth_failures_total", "Rejected credentials");
    describe_counter!("gatehouse_notifications_total", "Notification outcomes");
}

pub fn record_admission_granted(live: usize) {
    counter!("gatehouse_connections_admitted_total").increment(1);
    set_live_connections(live);
}

pub fn record_admission_rejected() {
    counter!("gatehouse_connections_rejected_total").increment(1);
}

pub fn set_live_connections(live: usize) {
    gauge!("gatehouse_live_connections").set(live as f64);
}

pub fn record_forced_close(reason: &'static str) {
    counter!("gatehouse_connections_force_closed_total", "reason" => reason).increment(1);
}

pub fn record_session_issued() {
    counter!("gatehouse_sessions_issued_total").increment(1);
}

pub fn record_sessions_revoked(count: usize) {
    counter!("gatehouse_sessions_revoked_total").increment(count as u64);
}

pub fn record_session_expired() {
    counter!("gatehouse_sessions_expired_total").increment(1);
}

pub fn record_auth_failure(kind: &'static str) {
    counter!("gatehouse_auth_failures_total", "kind" => kind).increment(1);
}

pub fn record_notification(outcome: &'static str) {
    counter!("gatehouse_notifications_total", "outcome" => outcome).increment(1);
}
