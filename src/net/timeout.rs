//! Per-connection timeout enforcement.
//!
//! # Responsibilities
//! - Close connections that make no forward progress within the idle window
//! - Optionally cap the total lifetime of a connection
//! - Cancel cleanly when the connection finishes first
//!
//! # Design Decisions
//! - One timer task per connection; no shared wheel, so a slow check on
//!   one connection never delays another
//! - The timer sleeps until the exact deadline and re-arms when progress
//!   moved the deadline, so expiry is detected within one tick
//! - Cancellation is a watch flag: repeated cancels are harmless

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::config::TimeoutConfig;
use crate::net::connection::{CloseReason, ProgressTracker};

/// Timeouts applied to every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub idle: Duration,
    pub max_lifetime: Option<Duration>,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(30),
            max_lifetime: None,
        }
    }
}

impl From<&TimeoutConfig> for TimeoutPolicy {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            idle: config.idle(),
            max_lifetime: config.max_lifetime(),
        }
    }
}

/// Spawns the timer for each live connection.
#[derive(Debug, Clone)]
pub struct ConnectionTimeoutMonitor {
    policy: TimeoutPolicy,
}

impl ConnectionTimeoutMonitor {
    pub fn new(policy: TimeoutPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> TimeoutPolicy {
        self.policy
    }

    /// Start watching a connection. `on_expire` runs at most once, and never
    /// after the returned handle has been cancelled.
    pub fn watch<F>(&self, progress: ProgressTracker, on_expire: F) -> TimeoutHandle
    where
        F: FnOnce(CloseReason) + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(run_timer(self.policy, progress, cancel_rx, on_expire));
        TimeoutHandle { cancel_tx, task }
    }
}

async fn run_timer<F>(
    policy: TimeoutPolicy,
    progress: ProgressTracker,
    mut cancelled: watch::Receiver<bool>,
    on_expire: F,
) where
    F: FnOnce(CloseReason) + Send + 'static,
{
    let lifetime_deadline = policy.max_lifetime.map(|max| progress.started_at() + max);

    loop {
        let idle_deadline = progress.last_progress() + policy.idle;
        let deadline = match lifetime_deadline {
            Some(lifetime) => idle_deadline.min(lifetime),
            None => idle_deadline,
        };

        tokio::select! {
            _ = sleep_until(deadline) => {
                if *cancelled.borrow() {
                    return;
                }
                let now = Instant::now();
                if lifetime_deadline.is_some_and(|lifetime| now >= lifetime) {
                    on_expire(CloseReason::LifetimeExceeded);
                    return;
                }
                if now >= progress.last_progress() + policy.idle {
                    on_expire(CloseReason::IdleTimeout);
                    return;
                }
                // Progress moved the deadline; re-arm.
            }
            changed = cancelled.changed() => {
                if changed.is_err() || *cancelled.borrow() {
                    return;
                }
            }
        }
    }
}

/// Handle to one connection's timer.
#[derive(Debug)]
pub struct TimeoutHandle {
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TimeoutHandle {
    /// Cancel the timer. Returns `true` only for the first effective cancellation.
    pub fn cancel(&self) -> bool {
        self.cancel_tx.send_if_modified(|cancelled| {
            if *cancelled {
                return false;
            }
            *cancelled = true;
            true
        })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<CloseReason>>>, impl FnOnce(CloseReason) + Send + 'static) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        (fired, move |reason| sink.lock().unwrap().push(reason))
    }

    fn idle(secs: u64) -> ConnectionTimeoutMonitor {
        ConnectionTimeoutMonitor::new(TimeoutPolicy {
            idle: Duration::from_secs(secs),
            max_lifetime: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_times_out() {
        let (fired, on_expire) = recorder();
        let handle = idle(30).watch(ProgressTracker::new(), on_expire);

        tokio::time::sleep(Duration::from_millis(29_999)).await;
        assert!(fired.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(*fired.lock().unwrap(), vec![CloseReason::IdleTimeout]);
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn progress_pushes_deadline_back() {
        let (fired, on_expire) = recorder();
        let progress = ProgressTracker::new();
        let _handle = idle(30).watch(progress.clone(), on_expire);

        tokio::time::sleep(Duration::from_secs(20)).await;
        progress.record(16);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(fired.lock().unwrap().is_empty(), "progress at t=20 keeps it alive until t=50");

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(*fired.lock().unwrap(), vec![CloseReason::IdleTimeout]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (fired, on_expire) = recorder();
        let handle = idle(5).watch(ProgressTracker::new(), on_expire);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(handle.cancel());
        assert!(!handle.cancel(), "second cancel is a no-op");
        assert!(handle.is_cancelled());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(fired.lock().unwrap().is_empty());
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn lifetime_cap_applies_despite_progress() {
        let (fired, on_expire) = recorder();
        let progress = ProgressTracker::new();
        let monitor = ConnectionTimeoutMonitor::new(TimeoutPolicy {
            idle: Duration::from_secs(10),
            max_lifetime: Some(Duration::from_secs(25)),
        });
        let _handle = monitor.watch(progress.clone(), on_expire);

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(5)).await;
            progress.record(1);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(*fired.lock().unwrap(), vec![CloseReason::LifetimeExceeded]);
    }

    #[tokio::test(start_paused = true)]
    async fn independent_timers_do_not_interfere() {
        let (fast_fired, fast) = recorder();
        let (slow_fired, slow) = recorder();

        let _fast = idle(2).watch(ProgressTracker::new(), fast);
        let _slow = idle(50).watch(ProgressTracker::new(), slow);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fast_fired.lock().unwrap().len(), 1);
        assert!(slow_fired.lock().unwrap().is_empty());
    }
}
