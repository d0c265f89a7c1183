//! Best-effort notification fan-out.
//!
//! # Responsibilities
//! - Accept events from the authentication path without blocking it
//! - Route each event to admin and account recipients per channel
//! - Log delivery failures; never report them back to the caller
//!
//! # Design Decisions
//! - A bounded queue decouples callers from delivery; when it is full the
//!   event is dropped and counted rather than applying backpressure
//! - One worker task delivers sequentially, so a slow gateway delays only
//!   notifications

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::config::NotificationConfig;
use crate::lifecycle::Shutdown;
use crate::notifications::event::NotificationEvent;
use crate::notifications::sender::{Channel, MessageSender};
use crate::observability::metrics;

/// Handle used by the authentication path to emit events.
#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    tx: Option<mpsc::Sender<NotificationEvent>>,
}

impl NotificationDispatcher {
    /// Create the dispatcher and the worker that must be spawned to drain it.
    pub fn new(
        config: &NotificationConfig,
        senders: Vec<Arc<dyn MessageSender>>,
    ) -> (Self, NotificationWorker) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let dispatcher = Self {
            tx: config.enabled.then_some(tx),
        };
        let worker = NotificationWorker {
            rx,
            senders,
            admin_email: config.admin_email.clone(),
            admin_sms: config.admin_sms.clone(),
        };
        (dispatcher, worker)
    }

    /// A dispatcher that discards every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue an event for delivery. Never blocks and never fails.
    pub fn dispatch(&self, event: NotificationEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        let kind = event.kind;
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                metrics::record_notification("dropped");
                tracing::warn!(component = "notification", kind = %kind, "Notification queue full, event dropped");
            }
            Err(TrySendError::Closed(_)) => {
                metrics::record_notification("dropped");
                tracing::warn!(component = "notification", kind = %kind, "Notification worker stopped, event dropped");
            }
        }
    }
}

/// Drains the queue and talks to the senders.
pub struct NotificationWorker {
    rx: mpsc::Receiver<NotificationEvent>,
    senders: Vec<Arc<dyn MessageSender>>,
    admin_email: Vec<String>,
    admin_sms: Vec<String>,
}

impl NotificationWorker {
    pub fn spawn(self, shutdown: Shutdown) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Deliver until every dispatcher is dropped or shutdown is triggered.
    /// Events already queued at shutdown are still delivered.
    pub async fn run(mut self, shutdown: Shutdown) {
        loop {
            tokio::select! {
                biased;
                event = self.rx.recv() => match event {
                    Some(event) => self.deliver(&event).await,
                    None => break,
                },
                _ = shutdown.wait() => {
                    self.rx.close();
                    while let Some(event) = self.rx.recv().await {
                        self.deliver(&event).await;
                    }
                    break;
                }
            }
        }
        tracing::debug!(component = "notification", "Notification worker stopped");
    }

    async fn deliver(&self, event: &NotificationEvent) {
        let payload = event.payload();
        for (channel, recipient) in self.recipients(event) {
            for sender in self.senders.iter().filter(|s| s.channel() == channel) {
                match sender.send(&recipient, event.kind, &payload).await {
                    Ok(()) => metrics::record_notification("delivered"),
                    Err(err) => {
                        metrics::record_notification("failed");
                        tracing::error!(
                            component = "notification",
                            kind = %event.kind,
                            user_id = %event.target.user_id,
                            error = %err,
                            "Notification delivery failed"
                        );
                    }
                }
            }
        }
    }

    fn recipients(&self, event: &NotificationEvent) -> Vec<(Channel, String)> {
        let mut recipients = Vec::new();
        if event.kind.notifies_admins() {
            recipients.extend(self.admin_email.iter().map(|r| (Channel::Email, r.clone())));
            recipients.extend(self.admin_sms.iter().map(|r| (Channel::Sms, r.clone())));
        }
        if event.kind.notifies_account() {
            if let Some(email) = &event.target.email {
                recipients.push((Channel::Email, email.clone()));
            }
        }
        recipients
    }
}
