//! Time-boxed user confirmation for destructive strategies

use crate::events::{AppEvent, EventBus};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

#[async_trait]
pub trait ConfirmationProvider: Send + Sync {
    /// Ask whether `strategy` may run; no answer within `timeout` means no
    async fn confirm(&self, strategy: &str, message: &str, timeout: Duration) -> bool;

    /// Deliver an answer to a pending request; false if none is pending
    fn answer(&self, _confirmation_id: &str, _approved: bool) -> bool {
        false
    }
}

/// Denies everything without asking
pub struct DenyAll;

#[async_trait]
impl ConfirmationProvider for DenyAll {
    async fn confirm(&self, _strategy: &str, _message: &str, _timeout: Duration) -> bool {
        false
    }
}

/// Publishes `recovery-confirmation-requested` and waits for [`answer`](ConfirmationProvider::answer)
pub struct EventConfirmation {
    events: EventBus,
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
}

impl EventConfirmation {
    pub fn new(events: EventBus) -> Self {
        Self {
            events,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

#[async_trait]
impl ConfirmationProvider for EventConfirmation {
    async fn confirm(&self, strategy: &str, message: &str, timeout: Duration) -> bool {
        let confirmation_id = Uuid::now_v7().to_string();
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().insert(confirmation_id.clone(), sender);

        self.events.publish(AppEvent::RecoveryConfirmationRequested {
            confirmation_id: confirmation_id.clone(),
            strategy: strategy.to_string(),
            message: message.to_string(),
            timeout_secs: timeout.as_secs(),
        });

        let approved = match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(approved)) => approved,
            Ok(Err(_)) => false,
            Err(_) => {
                warn!(strategy, %confirmation_id, "Recovery confirmation timed out, denying");
                false
            }
        };
        self.pending.lock().remove(&confirmation_id);
        info!(strategy, approved, "Recovery confirmation resolved");
        approved
    }

    fn answer(&self, confirmation_id: &str, approved: bool) -> bool {
        match self.pending.lock().remove(confirmation_id) {
            Some(sender) => sender.send(approved).is_ok(),
            None => false,
        }
    }
}
