//! Process-wide "synchronization complete" notifications between controllers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use autosync_core::{AgentId, AgentName};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const DEFAULT_CAPACITY: usize = 256;

/// A synchronization on `sending_agent` staged outbound changes for `target_agent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncComplete {
    pub sending_agent: AgentName,
    pub target_agent: AgentId,
}

#[derive(Debug)]
pub struct NotificationBus {
    sender: broadcast::Sender<SyncComplete>,
    subscribers: Arc<AtomicUsize>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl NotificationBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            subscribers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Publish without waiting. Returns how many subscribers saw the event.
    pub fn publish(&self, event: SyncComplete) -> usize {
        tracing::debug!(
            sender = %event.sending_agent,
            target = %event.target_agent,
            "publishing sync-complete"
        );
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribers.fetch_add(1, Ordering::AcqRel);
        Subscription {
            receiver: self.sender.subscribe(),
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Acquire)
    }
}

/// A live subscription. Call [`Subscription::unsubscribe`] (or drop it) to stop
/// receiving events.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<SyncComplete>,
    subscribers: Arc<AtomicUsize>,
}

impl Subscription {
    /// Next event naming `agent`. `None` once the bus is gone.
    pub async fn recv_for(&mut self, agent: AgentId) -> Option<SyncComplete> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.target_agent == agent => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "sync-complete subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscribers.fetch_sub(1, Ordering::AcqRel);
    }
}
