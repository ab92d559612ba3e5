//! Deduplicating, priority-aware action queue with a single blocking consumer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use autosync_core::{ControllerConfiguration, ExecutionRequest};
use tokio::sync::Notify;

/// A resolved request waiting to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAction {
    pub run_profile_name: String,
    pub exclusive: bool,
    pub source: String,
}

impl PendingAction {
    fn same_profile(&self, name: &str) -> bool {
        self.run_profile_name.eq_ignore_ascii_case(name)
    }
}

/// What `enqueue` did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Added,
    AddedToFront,
    MovedToFront,
    AlreadyQueued,
    /// No run profile name could be resolved; the request was dropped.
    Unresolved,
    /// The queue has been shut down.
    Closed,
}

#[derive(Debug)]
struct QueueState {
    items: VecDeque<PendingAction>,
    closed: bool,
    config: Arc<ControllerConfiguration>,
}

#[derive(Debug)]
pub struct ActionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl ActionQueue {
    pub fn new(config: Arc<ControllerConfiguration>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
                config,
            }),
            notify: Notify::new(),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `request`, resolving symbolic roles against the configuration.
    ///
    /// A request whose profile is already queued is coalesced: with
    /// `run_next` the existing entry moves to the head, otherwise the new
    /// request is dropped.
    pub fn enqueue(&self, request: &ExecutionRequest, source: &str, run_next: bool) -> EnqueueOutcome {
        let mut state = self.state();
        let agent = state.config.agent_name.clone();

        if state.closed {
            tracing::debug!(agent = %agent, request = %request.describe(), source, "queue closed, request ignored");
            return EnqueueOutcome::Closed;
        }

        let Some(name) = state.config.resolve_run_profile(request) else {
            tracing::warn!(
                agent = %agent,
                request = %request.describe(),
                source,
                "no run profile could be resolved, request dropped"
            );
            return EnqueueOutcome::Unresolved;
        };

        let existing = state.items.iter().position(|item| item.same_profile(&name));
        let outcome = match (existing, run_next) {
            (Some(0), true) => {
                if let Some(front) = state.items.front_mut() {
                    front.exclusive |= request.exclusive;
                }
                EnqueueOutcome::AlreadyQueued
            }
            (Some(index), true) => {
                if let Some(mut item) = state.items.remove(index) {
                    item.exclusive |= request.exclusive;
                    state.items.push_front(item);
                }
                EnqueueOutcome::MovedToFront
            }
            (Some(index), false) => {
                if let Some(item) = state.items.get_mut(index) {
                    item.exclusive |= request.exclusive;
                }
                EnqueueOutcome::AlreadyQueued
            }
            (None, run_next) => {
                let item = PendingAction {
                    run_profile_name: name.clone(),
                    exclusive: request.exclusive,
                    source: source.to_string(),
                };
                if run_next {
                    state.items.push_front(item);
                    EnqueueOutcome::AddedToFront
                } else {
                    state.items.push_back(item);
                    EnqueueOutcome::Added
                }
            }
        };
        drop(state);

        match outcome {
            EnqueueOutcome::Added | EnqueueOutcome::AddedToFront => {
                tracing::info!(agent = %agent, run_profile = %name, source, run_next, "queued");
                self.notify.notify_one();
            }
            EnqueueOutcome::MovedToFront => {
                tracing::info!(agent = %agent, run_profile = %name, source, "moved to front of queue");
                self.notify.notify_one();
            }
            _ => {
                tracing::debug!(agent = %agent, run_profile = %name, source, "already queued");
            }
        }
        outcome
    }

    /// Wait for the next action. Returns `None` once shut down and drained.
    pub async fn dequeue(&self) -> Option<PendingAction> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state();
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting work and wake the consumer.
    pub fn shutdown(&self) {
        self.state().closed = true;
        self.notify.notify_one();
    }

    /// Drop every pending action.
    pub fn clear(&self) {
        self.state().items.clear();
    }

    /// Empty the queue, re-open it and install the configuration used for
    /// resolving roles.
    pub fn reset(&self, config: Arc<ControllerConfiguration>) {
        let mut state = self.state();
        state.items.clear();
        state.closed = false;
        state.config = config;
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().items.is_empty()
    }

    /// Queued run profile names, head first.
    pub fn names(&self) -> Vec<String> {
        self.state()
            .items
            .iter()
            .map(|item| item.run_profile_name.clone())
            .collect()
    }

    /// Comma-separated queue, optionally prefixed by the executing profile
    /// marked with `*`.
    pub fn display(&self, executing: Option<&str>) -> String {
        let mut parts = Vec::new();
        if let Some(name) = executing {
            parts.push(format!("{name}*"));
        }
        parts.extend(self.names());
        parts.join(",")
    }
}
