//! Execution trigger contract.
//!
//! Triggers produce [`ExecutionRequest`]s for one controller. The controller
//! only calls `start`/`stop` and drains the events emitted through the
//! [`TriggerContext`] it hands out.

use async_trait::async_trait;
use autosync_core::{AgentName, ExecutionRequest};
use tokio::sync::mpsc;

use crate::error::TriggerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerEvent {
    Fired(ExecutionRequest),
    Message(String),
    Error(String),
}

/// An event tagged with the display name of the trigger that raised it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerNotice {
    pub trigger: String,
    pub event: TriggerEvent,
}

/// Handle a trigger uses to reach its controller.
#[derive(Debug, Clone)]
pub struct TriggerContext {
    agent_name: AgentName,
    trigger: String,
    events: mpsc::UnboundedSender<TriggerNotice>,
}

impl TriggerContext {
    pub fn new(
        agent_name: AgentName,
        trigger: impl Into<String>,
        events: mpsc::UnboundedSender<TriggerNotice>,
    ) -> Self {
        Self {
            agent_name,
            trigger: trigger.into(),
            events,
        }
    }

    pub fn agent_name(&self) -> &AgentName {
        &self.agent_name
    }

    /// Returns `false` once the controller has stopped listening.
    pub fn fire(&self, request: ExecutionRequest) -> bool {
        self.emit(TriggerEvent::Fired(request))
    }

    pub fn message(&self, message: impl Into<String>) -> bool {
        self.emit(TriggerEvent::Message(message.into()))
    }

    pub fn error(&self, message: impl Into<String>) -> bool {
        self.emit(TriggerEvent::Error(message.into()))
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    fn emit(&self, event: TriggerEvent) -> bool {
        self.events
            .send(TriggerNotice {
                trigger: self.trigger.clone(),
                event,
            })
            .is_ok()
    }
}

#[async_trait]
pub trait ExecutionTrigger: Send + Sync {
    fn display_name(&self) -> String;

    /// Begin producing events. Must not block until the trigger finishes.
    async fn start(&mut self, context: TriggerContext) -> Result<(), TriggerError>;

    async fn stop(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_tags_events_with_trigger_name() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = TriggerContext::new("AD".into(), "nightly", tx);
        assert!(ctx.fire(ExecutionRequest::named("FI")));
        assert!(ctx.message("armed"));

        let first = rx.try_recv().expect("fired");
        assert_eq!(first.trigger, "nightly");
        assert_eq!(first.event, TriggerEvent::Fired(ExecutionRequest::named("FI")));
        assert_eq!(
            rx.try_recv().expect("message").event,
            TriggerEvent::Message("armed".into())
        );
    }

    #[test]
    fn fire_reports_closed_controller() {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = TriggerContext::new("AD".into(), "nightly", tx);
        drop(rx);
        assert!(ctx.is_closed());
        assert!(!ctx.fire(ExecutionRequest::named("FI")));
    }
}
