//! Observable controller state and outbound notifications.
//!
//! The controller owns its [`ControllerStatus`]; every mutation goes through
//! [`StatusPublisher::update`] and emits a snapshot. Delivery is best effort:
//! with no subscribers, events are simply dropped.

use std::sync::{Mutex, PoisonError};

use autosync_core::{ControllerStatus, RunResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunCompletion {
    pub agent_name: String,
    pub run_profile_name: String,
    pub last_step_status: String,
    pub run_number: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl RunCompletion {
    pub fn from_result(agent_name: &str, result: &RunResult) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            run_profile_name: result.run_profile_name.clone(),
            last_step_status: result.last_step_status.clone(),
            run_number: result.run_number,
            start_time: result.start_time,
            end_time: result.end_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControllerEvent {
    StatusChanged(ControllerStatus),
    MessageLogged { agent_name: String, message: String },
    RunProfileComplete(RunCompletion),
}

#[derive(Debug)]
pub struct StatusPublisher {
    status: Mutex<ControllerStatus>,
    events: broadcast::Sender<ControllerEvent>,
}

impl StatusPublisher {
    pub fn new(agent_name: &str) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            status: Mutex::new(ControllerStatus::new(agent_name)),
            events,
        }
    }

    pub fn snapshot(&self) -> ControllerStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply `change`; publish a snapshot if anything changed.
    pub fn update(&self, change: impl FnOnce(&mut ControllerStatus)) {
        let snapshot = {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            let before = status.clone();
            change(&mut status);
            if *status == before {
                return;
            }
            status.clone()
        };
        let _ = self.events.send(ControllerEvent::StatusChanged(snapshot));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn message_logged(&self, message: impl Into<String>) {
        let agent_name = self.agent_name();
        let _ = self.events.send(ControllerEvent::MessageLogged {
            agent_name,
            message: message.into(),
        });
    }

    pub fn run_complete(&self, result: &RunResult) {
        let completion = RunCompletion::from_result(&self.agent_name(), result);
        let _ = self.events.send(ControllerEvent::RunProfileComplete(completion));
    }

    fn agent_name(&self) -> String {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .agent_name
            .clone()
    }
}
