//! Controller lifecycle and activity states, and the observable status snapshot.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Controller lifecycle.
///
/// `Disabled → Stopped → Starting → Running → Stopping → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ControlState {
    Disabled,
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlState::Disabled => write!(f, "disabled"),
            ControlState::Stopped => write!(f, "stopped"),
            ControlState::Starting => write!(f, "starting"),
            ControlState::Running => write!(f, "running"),
            ControlState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Activity of a running controller.
///
/// `Waiting` covers lock acquisition and stagger delay, `Running` the engine
/// call, `Processing` result evaluation and follow-up derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    #[default]
    Idle,
    Waiting,
    Running,
    Processing,
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionState::Idle => write!(f, "idle"),
            ExecutionState::Waiting => write!(f, "waiting"),
            ExecutionState::Running => write!(f, "running"),
            ExecutionState::Processing => write!(f, "processing"),
        }
    }
}

/// Snapshot of a controller's observable state. Published by copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ControllerStatus {
    pub agent_name: String,
    pub control_state: ControlState,
    pub execution_state: ExecutionState,
    pub active_version: u32,
    pub has_sync_lock: bool,
    pub has_exclusive_lock: bool,
    pub has_foreign_lock: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executing_run_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Queued run profile names, comma separated.
    pub execution_queue: String,
}

impl ControllerStatus {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            ..Self::default()
        }
    }

    /// Reset everything except identity and lifecycle state.
    pub fn clear(&mut self) {
        self.execution_state = ExecutionState::Idle;
        self.active_version = 0;
        self.has_sync_lock = false;
        self.has_exclusive_lock = false;
        self.has_foreign_lock = false;
        self.executing_run_profile = None;
        self.message = None;
        self.execution_queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_keeps_identity_and_control_state() {
        let mut status = ControllerStatus::new("ad");
        status.control_state = ControlState::Running;
        status.execution_state = ExecutionState::Running;
        status.has_sync_lock = true;
        status.executing_run_profile = Some("DI".into());
        status.execution_queue = "DS,EX".into();

        status.clear();

        assert_eq!(status.agent_name, "ad");
        assert_eq!(status.control_state, ControlState::Running);
        assert_eq!(status.execution_state, ExecutionState::Idle);
        assert!(!status.has_sync_lock);
        assert!(status.executing_run_profile.is_none());
        assert!(status.execution_queue.is_empty());
    }

    #[test]
    fn status_serializes_lowercase_states() {
        let status = ControllerStatus::new("ad");
        let json = serde_json::to_value(&status).expect("serialize");
        assert_eq!(json["control_state"], "stopped");
        assert_eq!(json["execution_state"], "idle");
        assert!(json.get("message").is_none());
    }
}
