//! Error types for autosync-controller.

use std::path::PathBuf;

use autosync_core::ControlState;
use thiserror::Error;

/// How far an unexpected-change signal reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeScope {
    /// Stop the controller that observed the change.
    StopController,
    /// Stop every controller and the service host.
    StopService,
}

/// An unanticipated change reported by the engine or a post-run policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unexpected change ({scope:?}): {message}")]
pub struct UnexpectedChange {
    pub scope: ChangeScope,
    pub message: String,
}

impl UnexpectedChange {
    pub fn stop_controller(message: impl Into<String>) -> Self {
        Self {
            scope: ChangeScope::StopController,
            message: message.into(),
        }
    }

    pub fn stop_service(message: impl Into<String>) -> Self {
        Self {
            scope: ChangeScope::StopService,
            message: message.into(),
        }
    }
}

/// Outcome of a failed engine call or lock wait.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The caller's cancellation signal fired. Not a failure.
    #[error("execution cancelled")]
    Cancelled,

    /// The engine finished the run with a non-success status code.
    #[error("run profile finished with status '{code}'")]
    Failed { code: String },

    #[error(transparent)]
    UnexpectedChange(#[from] UnexpectedChange),

    /// Anything the engine could not classify.
    #[error("engine error: {0}")]
    Engine(String),
}

impl ExecutionError {
    pub fn failed(code: impl Into<String>) -> Self {
        Self::Failed { code: code.into() }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecutionError::Cancelled)
    }
}

/// Errors crossing the controller's public lifecycle API.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("controller for '{agent}' cannot start from state {state}")]
    InvalidState { agent: String, state: ControlState },

    #[error("configuration for '{configured}' cannot be applied to controller '{agent}'")]
    ConfigurationMismatch { agent: String, configured: String },
}

/// Errors raised by execution triggers.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("watch error: {0}")]
    Watch(String),

    #[error("trigger '{0}' is already running")]
    AlreadyStarted(String),

    #[error("invalid trigger configuration: {0}")]
    Invalid(String),
}

pub fn trigger_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> TriggerError {
    TriggerError::Io {
        path: path.into(),
        source,
    }
}

/// Mail delivery failure. Always contained by the caller.
#[derive(Debug, Error)]
#[error("mail delivery failed: {0}")]
pub struct MailError(pub String);
