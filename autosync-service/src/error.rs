use std::path::PathBuf;

use thiserror::Error;

/// Error surface of the service host.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(#[from] autosync_core::ConfigError),

    #[error("controller error: {0}")]
    Controller(#[from] autosync_controller::ControllerError),

    #[error("trigger error: {0}")]
    Trigger(#[from] autosync_controller::TriggerError),

    #[error("no execution engine available for agent '{0}'")]
    UnknownAgent(String),

    #[error("service stop requested by '{agent}': {message}")]
    ShutdownRequested { agent: String, message: String },

    #[error("service task error: {0}")]
    Task(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ServiceError {
    ServiceError::Io {
        path: path.into(),
        source,
    }
}
