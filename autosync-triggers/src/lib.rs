//! Concrete execution triggers and the factory that builds them from
//! [`TriggerConfig`] entries.
//!
//! - [`interval`]: fixed-interval trigger, optionally aligned to a start time
//! - [`watch`]: file-system trigger with per-path debounce

pub mod interval;
pub mod watch;

use std::time::Duration;

use autosync_controller::{ExecutionTrigger, TriggerError};
use autosync_core::TriggerConfig;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use interval::IntervalTrigger;
pub use watch::FileWatchTrigger;

/// Build one trigger from its declarative configuration.
pub fn build(config: &TriggerConfig) -> Result<Box<dyn ExecutionTrigger>, TriggerError> {
    match config {
        TriggerConfig::Interval {
            run_profile_name,
            interval_secs,
            start,
            exclusive,
        } => Ok(Box::new(IntervalTrigger::new(
            run_profile_name.as_str(),
            Duration::from_secs(*interval_secs),
            *start,
            *exclusive,
        )?)),
        TriggerConfig::FileWatch {
            path,
            run_profile_name,
            debounce_ms,
        } => Ok(Box::new(FileWatchTrigger::new(
            path.clone(),
            run_profile_name.as_str(),
            Duration::from_millis(*debounce_ms),
        )?)),
    }
}

/// Build every configured trigger, stopping at the first invalid entry.
pub fn build_all(configs: &[TriggerConfig]) -> Result<Vec<Box<dyn ExecutionTrigger>>, TriggerError> {
    configs.iter().map(build).collect()
}

/// Background task owned by a started trigger.
#[derive(Debug)]
pub(crate) struct TriggerTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl TriggerTask {
    pub(crate) fn new(cancel: CancellationToken, handle: JoinHandle<()>) -> Self {
        Self { cancel, handle }
    }

    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.handle.await {
            tracing::warn!(error = %err, "trigger task ended abnormally");
        }
    }
}
