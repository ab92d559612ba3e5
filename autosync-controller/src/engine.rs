//! The execution engine capability the controller drives.
//!
//! One engine handle per managed agent. Implementations wrap whatever
//! actually runs profiles; the controller only schedules, serializes and
//! reacts to results.

use async_trait::async_trait;
use autosync_core::{AgentCategory, PartitionId, RunResult, StepDefinition};
use tokio_util::sync::CancellationToken;

use crate::error::ExecutionError;

/// A staged object reported by the engine, annotated with its partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingObject {
    pub object_id: String,
    pub partition_id: Option<PartitionId>,
}

impl PendingObject {
    pub fn new(object_id: impl Into<String>, partition_id: Option<PartitionId>) -> Self {
        Self {
            object_id: object_id.into(),
            partition_id,
        }
    }
}

/// Lazy stream of pending objects. Consumers may stop early.
pub type PendingObjects = Box<dyn Iterator<Item = PendingObject> + Send>;

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Storage category of the agent, used by the sync-step lock rule.
    fn category(&self) -> AgentCategory {
        AgentCategory::Standard
    }

    async fn is_idle(&self) -> bool;

    /// Profile currently running on the engine, whoever started it.
    async fn executing_profile_name(&self) -> Option<String>;

    /// Run `name` to completion.
    ///
    /// Returns the terminal status code on success and
    /// [`ExecutionError::Failed`] with the code otherwise.
    async fn execute_run_profile(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutionError>;

    /// The most recent run recorded by the engine.
    async fn last_run(&self) -> Result<Option<RunResult>, ExecutionError>;

    /// Block until the engine's current run finishes.
    async fn wait(&self, cancel: &CancellationToken) -> Result<(), ExecutionError>;

    async fn request_stop(&self) -> Result<(), ExecutionError>;

    /// Steps of the named profile. Unknown profiles have no steps.
    fn run_profile_steps(&self, name: &str) -> Vec<StepDefinition>;

    fn pending_export_objects(&self) -> PendingObjects;

    fn pending_import_objects(&self) -> PendingObjects;
}
