//! Run results as reported by the execution engine.
//!
//! These are read-only to the controller: it classifies them, derives
//! follow-up work from their counters and forwards them to notification
//! consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AgentId, PartitionId};

/// Kind of a single run profile step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    FullImport,
    DeltaImport,
    Export,
    FullSync,
    DeltaSync,
    FullImportDeltaSync,
    DeltaImportDeltaSync,
}

impl StepKind {
    pub fn is_import(self) -> bool {
        matches!(
            self,
            StepKind::FullImport
                | StepKind::DeltaImport
                | StepKind::FullImportDeltaSync
                | StepKind::DeltaImportDeltaSync
        )
    }

    pub fn is_export(self) -> bool {
        matches!(self, StepKind::Export)
    }

    pub fn is_sync(self) -> bool {
        matches!(
            self,
            StepKind::FullSync
                | StepKind::DeltaSync
                | StepKind::FullImportDeltaSync
                | StepKind::DeltaImportDeltaSync
        )
    }

    pub fn is_delta_import(self) -> bool {
        matches!(self, StepKind::DeltaImport | StepKind::DeltaImportDeltaSync)
    }
}

/// Static definition of one step of a run profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<PartitionId>,
}

impl StepDefinition {
    pub fn new(kind: StepKind, partition: Option<PartitionId>) -> Self {
        Self { kind, partition }
    }
}

/// Add/update/rename/delete counts for staged imports or pending exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChangeCounters {
    #[serde(default)]
    pub adds: u64,
    #[serde(default)]
    pub updates: u64,
    #[serde(default)]
    pub renames: u64,
    #[serde(default)]
    pub deletes: u64,
    #[serde(default)]
    pub delete_adds: u64,
}

impl ChangeCounters {
    pub fn has_changes(&self) -> bool {
        self.adds > 0
            || self.updates > 0
            || self.renames > 0
            || self.deletes > 0
            || self.delete_adds > 0
    }

    pub fn total(&self) -> u64 {
        self.adds + self.updates + self.renames + self.deletes + self.delete_adds
    }
}

/// Changes a synchronization step staged for export on another agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundFlowCounters {
    pub target_agent: AgentId,
    pub target_agent_name: String,
    #[serde(default)]
    pub provisioning_adds: u64,
    #[serde(default)]
    pub provisioning_renames: u64,
    #[serde(default)]
    pub provisioning_deletes: u64,
    #[serde(default)]
    pub provisioning_delete_adds: u64,
    #[serde(default)]
    pub attribute_flow_changes: u64,
    #[serde(default)]
    pub deprovisioning_deletes: u64,
}

impl OutboundFlowCounters {
    pub fn new(target_agent: AgentId, target_agent_name: impl Into<String>) -> Self {
        Self {
            target_agent,
            target_agent_name: target_agent_name.into(),
            provisioning_adds: 0,
            provisioning_renames: 0,
            provisioning_deletes: 0,
            provisioning_delete_adds: 0,
            attribute_flow_changes: 0,
            deprovisioning_deletes: 0,
        }
    }

    pub fn has_changes(&self) -> bool {
        self.provisioning_adds > 0
            || self.provisioning_renames > 0
            || self.provisioning_deletes > 0
            || self.provisioning_delete_adds > 0
            || self.attribute_flow_changes > 0
            || self.deprovisioning_deletes > 0
    }
}

/// Result of one executed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub definition: StepDefinition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_counters: Option<ChangeCounters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_counters: Option<ChangeCounters>,
    #[serde(default)]
    pub outbound_flows: Vec<OutboundFlowCounters>,
}

impl StepResult {
    pub fn new(definition: StepDefinition) -> Self {
        Self {
            definition,
            export_counters: None,
            staging_counters: None,
            outbound_flows: Vec::new(),
        }
    }

    pub fn kind(&self) -> StepKind {
        self.definition.kind
    }

    pub fn partition(&self) -> Option<PartitionId> {
        self.definition.partition
    }

    /// An export step that still has changes waiting to be confirmed by an import.
    pub fn has_unconfirmed_exports(&self) -> bool {
        self.kind().is_export()
            && self
                .export_counters
                .as_ref()
                .map(ChangeCounters::has_changes)
                .unwrap_or(false)
    }

    /// An import step that staged changes a synchronization has not yet processed.
    pub fn has_staged_imports(&self) -> bool {
        self.kind().is_import()
            && self
                .staging_counters
                .as_ref()
                .map(ChangeCounters::has_changes)
                .unwrap_or(false)
    }
}

/// A completed (or failed) run of a profile, as recorded by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_profile_name: String,
    /// Monotonic per agent.
    pub run_number: u64,
    pub last_step_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub steps: Vec<StepResult>,
}
