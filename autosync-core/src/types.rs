//! Domain types for the AutoSync controller.
//!
//! Identities are newtypes; every configuration struct is serializable via
//! serde + serde_yaml so it can live in the service configuration file.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Stable identifier of a managed agent, as reported by the execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for AgentId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Display name of a managed agent. Comparisons are case-insensitive.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct AgentName(pub String);

impl AgentName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison against a raw name.
    pub fn matches(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

impl PartialEq for AgentName {
    fn eq(&self, other: &Self) -> bool {
        self.matches(&other.0)
    }
}

impl std::hash::Hash for AgentName {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_ascii_lowercase().hash(state);
    }
}

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for AgentName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AgentName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifier of a partition within an agent's data scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(pub Uuid);

impl PartitionId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for PartitionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// An agent as seen by the controller: its engine ID plus its display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub id: AgentId,
    pub name: AgentName,
}

impl AgentIdentity {
    pub fn new(id: AgentId, name: impl Into<AgentName>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// How an agent's own steps interact with the shared synchronization store.
///
/// `SharedStore` agents read and write the same store the synchronization
/// steps use, so their delta imports (and optionally exports) are serialized
/// with synchronization steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AgentCategory {
    #[default]
    Standard,
    SharedStore,
}

/// Symbolic run profile roles that a partition binds to concrete profile names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProfileRole {
    ScheduledImport,
    ConfirmingImport,
    DeltaSync,
    Export,
}

impl fmt::Display for ProfileRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileRole::ScheduledImport => write!(f, "scheduled-import"),
            ProfileRole::ConfirmingImport => write!(f, "confirming-import"),
            ProfileRole::DeltaSync => write!(f, "delta-sync"),
            ProfileRole::Export => write!(f, "export"),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution requests
// ---------------------------------------------------------------------------

/// A request to run a profile against one agent.
///
/// Either `run_profile_name` is set, or `role` is set and the name is resolved
/// against the controller's partition configuration when the request is queued.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_profile_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<ProfileRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_id: Option<PartitionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_name: Option<String>,
    #[serde(default)]
    pub exclusive: bool,
}

impl ExecutionRequest {
    pub fn named(run_profile_name: impl Into<String>) -> Self {
        Self {
            run_profile_name: Some(run_profile_name.into()),
            ..Self::default()
        }
    }

    pub fn for_role(role: ProfileRole) -> Self {
        Self {
            role: Some(role),
            ..Self::default()
        }
    }

    pub fn in_partition(mut self, id: PartitionId) -> Self {
        self.partition_id = Some(id);
        self
    }

    pub fn in_partition_named(mut self, name: impl Into<String>) -> Self {
        self.partition_name = Some(name.into());
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// The explicit profile name, if one was given and is not blank.
    pub fn explicit_name(&self) -> Option<&str> {
        self.run_profile_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    /// Short human-readable form for log lines.
    pub fn describe(&self) -> String {
        match (self.explicit_name(), self.role) {
            (Some(name), _) => name.to_string(),
            (None, Some(role)) => format!("<{role}>"),
            (None, None) => "<empty>".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Partition configuration
// ---------------------------------------------------------------------------

/// Per-partition run profile bindings and auto-import schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfiguration {
    pub id: PartitionId,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_import_enabled: bool,
    #[serde(default = "default_auto_import_minutes")]
    pub auto_import_interval_minutes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_import_run_profile_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_run_profile_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirming_import_run_profile_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_sync_run_profile_name: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_auto_import_minutes() -> u64 {
    60
}

impl PartitionConfiguration {
    pub fn new(id: PartitionId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            enabled: true,
            auto_import_enabled: false,
            auto_import_interval_minutes: default_auto_import_minutes(),
            scheduled_import_run_profile_name: None,
            export_run_profile_name: None,
            confirming_import_run_profile_name: None,
            delta_sync_run_profile_name: None,
        }
    }

    /// The concrete profile bound to `role` in this partition, if any.
    pub fn run_profile_for(&self, role: ProfileRole) -> Option<&str> {
        let name = match role {
            ProfileRole::ScheduledImport => self.scheduled_import_run_profile_name.as_deref(),
            ProfileRole::ConfirmingImport => self.confirming_import_run_profile_name.as_deref(),
            ProfileRole::DeltaSync => self.delta_sync_run_profile_name.as_deref(),
            ProfileRole::Export => self.export_run_profile_name.as_deref(),
        };
        name.map(str::trim).filter(|n| !n.is_empty())
    }

    /// Auto-import interval, never shorter than one minute.
    pub fn auto_import_interval(&self) -> Duration {
        Duration::from_secs(self.auto_import_interval_minutes.max(1) * 60)
    }
}

// ---------------------------------------------------------------------------
// Trigger configuration
// ---------------------------------------------------------------------------

/// Declarative description of an execution trigger attached to a controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    /// Fire `run_profile_name` every `interval_secs`, aligned to `start` when given.
    Interval {
        run_profile_name: String,
        interval_secs: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start: Option<DateTime<Utc>>,
        #[serde(default)]
        exclusive: bool,
    },
    /// Fire `run_profile_name` when files under `path` are created or modified.
    FileWatch {
        path: PathBuf,
        run_profile_name: String,
        #[serde(default = "default_debounce_ms")]
        debounce_ms: u64,
    },
}

fn default_debounce_ms() -> u64 {
    500
}

// ---------------------------------------------------------------------------
// Controller configuration
// ---------------------------------------------------------------------------

/// Immutable per-agent settings applied when a controller starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfiguration {
    pub agent_name: String,
    #[serde(default)]
    pub disabled: bool,
    /// Configuration generation; `0` means the agent has never been configured.
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub partitions: Vec<PartitionConfiguration>,
    /// Other agents whose local locks must be held while this agent runs.
    #[serde(default)]
    pub lock_agents: Vec<String>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
}

impl ControllerConfiguration {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            disabled: false,
            version: 1,
            partitions: Vec::new(),
            lock_agents: Vec::new(),
            triggers: Vec::new(),
        }
    }

    /// A controller only starts for configured, enabled agents.
    pub fn is_runnable(&self) -> bool {
        self.version != 0 && !self.disabled
    }

    pub fn active_partitions(&self) -> impl Iterator<Item = &PartitionConfiguration> {
        self.partitions.iter().filter(|p| p.enabled)
    }

    pub fn active_partition(&self, id: PartitionId) -> Option<&PartitionConfiguration> {
        self.active_partitions().find(|p| p.id == id)
    }

    pub fn active_partition_named(&self, name: &str) -> Option<&PartitionConfiguration> {
        self.active_partitions()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Resolve a request to a concrete run profile name.
    ///
    /// Explicit names win. Otherwise the role is looked up in the partition
    /// named by ID, else by name, else in the first active partition that
    /// binds the role.
    pub fn resolve_run_profile(&self, request: &ExecutionRequest) -> Option<String> {
        if let Some(name) = request.explicit_name() {
            return Some(name.to_string());
        }

        let role = request.role?;

        if let Some(id) = request.partition_id {
            return self
                .active_partition(id)
                .and_then(|p| p.run_profile_for(role))
                .map(str::to_string);
        }

        if let Some(name) = request.partition_name.as_deref() {
            return self
                .active_partition_named(name)
                .and_then(|p| p.run_profile_for(role))
                .map(str::to_string);
        }

        self.active_partitions()
            .find_map(|p| p.run_profile_for(role))
            .map(str::to_string)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
