//! AutoSync core library: domain types, settings, configuration persistence, errors.
//!
//! Public API surface:
//! - [`types`]: identities, execution requests, partition and controller configuration
//! - [`run`]: run results reported by the execution engine
//! - [`status`]: controller lifecycle and activity states
//! - [`settings`]: service-wide tuning knobs (retry, stagger, run mode, mail)
//! - [`config`]: load / save of the YAML service configuration
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod run;
pub mod settings;
pub mod status;
pub mod types;

pub use config::ServiceConfig;
pub use error::ConfigError;
pub use run::{ChangeCounters, OutboundFlowCounters, RunResult, StepDefinition, StepKind, StepResult};
pub use settings::{MailSettings, RunMode, Settings};
pub use status::{ControlState, ControllerStatus, ExecutionState};
pub use types::{
    AgentCategory, AgentId, AgentIdentity, AgentName, ControllerConfiguration, ExecutionRequest,
    PartitionConfiguration, PartitionId, ProfileRole, TriggerConfig,
};
