//! AutoSync controller library: one execution controller per managed agent.
//!
//! Public API surface:
//! - [`controller`]: lifecycle, queue consumer, retry loop, follow-up work
//! - [`locks`] and [`gate`]: the shared lock registry and its acquisition order
//! - [`queue`]: the deduplicating action queue
//! - [`bus`]: cross-agent "synchronization complete" notifications
//! - [`engine`], [`trigger`], [`policy`], [`mail`]: pluggable seams
//! - [`status`]: observable controller state and events

pub mod bus;
pub mod controller;
pub mod detection;
pub mod engine;
pub mod error;
pub mod followup;
pub mod gate;
pub mod locks;
pub mod mail;
pub mod policy;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod status;
pub mod trigger;

pub use bus::{NotificationBus, Subscription, SyncComplete};
pub use controller::{Controller, ControllerBuilder, Coordination, ServiceStopRequest};
pub use detection::DetectionMode;
pub use engine::{ExecutionEngine, PendingObject, PendingObjects};
pub use error::{
    trigger_io_err, ChangeScope, ControllerError, ExecutionError, MailError, TriggerError,
    UnexpectedChange,
};
pub use followup::FollowUps;
pub use gate::{Gate, GateGuard};
pub use locks::{LockPlan, LockRegistry, LockSet};
pub use mail::{MailGate, MailSender, NoMail};
pub use policy::{NoopPolicy, PostRunPolicy, PostRunVerdict};
pub use queue::{ActionQueue, EnqueueOutcome, PendingAction};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{RecurringTimer, TimerSpec};
pub use status::{ControllerEvent, RunCompletion, StatusPublisher};
pub use trigger::{ExecutionTrigger, TriggerContext, TriggerEvent, TriggerNotice};
