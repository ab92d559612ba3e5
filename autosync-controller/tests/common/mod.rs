#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use autosync_controller::{
    Controller, Coordination, ExecutionEngine, ExecutionError, LockRegistry, NotificationBus,
    PendingObject, PendingObjects,
};
use autosync_core::{
    AgentCategory, AgentId, AgentIdentity, ControllerConfiguration, PartitionConfiguration,
    PartitionId, RunResult, Settings, StepDefinition, StepResult,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One engine call, as observed by a [`RunLog`].
#[derive(Debug, Clone)]
pub struct RunSpan {
    pub agent: String,
    pub run_profile: String,
    pub start: Instant,
    pub end: Instant,
}

impl RunSpan {
    pub fn overlaps(&self, other: &RunSpan) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Spans shared across several fake engines.
#[derive(Debug, Default)]
pub struct RunLog {
    spans: Mutex<Vec<RunSpan>>,
}

impl RunLog {
    pub fn spans(&self) -> Vec<RunSpan> {
        self.spans.lock().unwrap().clone()
    }
}

#[derive(Debug)]
struct UnmanagedRun {
    run_profile: String,
    duration: Duration,
}

#[derive(Debug, Default)]
struct EngineState {
    script: VecDeque<Result<String, ExecutionError>>,
    calls: Vec<String>,
    steps: HashMap<String, Vec<StepDefinition>>,
    result_steps: HashMap<String, Vec<StepResult>>,
    run_duration: Duration,
    run_number: u64,
    last_run: Option<RunResult>,
    pending_exports: Vec<PendingObject>,
    pending_imports: Vec<PendingObject>,
    unmanaged: Option<UnmanagedRun>,
    stop_requests: usize,
    skip_recording: bool,
}

/// Scripted engine. Unscripted calls finish with `success`.
#[derive(Debug)]
pub struct FakeEngine {
    agent: String,
    category: AgentCategory,
    log: Option<Arc<RunLog>>,
    state: Mutex<EngineState>,
}

impl FakeEngine {
    pub fn new(agent: &str) -> Self {
        Self {
            agent: agent.to_string(),
            category: AgentCategory::Standard,
            log: None,
            state: Mutex::new(EngineState {
                run_duration: Duration::from_secs(1),
                ..EngineState::default()
            }),
        }
    }

    pub fn shared_store(mut self) -> Self {
        self.category = AgentCategory::SharedStore;
        self
    }

    pub fn logging_to(mut self, log: Arc<RunLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn script<I>(&self, outcomes: I)
    where
        I: IntoIterator<Item = Result<String, ExecutionError>>,
    {
        self.state.lock().unwrap().script.extend(outcomes);
    }

    pub fn set_run_duration(&self, duration: Duration) {
        self.state.lock().unwrap().run_duration = duration;
    }

    pub fn set_steps(&self, run_profile: &str, steps: Vec<StepDefinition>) {
        self.state
            .lock()
            .unwrap()
            .steps
            .insert(run_profile.to_ascii_lowercase(), steps);
    }

    /// Step results recorded in `last_run` whenever `run_profile` finishes.
    pub fn set_result_steps(&self, run_profile: &str, steps: Vec<StepResult>) {
        self.state
            .lock()
            .unwrap()
            .result_steps
            .insert(run_profile.to_ascii_lowercase(), steps);
    }

    pub fn set_last_run(&self, run: RunResult) {
        let mut state = self.state.lock().unwrap();
        state.run_number = run.run_number;
        state.last_run = Some(run);
    }

    /// Finished calls leave `last_run` untouched, like a run that never started.
    pub fn stop_recording_runs(&self) {
        self.state.lock().unwrap().skip_recording = true;
    }

    pub fn set_pending_exports(&self, objects: Vec<PendingObject>) {
        self.state.lock().unwrap().pending_exports = objects;
    }

    pub fn set_pending_imports(&self, objects: Vec<PendingObject>) {
        self.state.lock().unwrap().pending_imports = objects;
    }

    /// Pretend someone outside the controller started `run_profile`.
    pub fn begin_unmanaged_run(&self, run_profile: &str, duration: Duration) {
        self.state.lock().unwrap().unmanaged = Some(UnmanagedRun {
            run_profile: run_profile.to_string(),
            duration,
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn stop_requests(&self) -> usize {
        self.state.lock().unwrap().stop_requests
    }

    pub fn last_run_number(&self) -> u64 {
        self.state.lock().unwrap().run_number
    }

    fn record_run(&self, run_profile: &str, status: &str) {
        let mut state = self.state.lock().unwrap();
        if state.skip_recording {
            return;
        }
        state.run_number += 1;
        let steps = state
            .result_steps
            .get(&run_profile.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default();
        state.last_run = Some(RunResult {
            run_profile_name: run_profile.to_string(),
            run_number: state.run_number,
            last_step_status: status.to_string(),
            start_time: None,
            end_time: None,
            steps,
        });
    }
}

#[async_trait]
impl ExecutionEngine for FakeEngine {
    fn category(&self) -> AgentCategory {
        self.category
    }

    async fn is_idle(&self) -> bool {
        self.state.lock().unwrap().unmanaged.is_none()
    }

    async fn executing_profile_name(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .unmanaged
            .as_ref()
            .map(|run| run.run_profile.clone())
    }

    async fn execute_run_profile(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ExecutionError> {
        let (duration, scripted) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(name.to_string());
            (state.run_duration, state.script.pop_front())
        };

        let start = Instant::now();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
            _ = tokio::time::sleep(duration) => {}
        }
        if let Some(log) = &self.log {
            log.spans.lock().unwrap().push(RunSpan {
                agent: self.agent.clone(),
                run_profile: name.to_string(),
                start,
                end: Instant::now(),
            });
        }

        let outcome = scripted.unwrap_or_else(|| Ok("success".to_string()));
        match &outcome {
            Ok(code) | Err(ExecutionError::Failed { code }) => self.record_run(name, code),
            Err(_) => {}
        }
        outcome
    }

    async fn last_run(&self) -> Result<Option<RunResult>, ExecutionError> {
        Ok(self.state.lock().unwrap().last_run.clone())
    }

    async fn wait(&self, cancel: &CancellationToken) -> Result<(), ExecutionError> {
        let duration = match self.state.lock().unwrap().unmanaged.as_ref() {
            Some(run) => run.duration,
            None => return Ok(()),
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
            _ = tokio::time::sleep(duration) => {}
        }
        let finished = self.state.lock().unwrap().unmanaged.take();
        if let Some(run) = finished {
            self.record_run(&run.run_profile, "success");
        }
        Ok(())
    }

    async fn request_stop(&self) -> Result<(), ExecutionError> {
        self.state.lock().unwrap().stop_requests += 1;
        Ok(())
    }

    fn run_profile_steps(&self, name: &str) -> Vec<StepDefinition> {
        self.state
            .lock()
            .unwrap()
            .steps
            .get(&name.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    fn pending_export_objects(&self) -> PendingObjects {
        Box::new(self.state.lock().unwrap().pending_exports.clone().into_iter())
    }

    fn pending_import_objects(&self) -> PendingObjects {
        Box::new(self.state.lock().unwrap().pending_imports.clone().into_iter())
    }
}

pub fn coordination() -> Coordination {
    Coordination::new(LockRegistry::new(), NotificationBus::new())
}

pub fn identity(name: &str) -> AgentIdentity {
    AgentIdentity::new(AgentId::new_v4(), name)
}

/// Settings with short delays so paused-clock tests stay readable.
pub fn fast_settings() -> Settings {
    Settings {
        retry_sleep_interval_ms: 100,
        execution_stagger_interval_ms: 10,
        stop_timeout_secs: 5,
        ..Settings::default()
    }
}

/// One active partition binding every role to a distinct profile name.
pub fn partition(id: PartitionId) -> PartitionConfiguration {
    let mut partition = PartitionConfiguration::new(id, "default");
    partition.scheduled_import_run_profile_name = Some("FI".to_string());
    partition.export_run_profile_name = Some("EX".to_string());
    partition.confirming_import_run_profile_name = Some("CI".to_string());
    partition.delta_sync_run_profile_name = Some("DS".to_string());
    partition
}

pub fn config_with_partition(agent: &str, id: PartitionId) -> ControllerConfiguration {
    let mut config = ControllerConfiguration::new(agent);
    config.partitions.push(partition(id));
    config
}

pub fn controller(
    identity: AgentIdentity,
    config: ControllerConfiguration,
    engine: Arc<FakeEngine>,
    coordination: Coordination,
) -> Controller {
    Controller::builder(identity, config, engine, coordination)
        .settings(fast_settings())
        .build()
}

/// Poll `condition` on the (usually paused) tokio clock.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..1_200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Let background tasks run for `duration` of clock time.
pub async fn settle(duration: Duration) {
    tokio::time::sleep(duration).await;
}
