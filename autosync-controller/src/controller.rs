//! Per-agent execution controller.
//!
//! One [`Controller`] per managed agent. It owns the agent's action queue,
//! runs a single consumer task that takes locks from the shared
//! [`LockRegistry`], drives the [`ExecutionEngine`], retries transient
//! failures and turns run results into follow-up work.
//!
//! Task layout while running:
//!
//! - consumer loop: unmanaged-run reconcile, change scan, then one queued action at a time
//! - trigger listener: turns trigger events into queued actions
//! - bus listener: turns "synchronization complete" events into export requests
//! - timers: per-partition auto-import, periodic unmanaged-change scan

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use autosync_core::{
    AgentCategory, AgentIdentity, AgentName, ControlState, ControllerConfiguration,
    ControllerStatus, ExecutionRequest, ExecutionState, PartitionId, ProfileRole, RunMode,
    RunResult, Settings, StepDefinition,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{NotificationBus, SyncComplete};
use crate::detection::{self, DetectionMode};
use crate::engine::{ExecutionEngine, PendingObjects};
use crate::error::{ChangeScope, ControllerError, ExecutionError, UnexpectedChange};
use crate::followup;
use crate::locks::{LockPlan, LockRegistry, LockSet};
use crate::mail::{self, MailGate, MailSender, NoMail};
use crate::policy::{NoopPolicy, PostRunPolicy, PostRunVerdict};
use crate::queue::{ActionQueue, EnqueueOutcome, PendingAction};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::scheduler::{RecurringTimer, TimerSpec};
use crate::status::{ControllerEvent, StatusPublisher};
use crate::trigger::{ExecutionTrigger, TriggerContext, TriggerEvent, TriggerNotice};

/// A controller asking the service host to shut everything down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStopRequest {
    pub agent_name: String,
    pub change: UnexpectedChange,
}

/// Process-wide state shared by every controller.
#[derive(Debug, Clone)]
pub struct Coordination {
    pub locks: Arc<LockRegistry>,
    pub bus: Arc<NotificationBus>,
    pub escalation: Option<mpsc::UnboundedSender<ServiceStopRequest>>,
}

impl Coordination {
    pub fn new(locks: Arc<LockRegistry>, bus: Arc<NotificationBus>) -> Self {
        Self {
            locks,
            bus,
            escalation: None,
        }
    }

    pub fn with_escalation(mut self, escalation: mpsc::UnboundedSender<ServiceStopRequest>) -> Self {
        self.escalation = Some(escalation);
        self
    }
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

pub struct ControllerBuilder {
    identity: AgentIdentity,
    config: ControllerConfiguration,
    engine: Arc<dyn ExecutionEngine>,
    coordination: Coordination,
    settings: Settings,
    policy: Arc<dyn PostRunPolicy>,
    mail: Arc<dyn MailSender>,
    triggers: Vec<Box<dyn ExecutionTrigger>>,
}

impl ControllerBuilder {
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn policy(mut self, policy: Arc<dyn PostRunPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn mail_sender(mut self, mail: Arc<dyn MailSender>) -> Self {
        self.mail = mail;
        self
    }

    pub fn trigger(mut self, trigger: Box<dyn ExecutionTrigger>) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn triggers(mut self, triggers: Vec<Box<dyn ExecutionTrigger>>) -> Self {
        self.triggers.extend(triggers);
        self
    }

    /// Build the controller and register its agent with the lock registry.
    pub fn build(self) -> Controller {
        self.coordination.locks.register(&self.identity);

        let config = Arc::new(self.config);
        // Opened by `start`.
        let queue = ActionQueue::new(Arc::clone(&config));
        queue.shutdown();

        let status = StatusPublisher::new(self.identity.name.as_str());
        let initial = if config.is_runnable() {
            ControlState::Stopped
        } else {
            ControlState::Disabled
        };
        status.update(|s| {
            s.control_state = initial;
            s.active_version = config.version;
        });

        Controller {
            inner: Arc::new(Inner {
                identity: self.identity,
                engine: self.engine,
                coordination: self.coordination,
                retry: RetryPolicy::from_settings(&self.settings),
                mail_gate: MailGate::new(self.settings.mail.clone()),
                settings: self.settings,
                policy: self.policy,
                mail: self.mail,
                queue,
                config: Mutex::new(config),
                status,
                control: tokio::sync::Mutex::new(()),
                triggers: tokio::sync::Mutex::new(self.triggers),
                active: Mutex::new(None),
                job: Mutex::new(None),
                last_run_number: Mutex::new(None),
            }),
        }
    }
}

struct Inner {
    identity: AgentIdentity,
    engine: Arc<dyn ExecutionEngine>,
    coordination: Coordination,
    settings: Settings,
    retry: RetryPolicy,
    policy: Arc<dyn PostRunPolicy>,
    mail: Arc<dyn MailSender>,
    mail_gate: MailGate,
    config: Mutex<Arc<ControllerConfiguration>>,
    queue: ActionQueue,
    status: StatusPublisher,
    /// Serializes start/stop/reconfigure.
    control: tokio::sync::Mutex<()>,
    triggers: tokio::sync::Mutex<Vec<Box<dyn ExecutionTrigger>>>,
    active: Mutex<Option<ActiveRun>>,
    job: Mutex<Option<CancellationToken>>,
    last_run_number: Mutex<Option<u64>>,
}

/// State that exists only between a start and the matching stop.
struct ActiveRun {
    cancel: CancellationToken,
    consumer: Option<JoinHandle<()>>,
    listeners: Vec<JoinHandle<()>>,
    import_timers: HashMap<PartitionId, RecurringTimer>,
    timers: Vec<RecurringTimer>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one agent's controller. Cheap to clone.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("agent", &self.inner.identity.name)
            .field("control_state", &self.control_state())
            .finish()
    }
}

impl Controller {
    pub fn builder(
        identity: AgentIdentity,
        config: ControllerConfiguration,
        engine: Arc<dyn ExecutionEngine>,
        coordination: Coordination,
    ) -> ControllerBuilder {
        ControllerBuilder {
            identity,
            config,
            engine,
            coordination,
            settings: Settings::default(),
            policy: Arc::new(NoopPolicy),
            mail: Arc::new(NoMail),
            triggers: Vec::new(),
        }
    }

    fn from_weak(inner: &Weak<Inner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.inner.identity
    }

    pub fn agent_name(&self) -> &AgentName {
        &self.inner.identity.name
    }

    pub fn configuration(&self) -> Arc<ControllerConfiguration> {
        Arc::clone(&lock(&self.inner.config))
    }

    pub fn status(&self) -> ControllerStatus {
        self.inner.status.snapshot()
    }

    pub fn control_state(&self) -> ControlState {
        self.inner.status.snapshot().control_state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.inner.status.subscribe()
    }

    /// Queued run profile names, head first.
    pub fn queued(&self) -> Vec<String> {
        self.inner.queue.names()
    }

    /// Queue display with the executing profile marked by `*`.
    pub fn queue_display(&self) -> String {
        let executing = self.status().executing_run_profile;
        self.inner.queue.display(executing.as_deref())
    }

    pub fn last_run_number(&self) -> Option<u64> {
        *lock(&self.inner.last_run_number)
    }

    /// Queue a request. Safe to call from any task.
    pub fn enqueue(&self, request: &ExecutionRequest, source: &str, run_next: bool) -> EnqueueOutcome {
        let outcome = self.inner.queue.enqueue(request, source, run_next);
        let described = request.describe();
        let message = match outcome {
            EnqueueOutcome::Added => format!("Added {described} to the execution queue"),
            EnqueueOutcome::AddedToFront => {
                format!("Added {described} to the front of the execution queue")
            }
            EnqueueOutcome::MovedToFront => {
                format!("Moved {described} to the front of the execution queue")
            }
            _ => return outcome,
        };
        self.inner
            .status
            .message_logged(format!("{message} (triggered by: {source})"));
        self.publish_queue();
        outcome
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the controller. A no-op when already running.
    pub async fn start(&self) -> Result<(), ControllerError> {
        let _control = self.inner.control.lock().await;
        let agent = self.agent_name().to_string();

        match self.control_state() {
            ControlState::Running => {
                tracing::trace!(agent = %agent, "ignoring start request, already running");
                return Ok(());
            }
            ControlState::Stopped | ControlState::Disabled => {}
            state => return Err(ControllerError::InvalidState { agent, state }),
        }

        let config = self.configuration();
        if !config.is_runnable() {
            tracing::info!(agent = %agent, "ignoring start request, agent is disabled or unconfigured");
            self.set_control_state(ControlState::Disabled);
            return Ok(());
        }

        tracing::info!(agent = %agent, version = config.version, "preparing to start controller");
        self.set_control_state(ControlState::Starting);

        self.inner.queue.reset(Arc::clone(&config));
        self.inner.mail_gate.reset();
        self.inner.status.update(|s| s.active_version = config.version);

        let mode = DetectionMode::for_active_partitions(config.active_partitions().count());
        match mode {
            DetectionMode::WalkConnectorSpace => {
                tracing::trace!(agent = %agent, "controller will walk pending objects to detect partitions")
            }
            DetectionMode::AssumeAll => {
                tracing::trace!(agent = %agent, "controller will assume all partitions need work when objects are pending")
            }
        }

        let cancel = CancellationToken::new();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (scan_tx, scan_rx) = mpsc::channel(1);

        *lock(&self.inner.active) = Some(ActiveRun {
            cancel: cancel.clone(),
            consumer: None,
            listeners: Vec::new(),
            import_timers: HashMap::new(),
            timers: Vec::new(),
        });

        self.log_info("Starting controller");

        let listeners = vec![
            self.spawn_trigger_listener(notice_rx, cancel.clone()),
            self.spawn_bus_listener(cancel.clone()),
        ];
        let consumer = {
            let controller = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.run(cancel, notice_tx, scan_tx, scan_rx).await })
        };

        if let Some(active) = lock(&self.inner.active).as_mut() {
            active.consumer = Some(consumer);
            active.listeners = listeners;
        }

        self.set_control_state(ControlState::Running);
        Ok(())
    }

    /// Stop the controller. Idempotent.
    ///
    /// With `cancel_run`, the engine is also asked to abandon its current run.
    pub async fn stop(&self, cancel_run: bool) {
        let _control = self.inner.control.lock().await;
        self.stop_locked(cancel_run).await;
    }

    async fn stop_locked(&self, cancel_run: bool) {
        let agent = self.agent_name().to_string();

        match self.control_state() {
            ControlState::Stopped | ControlState::Disabled => {
                if cancel_run {
                    self.try_cancel_run().await;
                }
                return;
            }
            ControlState::Stopping => return,
            _ => {}
        }

        self.set_control_state(ControlState::Stopping);
        self.log_info("Stopping controller");

        self.inner.queue.shutdown();
        let active = lock(&self.inner.active).take();

        if let Some(mut active) = active {
            active.cancel.cancel();

            self.stop_triggers().await;
            self.log_info("Stopped execution triggers");

            for timer in active.import_timers.drain().map(|(_, t)| t) {
                timer.stop();
            }
            for timer in active.timers.drain(..) {
                timer.stop();
            }

            if let Some(mut consumer) = active.consumer.take() {
                if !consumer.is_finished() {
                    self.log_info("Waiting for cancellation to complete");
                }
                let bound = self.inner.settings.stop_timeout();
                match tokio::time::timeout(bound, &mut consumer).await {
                    Ok(Ok(())) => tracing::debug!(agent = %agent, "cancellation completed"),
                    Ok(Err(err)) => {
                        tracing::error!(agent = %agent, error = %err, "controller task ended abnormally")
                    }
                    Err(_) => {
                        self.log_warn("Controller task did not stop in the allowed time");
                        consumer.abort();
                    }
                }
            }

            for listener in active.listeners.drain(..) {
                listener.abort();
            }
        }

        if cancel_run {
            self.try_cancel_run().await;
        }

        self.inner.queue.clear();
        *lock(&self.inner.job) = None;
        self.inner.status.update(|s| {
            s.clear();
            s.control_state = ControlState::Stopped;
        });
        tracing::info!(agent = %agent, "controller stopped");
    }

    /// Abandon the current run without stopping the controller.
    pub async fn cancel_run(&self) {
        self.try_cancel_run().await;
    }

    async fn try_cancel_run(&self) {
        if !self.inner.engine.is_idle().await {
            self.log_info("Requesting the engine to terminate the run");
            if let Err(err) = self.inner.engine.request_stop().await {
                self.log_error(format!("Cannot cancel run: {err}"));
            }
            return;
        }

        let job = lock(&self.inner.job).clone();
        if let Some(job) = job {
            self.log_info("Canceling current job");
            job.cancel();
        }
    }

    /// Replace the configuration and triggers of a stopped controller.
    pub async fn reconfigure(
        &self,
        config: ControllerConfiguration,
        triggers: Vec<Box<dyn ExecutionTrigger>>,
    ) -> Result<(), ControllerError> {
        let _control = self.inner.control.lock().await;
        let agent = self.agent_name().to_string();

        if !self.agent_name().matches(&config.agent_name) {
            return Err(ControllerError::ConfigurationMismatch {
                agent,
                configured: config.agent_name,
            });
        }

        match self.control_state() {
            ControlState::Stopped | ControlState::Disabled => {}
            state => return Err(ControllerError::InvalidState { agent, state }),
        }

        let state = if config.is_runnable() {
            ControlState::Stopped
        } else {
            ControlState::Disabled
        };
        let version = config.version;
        *lock(&self.inner.config) = Arc::new(config);
        *self.inner.triggers.lock().await = triggers;
        self.inner.status.update(|s| {
            s.control_state = state;
            s.active_version = version;
        });
        Ok(())
    }

    /// Cancel the running controller from inside one of its own tasks and
    /// finish the stop sequence on a separate task.
    fn request_self_stop(&self) {
        if let Some(active) = lock(&self.inner.active).as_ref() {
            active.cancel.cancel();
        }
        let controller = self.clone();
        tokio::spawn(async move { controller.stop(false).await });
    }

    // -----------------------------------------------------------------------
    // Consumer loop
    // -----------------------------------------------------------------------

    async fn run(
        self,
        cancel: CancellationToken,
        notices: mpsc::UnboundedSender<TriggerNotice>,
        scan_tx: mpsc::Sender<()>,
        mut scan_rx: mpsc::Receiver<()>,
    ) {
        self.reconcile(&cancel).await;
        if cancel.is_cancelled() {
            return;
        }

        self.start_triggers(&notices, &cancel).await;
        drop(notices);
        self.start_timers(&cancel, scan_tx);
        if cancel.is_cancelled() {
            return;
        }

        self.log_info("Starting action processing queue");
        self.set_idle();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(()) = scan_rx.recv() => self.reconcile(&cancel).await,
                action = self.inner.queue.dequeue() => match action {
                    Some(action) => self.process(action, &cancel).await,
                    None => break,
                },
            }
        }

        self.log_info("Stopped action processing queue");
    }

    /// Follow any unmanaged run to completion, then scan for changes it or
    /// an earlier process left behind.
    async fn reconcile(&self, cancel: &CancellationToken) {
        if let Err(err) = self.wait_on_unmanaged_run(cancel).await {
            self.handle_job_error(err, None);
        }
        if cancel.is_cancelled() {
            return;
        }
        self.scan_unmanaged_changes(cancel).await;
        self.set_idle();
    }

    async fn process(&self, action: PendingAction, cancel: &CancellationToken) {
        let name = action.run_profile_name.clone();
        let queue = self.inner.queue.display(None);
        self.inner.status.update(|s| {
            s.execution_state = ExecutionState::Waiting;
            s.message = Some("Staging run".to_string());
            s.executing_run_profile = Some(name.clone());
            s.execution_queue = queue;
        });

        if !self.inner.policy.should_execute(self.agent_name(), &name).await {
            self.log_warn(format!("Post-run policy indicated that {name} should not be executed"));
            self.set_idle();
            return;
        }

        let steps = self.inner.engine.run_profile_steps(&name);
        let exclusive = self.exclusive_mode(&action, &steps);

        if let Err(err) = self.wait_on_unmanaged_run(cancel).await {
            self.handle_job_error(err, Some(&name));
            self.set_idle();
            return;
        }

        let job = self.begin_job(cancel);
        let outcome = self.take_locks_and_execute(&name, &steps, exclusive, &job).await;
        self.end_job();

        if let Err(err) = outcome {
            self.handle_job_error(err, Some(&name));
        }
        self.set_idle();
    }

    fn handle_job_error(&self, err: ExecutionError, run_profile: Option<&str>) {
        let run_profile = run_profile.unwrap_or("<none>");
        match err {
            ExecutionError::Cancelled => {
                self.log_info(format!("The run profile {run_profile} was canceled"));
            }
            ExecutionError::UnexpectedChange(change) => {
                self.process_unexpected_change(change, run_profile);
            }
            other => {
                tracing::error!(agent = %self.agent_name(), run_profile, error = %other, "controller encountered an error executing run profile");
                self.inner.status.message_logged(format!(
                    "Controller encountered an error executing run profile {run_profile}: {other}"
                ));
            }
        }
    }

    fn process_unexpected_change(&self, change: UnexpectedChange, run_profile: &str) {
        match change.scope {
            ChangeScope::StopService => {
                self.log_warn(format!(
                    "Unexpected change requires the service to stop. Run profile {run_profile}: {}",
                    change.message
                ));
                let request = ServiceStopRequest {
                    agent_name: self.agent_name().to_string(),
                    change,
                };
                let escalated = self
                    .inner
                    .coordination
                    .escalation
                    .as_ref()
                    .map(|tx| tx.send(request).is_ok())
                    .unwrap_or(false);
                if !escalated {
                    self.log_error("No service host accepted the stop request; stopping this controller");
                    self.request_self_stop();
                }
            }
            ChangeScope::StopController => {
                self.log_warn(format!(
                    "Unexpected change requires this controller to stop. Run profile {run_profile}: {}",
                    change.message
                ));
                self.request_self_stop();
            }
        }
    }

    fn begin_job(&self, parent: &CancellationToken) -> CancellationToken {
        let job = parent.child_token();
        *lock(&self.inner.job) = Some(job.clone());
        job
    }

    fn end_job(&self) {
        *lock(&self.inner.job) = None;
    }

    // -----------------------------------------------------------------------
    // Locks and execution
    // -----------------------------------------------------------------------

    fn exclusive_mode(&self, action: &PendingAction, steps: &[StepDefinition]) -> bool {
        match self.inner.settings.run_mode {
            RunMode::Exclusive => true,
            RunMode::Supported => action.exclusive || steps.iter().any(|s| s.kind.is_sync()),
            RunMode::Unsupported => action.exclusive,
        }
    }

    fn requires_sync_lock(&self, steps: &[StepDefinition]) -> bool {
        if steps.iter().any(|s| s.kind.is_sync()) {
            return true;
        }
        if self.inner.engine.category() == AgentCategory::SharedStore {
            if steps.iter().any(|s| s.kind.is_delta_import()) {
                return true;
            }
            if self.inner.settings.sync_lock_for_shared_store_export
                && steps.iter().any(|s| s.kind.is_export())
            {
                return true;
            }
        }
        false
    }

    async fn take_locks_and_execute(
        &self,
        name: &str,
        steps: &[StepDefinition],
        exclusive: bool,
        job: &CancellationToken,
    ) -> Result<(), ExecutionError> {
        let config = self.configuration();
        let locks = &self.inner.coordination.locks;
        let plan = LockPlan {
            exclusive,
            sync_step: self.requires_sync_lock(steps),
            dependencies: locks.resolve_dependencies(self.inner.identity.id, &config.lock_agents),
            stagger: self.inner.settings.execution_stagger_interval(),
        };

        if exclusive {
            self.log_info(format!("Entering exclusive mode for {name}"));
        }
        self.set_message("Waiting to take lock");

        let held = locks.acquire(self.inner.identity.id, &plan, job).await?;
        self.publish_locks(Some(&held));

        let result = self.execute(name, steps, job).await;

        drop(held);
        self.publish_locks(None);
        result
    }

    async fn execute(
        &self,
        name: &str,
        steps: &[StepDefinition],
        job: &CancellationToken,
    ) -> Result<(), ExecutionError> {
        self.reset_import_timers(steps);

        let engine = &self.inner.engine;
        let mut attempt = 0u32;
        let mut last: Option<RunResult> = None;

        loop {
            attempt += 1;
            self.set_state(ExecutionState::Running, Some("Executing"));
            self.log_info(format!("Executing {name}"));

            let code = match engine.execute_run_profile(name, job).await {
                Ok(code) => code,
                Err(ExecutionError::Failed { code }) => code,
                Err(err) => return Err(err),
            };
            if job.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }

            self.log_info(format!("{name} returned {code}"));
            self.set_state(ExecutionState::Processing, Some("Evaluating run results"));

            sleep_or_cancel(self.inner.settings.post_run_interval(), job).await?;

            // A failed start may leave an already processed run as the latest.
            if let Some(run) = engine.last_run().await? {
                self.inner.status.run_complete(&run);
                if self.observe_run(run.run_number) {
                    last = Some(run);
                } else {
                    tracing::trace!(agent = %self.agent_name(), run_number = run.run_number, "engine recorded no new run");
                }
            }

            match self.inner.retry.decide(&code, attempt) {
                RetryDecision::Retry { delay } => {
                    tracing::trace!(agent = %self.agent_name(), attempt, ?delay, "operation is retryable");
                    self.set_state(ExecutionState::Waiting, Some("Waiting to retry operation"));
                    sleep_or_cancel(delay, job).await?;
                    self.log_info("Retrying operation");
                }
                RetryDecision::Exhausted => {
                    self.log_info(format!(
                        "Aborting run profile after {attempt} attempt{}",
                        if attempt == 1 { "" } else { "s" }
                    ));
                    break;
                }
                RetryDecision::NotRetryable => {
                    tracing::trace!(agent = %self.agent_name(), code = %code, "result code is not retryable");
                    break;
                }
            }
        }

        match last {
            Some(run) => self.post_run_actions(run).await,
            None => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Post-run actions and follow-up work
    // -----------------------------------------------------------------------

    /// Callers have already checked that `run` is newer than anything processed.
    async fn post_run_actions(&self, run: RunResult) -> Result<(), ExecutionError> {
        self.try_send_mail(&run).await;

        match self
            .inner
            .policy
            .execution_complete(self.agent_name(), &run)
            .await?
        {
            PostRunVerdict::Continue => {}
            PostRunVerdict::StopController => {
                self.log_warn("Post-run policy stopped this controller");
                self.request_self_stop();
                return Ok(());
            }
        }

        self.queue_follow_ups(&run);
        Ok(())
    }

    async fn try_send_mail(&self, run: &RunResult) {
        if !self.inner.mail_gate.should_send(run) {
            return;
        }
        let agent = self.agent_name().as_str();
        let subject = mail::subject(agent, run);
        let body = mail::body(agent, run);
        if let Err(err) = self.inner.mail.send(&subject, &body).await {
            self.log_error(format!("Send mail failed: {err}"));
        }
    }

    fn queue_follow_ups(&self, run: &RunResult) {
        let followups = followup::derive(run);
        let source = run.run_profile_name.as_str();

        for index in &followups.skipped_steps {
            self.log_warn(format!(
                "Step {} of run profile {source} has no partition",
                index + 1
            ));
        }

        for partition in &followups.confirming_imports {
            let request = ExecutionRequest::for_role(ProfileRole::ConfirmingImport).in_partition(*partition);
            self.enqueue(&request, source, true);
        }

        for partition in &followups.delta_syncs {
            let request = ExecutionRequest::for_role(ProfileRole::DeltaSync).in_partition(*partition);
            self.enqueue(&request, source, true);
        }

        for target in &followups.sync_targets {
            tracing::trace!(agent = %self.agent_name(), target = %target, "sending outbound change notification");
            self.inner.coordination.bus.publish(SyncComplete {
                sending_agent: self.agent_name().clone(),
                target_agent: *target,
            });
        }
    }

    /// Record `run_number`; `true` when it is newer than anything seen so far.
    fn observe_run(&self, run_number: u64) -> bool {
        let mut last = lock(&self.inner.last_run_number);
        match *last {
            Some(seen) if seen >= run_number => false,
            _ => {
                *last = Some(run_number);
                true
            }
        }
    }

    // -----------------------------------------------------------------------
    // Unmanaged runs and changes
    // -----------------------------------------------------------------------

    /// Wait for a run started outside this controller, then treat its result
    /// like one of ours.
    async fn wait_on_unmanaged_run(&self, cancel: &CancellationToken) -> Result<(), ExecutionError> {
        let engine = &self.inner.engine;
        if engine.is_idle().await {
            return Ok(());
        }
        let Some(name) = engine.executing_profile_name().await else {
            return Ok(());
        };

        self.inner.status.update(|s| {
            s.execution_state = ExecutionState::Running;
            s.message = Some("Unmanaged run in progress".to_string());
            s.executing_run_profile = Some(name.clone());
        });

        let job = self.begin_job(cancel);
        let result = self.follow_unmanaged_run(&name, &job).await;
        self.end_job();

        tracing::trace!(agent = %self.agent_name(), "unmanaged run complete");
        self.set_idle();
        result
    }

    async fn follow_unmanaged_run(&self, name: &str, job: &CancellationToken) -> Result<(), ExecutionError> {
        let locks = &self.inner.coordination.locks;
        let steps = self.inner.engine.run_profile_steps(name);

        // Same order as a managed run: sync-step before the local gate.
        let sync_step = if steps.iter().any(|s| s.kind.is_sync()) {
            tracing::trace!(agent = %self.agent_name(), "getting sync lock for unmanaged run");
            Some(locks.sync_step().take(job).await?)
        } else {
            None
        };
        let local = match locks.local(self.inner.identity.id) {
            Some(gate) => Some(gate.take(job).await?),
            None => None,
        };
        let mut held = LockSet::unmanaged(sync_step, local);
        self.publish_locks(Some(&held));

        self.log_info(format!("Waiting on unmanaged run {name} to finish"));
        let waited = self.inner.engine.wait(job).await;
        held.release_sync_step();
        self.publish_locks(Some(&held));
        waited?;

        self.set_state(ExecutionState::Processing, Some("Evaluating run results"));
        if job.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        if let Some(run) = self.inner.engine.last_run().await? {
            self.inner.status.run_complete(&run);
            if self.observe_run(run.run_number) {
                self.post_run_actions(run).await?;
            }
        }
        Ok(())
    }

    /// Queue work for changes made by runs this controller never processed.
    async fn scan_unmanaged_changes(&self, cancel: &CancellationToken) {
        let locks = &self.inner.coordination.locks;
        let _local = match locks.local(self.inner.identity.id) {
            Some(gate) => match gate.take(cancel).await {
                Ok(guard) => Some(guard),
                Err(_) => return,
            },
            None => None,
        };

        tracing::trace!(agent = %self.agent_name(), "checking for unmanaged changes");
        let run = match self.inner.engine.last_run().await {
            Ok(Some(run)) => run,
            Ok(None) => return,
            Err(err) => {
                self.log_warn(format!("Unable to read the last run: {err}"));
                return;
            }
        };

        let previous = self.last_run_number();
        if !self.observe_run(run.run_number) {
            return;
        }
        tracing::trace!(
            agent = %self.agent_name(),
            last_recorded = ?previous,
            last_engine = run.run_number,
            "unprocessed changes detected"
        );

        for partition in self.partitions_requiring(self.inner.engine.pending_export_objects()) {
            let request = ExecutionRequest::for_role(ProfileRole::Export).in_partition(partition);
            self.enqueue(&request, "Pending export check", false);
        }

        for step in run.steps.iter().filter(|s| s.has_unconfirmed_exports()) {
            if let Some(partition) = step.partition() {
                let request =
                    ExecutionRequest::for_role(ProfileRole::ConfirmingImport).in_partition(partition);
                self.enqueue(&request, "Unconfirmed export check", false);
            }
        }

        for partition in self.partitions_requiring(self.inner.engine.pending_import_objects()) {
            let request = ExecutionRequest::for_role(ProfileRole::DeltaSync).in_partition(partition);
            self.enqueue(&request, "Staged import check", false);
        }
    }

    fn partitions_requiring(&self, objects: PendingObjects) -> Vec<PartitionId> {
        let config = self.configuration();
        let active: Vec<PartitionId> = config.active_partitions().map(|p| p.id).collect();
        let mode = DetectionMode::for_active_partitions(active.len());
        detection::partitions_requiring(mode, &active, objects)
    }

    fn handle_sync_complete(&self, event: SyncComplete) {
        tracing::trace!(agent = %self.agent_name(), sender = %event.sending_agent, "got sync complete message");
        let source = format!("Synchronization on {}", event.sending_agent);
        for partition in self.partitions_requiring(self.inner.engine.pending_export_objects()) {
            let request = ExecutionRequest::for_role(ProfileRole::Export).in_partition(partition);
            self.enqueue(&request, &source, false);
        }
    }

    // -----------------------------------------------------------------------
    // Triggers, listeners and timers
    // -----------------------------------------------------------------------

    /// Start every trigger unless the controller is already stopping.
    ///
    /// `stop` cancels before it takes the trigger lock, so a cancellation
    /// seen here, before or after starting, means nobody else will stop
    /// what this call started.
    async fn start_triggers(&self, notices: &mpsc::UnboundedSender<TriggerNotice>, cancel: &CancellationToken) {
        let mut triggers = self.inner.triggers.lock().await;
        if cancel.is_cancelled() {
            return;
        }
        for trigger in triggers.iter_mut() {
            let name = trigger.display_name();
            self.log_info(format!("Registering execution trigger '{name}'"));
            let context = TriggerContext::new(self.agent_name().clone(), name.clone(), notices.clone());
            if let Err(err) = trigger.start(context).await {
                self.log_error(format!("Could not start execution trigger {name}: {err}"));
            }
        }
        if cancel.is_cancelled() {
            for trigger in triggers.iter_mut() {
                trigger.stop().await;
            }
        }
    }

    async fn stop_triggers(&self) {
        let mut triggers = self.inner.triggers.lock().await;
        for trigger in triggers.iter_mut() {
            self.log_info(format!("Unregistering execution trigger '{}'", trigger.display_name()));
            trigger.stop().await;
        }
    }

    fn spawn_trigger_listener(
        &self,
        mut notices: mpsc::UnboundedReceiver<TriggerNotice>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let notice = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    notice = notices.recv() => match notice {
                        Some(notice) => notice,
                        None => break,
                    },
                };
                let Some(controller) = Controller::from_weak(&weak) else { break };
                controller.handle_trigger_notice(notice);
            }
        })
    }

    fn handle_trigger_notice(&self, notice: TriggerNotice) {
        match notice.event {
            TriggerEvent::Fired(request) => {
                if request.explicit_name().is_none() && request.role.is_none() {
                    self.log_warn(format!("Received empty run profile from trigger {}", notice.trigger));
                    return;
                }
                self.enqueue(&request, &notice.trigger, false);
            }
            TriggerEvent::Message(message) => self.log_info(format!("{}: {message}", notice.trigger)),
            TriggerEvent::Error(message) => self.log_error(format!("{}: {message}", notice.trigger)),
        }
    }

    fn spawn_bus_listener(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let me = self.inner.identity.id;
        let mut subscription = self.inner.coordination.bus.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = subscription.recv_for(me) => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(controller) = Controller::from_weak(&weak) else { break };
                controller.handle_sync_complete(event);
            }
            subscription.unsubscribe();
        })
    }

    fn start_timers(&self, cancel: &CancellationToken, scan_tx: mpsc::Sender<()>) {
        let config = self.configuration();
        let agent = self.agent_name().to_string();
        let mut import_timers = HashMap::new();

        for partition in config.active_partitions().filter(|p| p.auto_import_enabled) {
            if partition.run_profile_for(ProfileRole::ScheduledImport).is_none() {
                self.log_warn(format!(
                    "Auto import is enabled on partition {} but no scheduled import run profile is configured",
                    partition.name
                ));
                continue;
            }

            let weak = Arc::downgrade(&self.inner);
            let request = ExecutionRequest::for_role(ProfileRole::ScheduledImport).in_partition(partition.id);
            let source = format!("Import timer on {}", partition.name);
            let interval = partition.auto_import_interval();
            let timer = RecurringTimer::start(
                format!("{agent}:import:{}", partition.name),
                TimerSpec::staggered(interval),
                cancel,
                move || {
                    let weak = weak.clone();
                    let request = request.clone();
                    let source = source.clone();
                    async move {
                        if let Some(controller) = Controller::from_weak(&weak) {
                            if controller.control_state() == ControlState::Running {
                                controller.enqueue(&request, &source, false);
                            }
                        }
                    }
                },
            );
            tracing::trace!(agent = %agent, partition = %partition.name, ?interval, "initialized import timer");
            import_timers.insert(partition.id, timer);
        }

        let weak = Arc::downgrade(&self.inner);
        let unmanaged = RecurringTimer::start(
            format!("{agent}:unmanaged-changes"),
            TimerSpec::jittered(self.inner.settings.unmanaged_changes_check_interval()),
            cancel,
            move || {
                let weak = weak.clone();
                let scan_tx = scan_tx.clone();
                async move {
                    let Some(controller) = Controller::from_weak(&weak) else { return };
                    if controller.control_state() != ControlState::Running {
                        return;
                    }
                    if scan_tx.try_send(()).is_err() {
                        tracing::trace!(agent = %controller.agent_name(), "unmanaged change scan already pending");
                    }
                }
            },
        );

        if let Some(active) = lock(&self.inner.active).as_mut() {
            active.import_timers = import_timers;
            active.timers.push(unmanaged);
        }
    }

    fn reset_import_timers(&self, steps: &[StepDefinition]) {
        let active = lock(&self.inner.active);
        let Some(active) = active.as_ref() else { return };
        for step in steps.iter().filter(|s| s.kind.is_import()) {
            if let Some(timer) = step.partition.and_then(|p| active.import_timers.get(&p)) {
                tracing::trace!(agent = %self.agent_name(), timer = %timer.name(), "import step detected, resetting timer");
                timer.reset();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Status helpers
    // -----------------------------------------------------------------------

    fn set_control_state(&self, state: ControlState) {
        self.inner.status.update(|s| s.control_state = state);
    }

    fn set_state(&self, state: ExecutionState, message: Option<&str>) {
        self.inner.status.update(|s| {
            s.execution_state = state;
            s.message = message.map(str::to_string);
        });
    }

    fn set_message(&self, message: &str) {
        self.inner.status.update(|s| s.message = Some(message.to_string()));
    }

    fn set_idle(&self) {
        let queue = self.inner.queue.display(None);
        self.inner.status.update(|s| {
            s.execution_state = ExecutionState::Idle;
            s.message = None;
            s.executing_run_profile = None;
            s.execution_queue = queue;
        });
    }

    fn publish_locks(&self, held: Option<&LockSet>) {
        self.inner.status.update(|s| {
            s.has_sync_lock = held.map(LockSet::has_sync_lock).unwrap_or(false);
            s.has_exclusive_lock = held.map(LockSet::has_exclusive_lock).unwrap_or(false);
            s.has_foreign_lock = held.map(LockSet::has_foreign_lock).unwrap_or(false);
        });
    }

    fn publish_queue(&self) {
        let queue = self.inner.queue.display(None);
        self.inner.status.update(|s| s.execution_queue = queue);
    }

    fn log_info(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::info!(agent = %self.agent_name(), "{message}");
        self.inner.status.message_logged(message);
    }

    fn log_warn(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::warn!(agent = %self.agent_name(), "{message}");
        self.inner.status.message_logged(message);
    }

    fn log_error(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::error!(agent = %self.agent_name(), "{message}");
        self.inner.status.message_logged(message);
    }
}

async fn sleep_or_cancel(
    duration: std::time::Duration,
    cancel: &CancellationToken,
) -> Result<(), ExecutionError> {
    if duration.is_zero() {
        return if cancel.is_cancelled() {
            Err(ExecutionError::Cancelled)
        } else {
            Ok(())
        };
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
