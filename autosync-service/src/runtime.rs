use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use autosync_controller::{
    Controller, Coordination, ExecutionEngine, LockRegistry, MailSender, NoMail, NoopPolicy,
    NotificationBus, PostRunPolicy, ServiceStopRequest,
};
use autosync_core::{config, AgentIdentity, ControlState, ControllerStatus, ServiceConfig};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::error::{io_err, ServiceError};

/// Connects agent names to their execution engines.
pub trait EngineProvider: Send + Sync {
    /// Resolve `agent_name` to the engine-side identity and an engine handle.
    fn connect(
        &self,
        agent_name: &str,
    ) -> Result<(AgentIdentity, Arc<dyn ExecutionEngine>), ServiceError>;
}

pub struct ServiceBuilder {
    config: ServiceConfig,
    policy: Arc<dyn PostRunPolicy>,
    mail: Arc<dyn MailSender>,
}

impl ServiceBuilder {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            policy: Arc::new(NoopPolicy),
            mail: Arc::new(NoMail),
        }
    }

    /// Start from the configuration file under `home`.
    pub fn from_home(home: &Path) -> Result<Self, ServiceError> {
        Ok(Self::new(config::load_at(home)?))
    }

    pub fn policy(mut self, policy: Arc<dyn PostRunPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn mail_sender(mut self, mail: Arc<dyn MailSender>) -> Self {
        self.mail = mail;
        self
    }

    /// Connect every configured agent and build its controller.
    ///
    /// All agents are registered with the lock registry before the first
    /// controller is created, so lock dependencies between them resolve
    /// regardless of configuration order.
    pub fn build(self, provider: &dyn EngineProvider) -> Result<AutoSyncService, ServiceError> {
        self.config.validate()?;

        let (escalation_tx, escalation_rx) = mpsc::unbounded_channel();
        let coordination = Coordination::new(LockRegistry::new(), NotificationBus::new())
            .with_escalation(escalation_tx);

        let mut connected = Vec::with_capacity(self.config.agents.len());
        for agent in &self.config.agents {
            let (identity, engine) = provider.connect(&agent.agent_name)?;
            coordination.locks.register(&identity);
            connected.push((identity, engine));
        }

        for agent in &self.config.agents {
            for dependency in &agent.lock_agents {
                if coordination.locks.find_agent(dependency).is_none() {
                    tracing::warn!(
                        agent = %agent.agent_name,
                        dependency = %dependency,
                        "lock agent is not a managed agent and will be ignored"
                    );
                }
            }
        }

        let ServiceConfig { settings, agents } = self.config;
        let mut controllers = Vec::with_capacity(agents.len());
        for (agent, (identity, engine)) in agents.into_iter().zip(connected) {
            let triggers = autosync_triggers::build_all(&agent.triggers)?;
            let controller = Controller::builder(identity, agent, engine, coordination.clone())
                .settings(settings.clone())
                .policy(Arc::clone(&self.policy))
                .mail_sender(Arc::clone(&self.mail))
                .triggers(triggers)
                .build();
            tracing::debug!(agent = %controller.agent_name(), "controller created");
            controllers.push(controller);
        }

        Ok(AutoSyncService {
            coordination,
            controllers,
            escalation: Some(escalation_rx),
        })
    }
}

/// Hosts one controller per managed agent.
pub struct AutoSyncService {
    coordination: Coordination,
    controllers: Vec<Controller>,
    escalation: Option<mpsc::UnboundedReceiver<ServiceStopRequest>>,
}

impl AutoSyncService {
    pub fn builder(config: ServiceConfig) -> ServiceBuilder {
        ServiceBuilder::new(config)
    }

    pub fn coordination(&self) -> &Coordination {
        &self.coordination
    }

    pub fn controllers(&self) -> &[Controller] {
        &self.controllers
    }

    pub fn controller(&self, agent_name: &str) -> Option<&Controller> {
        self.controllers
            .iter()
            .find(|c| c.agent_name().matches(agent_name))
    }

    /// Start every controller. Failures are logged and the first is returned
    /// after all controllers have been attempted.
    pub async fn start_all(&self) -> Result<(), ServiceError> {
        let mut first_error = None;
        for controller in &self.controllers {
            if let Err(err) = controller.start().await {
                tracing::error!(agent = %controller.agent_name(), error = %err, "controller failed to start");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Stop every controller concurrently. Each stop is bounded by the
    /// controller's own stop timeout.
    pub async fn stop_all(&self, cancel_runs: bool) {
        let mut tasks = JoinSet::new();
        for controller in &self.controllers {
            let controller = controller.clone();
            tasks.spawn(async move { controller.stop(cancel_runs).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "controller stop task failed");
            }
        }
        tracing::info!("all controllers stopped");
    }

    pub fn statuses(&self) -> Vec<ControllerStatus> {
        self.controllers.iter().map(Controller::status).collect()
    }

    pub fn status_payload(&self) -> Value {
        let agents: Vec<Value> = self
            .controllers
            .iter()
            .map(|c| {
                json!({
                    "status": c.status(),
                    "queue": c.queue_display(),
                    "last_run_number": c.last_run_number(),
                })
            })
            .collect();
        let running = self
            .controllers
            .iter()
            .filter(|c| c.control_state() == ControlState::Running)
            .count();
        json!({
            "running": running,
            "total": self.controllers.len(),
            "agents": agents,
        })
    }

    /// Start all controllers and run until `shutdown` resolves or a
    /// controller asks for the whole service to stop. Controllers are always
    /// stopped before returning.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<(), ServiceError>
    where
        F: Future<Output = Result<(), ServiceError>>,
    {
        let mut escalation = self
            .escalation
            .take()
            .ok_or_else(|| ServiceError::Task("service is already running".to_string()))?;

        if let Err(err) = self.start_all().await {
            tracing::warn!(error = %err, "continuing with the controllers that started");
        }
        tracing::info!(controllers = self.controllers.len(), "service running");

        let outcome = tokio::select! {
            result = shutdown => result,
            Some(request) = escalation.recv() => {
                tracing::error!(
                    agent = %request.agent_name,
                    message = %request.change.message,
                    "controller requested service stop"
                );
                Err(ServiceError::ShutdownRequested {
                    agent: request.agent_name,
                    message: request.change.message,
                })
            }
        };

        self.stop_all(false).await;
        self.escalation = Some(escalation);
        outcome
    }

    /// [`run_until`](Self::run_until) Ctrl-C.
    pub async fn run_until_shutdown(&mut self) -> Result<(), ServiceError> {
        self.run_until(async {
            tokio::signal::ctrl_c()
                .await
                .map_err(|e| io_err("ctrl-c handler", e))?;
            tracing::info!("received ctrl-c, shutting down service");
            Ok::<(), ServiceError>(())
        })
        .await
    }
}

/// Load configuration from `home`, build every controller and run until
/// Ctrl-C or an escalated stop.
pub async fn run(home: &Path, provider: &dyn EngineProvider) -> Result<(), ServiceError> {
    let mut service = ServiceBuilder::from_home(home)?.build(provider)?;
    service.run_until_shutdown().await
}

/// Blocking entry point for hosts without their own runtime.
pub fn start_blocking(home: &Path, provider: &dyn EngineProvider) -> Result<(), ServiceError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home, provider))
}

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
