//! Process-wide lock registry and the fixed acquisition protocol.
//!
//! One registry instance is shared by every controller in the service. It
//! holds a local gate per registered agent plus three global gates:
//!
//! - `exclusive`: held by a run that must not overlap any other agent
//! - `sync-step`: serializes runs containing synchronization steps
//! - `stagger`: held only for the stagger sleep, serializes run *starts*
//!
//! Acquisition order (identical for every controller):
//!
//! 1. wait for `exclusive` to be open
//! 2. exclusive requests take `exclusive`, then wait for every local gate to open
//! 3. take `sync-step` when the profile needs it
//! 4. take the agent's own local gate
//! 5. take every foreign dependency's local gate, concurrently
//! 6. take `stagger`, sleep, release `stagger`
//!
//! Release order is own local, sync-step, exclusive, then foreign gates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use autosync_core::{AgentId, AgentIdentity, AgentName};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutionError;
use crate::gate::{Gate, GateGuard};

#[derive(Debug)]
struct AgentEntry {
    name: AgentName,
    gate: Arc<Gate>,
}

/// Shared coordination state for all controllers.
#[derive(Debug)]
pub struct LockRegistry {
    exclusive: Arc<Gate>,
    sync_step: Arc<Gate>,
    stagger: Arc<Gate>,
    agents: Mutex<HashMap<AgentId, AgentEntry>>,
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self {
            exclusive: Gate::new("exclusive"),
            sync_step: Gate::new("sync-step"),
            stagger: Gate::new("stagger"),
            agents: Mutex::new(HashMap::new()),
        }
    }
}

/// What a single run needs from the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockPlan {
    pub exclusive: bool,
    pub sync_step: bool,
    /// Agents whose local gates must also be held. Self is skipped.
    pub dependencies: Vec<AgentId>,
    pub stagger: Duration,
}

impl LockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn exclusive(&self) -> &Arc<Gate> {
        &self.exclusive
    }

    pub fn sync_step(&self) -> &Arc<Gate> {
        &self.sync_step
    }

    pub fn stagger(&self) -> &Arc<Gate> {
        &self.stagger
    }

    /// Register an agent, creating its local gate on first use.
    pub fn register(&self, agent: &AgentIdentity) -> Arc<Gate> {
        let mut agents = self.agents.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = agents.entry(agent.id).or_insert_with(|| AgentEntry {
            name: agent.name.clone(),
            gate: Gate::new(format!("local:{}", agent.name)),
        });
        Arc::clone(&entry.gate)
    }

    pub fn local(&self, id: AgentId) -> Option<Arc<Gate>> {
        let agents = self.agents.lock().unwrap_or_else(PoisonError::into_inner);
        agents.get(&id).map(|entry| Arc::clone(&entry.gate))
    }

    /// Look up a registered agent by name (case-insensitive).
    pub fn find_agent(&self, name: &str) -> Option<AgentId> {
        let agents = self.agents.lock().unwrap_or_else(PoisonError::into_inner);
        agents
            .iter()
            .find(|(_, entry)| entry.name.matches(name))
            .map(|(id, _)| *id)
    }

    /// Resolve configured dependency names to registered agent IDs.
    ///
    /// Unknown names are logged and skipped; `me` is never returned.
    pub fn resolve_dependencies(&self, me: AgentId, names: &[String]) -> Vec<AgentId> {
        let mut ids = Vec::new();
        for name in names {
            match self.find_agent(name) {
                Some(id) if id == me => {}
                Some(id) => {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
                None => {
                    tracing::warn!(dependency = %name, "lock dependency names an unregistered agent");
                }
            }
        }
        ids
    }

    fn all_local_gates(&self) -> Vec<Arc<Gate>> {
        let agents = self.agents.lock().unwrap_or_else(PoisonError::into_inner);
        agents.values().map(|entry| Arc::clone(&entry.gate)).collect()
    }

    /// Wait until no agent holds its local gate.
    pub async fn wait_all_local_open(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutionError> {
        for gate in self.all_local_gates() {
            gate.wait_open(cancel).await?;
        }
        Ok(())
    }

    /// Run the acquisition protocol for `me`.
    ///
    /// On error every gate taken so far has already been released.
    pub async fn acquire(
        &self,
        me: AgentId,
        plan: &LockPlan,
        cancel: &CancellationToken,
    ) -> Result<LockSet, ExecutionError> {
        let mut set = loop {
            let mut set = LockSet::default();

            self.exclusive.wait_open(cancel).await?;

            if plan.exclusive {
                set.exclusive = Some(self.exclusive.take(cancel).await?);
                self.wait_all_local_open(cancel).await?;
            }

            if plan.sync_step {
                set.sync_step = Some(self.sync_step.take(cancel).await?);
            }

            if let Some(own) = self.local(me) {
                set.local = Some(own.take(cancel).await?);
            }

            // An exclusive run may have started between step 1 and taking the
            // local gate; it will be waiting on that gate, so back off.
            if plan.exclusive || self.exclusive.is_open() {
                break set;
            }
            tracing::trace!(agent = %me, "exclusive lock taken during acquisition, retrying");
        };

        let foreign: Vec<Arc<Gate>> = plan
            .dependencies
            .iter()
            .filter(|id| **id != me)
            .filter_map(|id| self.local(*id))
            .collect();
        if !foreign.is_empty() {
            set.foreign = take_concurrently(foreign, cancel).await?;
        }

        let stagger = self.stagger.take(cancel).await?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
            _ = tokio::time::sleep(plan.stagger) => {}
        }
        drop(stagger);

        Ok(set)
    }
}

async fn take_concurrently(
    gates: Vec<Arc<Gate>>,
    cancel: &CancellationToken,
) -> Result<Vec<GateGuard>, ExecutionError> {
    let mut tasks = JoinSet::new();
    for gate in gates {
        let cancel = cancel.clone();
        tasks.spawn(async move { gate.take(&cancel).await });
    }

    let mut guards = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(guard)) => guards.push(guard),
            Ok(Err(err)) => return Err(err),
            Err(err) => {
                return Err(ExecutionError::Engine(format!(
                    "foreign lock task failed: {err}"
                )))
            }
        }
    }
    Ok(guards)
}

/// Every gate one run holds. Dropping it releases them in protocol order.
#[derive(Debug, Default)]
pub struct LockSet {
    local: Option<GateGuard>,
    sync_step: Option<GateGuard>,
    exclusive: Option<GateGuard>,
    foreign: Vec<GateGuard>,
}

impl LockSet {
    /// Gates held while following a run this controller did not start.
    /// The caller takes `sync_step` before `local`.
    pub fn unmanaged(sync_step: Option<GateGuard>, local: Option<GateGuard>) -> Self {
        Self {
            local,
            sync_step,
            exclusive: None,
            foreign: Vec::new(),
        }
    }

    pub fn release_sync_step(&mut self) {
        drop(self.sync_step.take());
    }

    pub fn has_sync_lock(&self) -> bool {
        self.sync_step.is_some()
    }

    pub fn has_exclusive_lock(&self) -> bool {
        self.exclusive.is_some()
    }

    pub fn has_foreign_lock(&self) -> bool {
        !self.foreign.is_empty()
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        drop(self.local.take());
        drop(self.sync_step.take());
        drop(self.exclusive.take());
        self.foreign.clear();
    }
}
