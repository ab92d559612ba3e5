//! Open/held gates with guaranteed release.
//!
//! A gate is either OPEN or HELD. Waiters are woken on release and also
//! re-check every [`POLL_INTERVAL`], so cancellation and missed wake-ups are
//! both observed within a bounded delay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutionError;

/// Upper bound between re-checks of a contended gate.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct Gate {
    name: String,
    held: AtomicBool,
    notify: Notify,
}

impl Gate {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            held: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        !self.held.load(Ordering::SeqCst)
    }

    fn try_take(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Take the gate, waiting while another holder has it.
    pub async fn take(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<GateGuard, ExecutionError> {
        tracing::trace!(gate = %self.name, "WAIT");
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }
            if self.try_take() {
                tracing::trace!(gate = %self.name, "TAKE");
                return Ok(GateGuard {
                    gate: Arc::clone(self),
                });
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
                _ = &mut notified => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    /// Wait until the gate is open without taking it.
    pub async fn wait_open(&self, cancel: &CancellationToken) -> Result<(), ExecutionError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }
            if self.is_open() {
                tracing::trace!(gate = %self.name, "CLEARED");
                return Ok(());
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
                _ = &mut notified => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }
}

/// Proof of holding a gate. Dropping it re-opens the gate.
#[derive(Debug)]
pub struct GateGuard {
    gate: Arc<Gate>,
}

impl GateGuard {
    pub fn gate_name(&self) -> &str {
        self.gate.name()
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        tracing::trace!(gate = %self.gate.name, "RELEASE");
        self.gate.release();
    }
}
