//! Pluggable post-run policy.

use async_trait::async_trait;
use autosync_core::{AgentName, RunResult};

use crate::error::UnexpectedChange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostRunVerdict {
    /// Derive and queue follow-up work as usual.
    Continue,
    /// Stop the controller; no follow-up work is queued.
    StopController,
}

#[async_trait]
pub trait PostRunPolicy: Send + Sync {
    /// Consulted before every dequeued request. `false` drops the request.
    async fn should_execute(&self, _agent: &AgentName, _run_profile: &str) -> bool {
        true
    }

    async fn execution_complete(
        &self,
        _agent: &AgentName,
        _result: &RunResult,
    ) -> Result<PostRunVerdict, UnexpectedChange> {
        Ok(PostRunVerdict::Continue)
    }
}

/// Policy that allows everything and never stops.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPolicy;

impl PostRunPolicy for NoopPolicy {}
