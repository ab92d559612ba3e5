//! Best-effort run notifications by mail.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use autosync_core::{MailSettings, RunResult};

use crate::error::MailError;

#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, subject: &str, body: &str) -> Result<(), MailError>;
}

/// Sender used when no mail transport is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMail;

#[async_trait]
impl MailSender for NoMail {
    async fn send(&self, _subject: &str, _body: &str) -> Result<(), MailError> {
        Ok(())
    }
}

/// Decides whether a finished run is worth a mail.
///
/// Remembers the last status per run profile so repeated identical results
/// only produce one mail unless `send_all_error_instances` is set.
#[derive(Debug)]
pub struct MailGate {
    settings: MailSettings,
    last_status: Mutex<HashMap<String, String>>,
}

impl MailGate {
    pub fn new(settings: MailSettings) -> Self {
        Self {
            settings,
            last_status: Mutex::new(HashMap::new()),
        }
    }

    pub fn should_send(&self, result: &RunResult) -> bool {
        let key = result.run_profile_name.to_ascii_lowercase();
        let status = result.last_step_status.as_str();

        let previous = {
            let mut last = self
                .last_status
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            last.insert(key, status.to_string())
        };

        let repeated = previous
            .as_deref()
            .map(|p| p.eq_ignore_ascii_case(status))
            .unwrap_or(false);
        if repeated && !self.settings.send_all_error_instances {
            return false;
        }

        self.settings.enabled && !self.settings.ignores(status)
    }

    pub fn reset(&self) {
        self.last_status
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}

pub fn subject(agent: &str, result: &RunResult) -> String {
    format!(
        "{agent} {}: {}",
        result.run_profile_name, result.last_step_status
    )
}

pub fn body(agent: &str, result: &RunResult) -> String {
    let mut body = format!(
        "Agent: {agent}\nRun profile: {}\nRun number: {}\nStatus: {}\n",
        result.run_profile_name, result.run_number, result.last_step_status
    );
    if let Some(start) = result.start_time {
        body.push_str(&format!("Started: {}\n", start.to_rfc3339()));
    }
    if let Some(end) = result.end_time {
        body.push_str(&format!("Finished: {}\n", end.to_rfc3339()));
    }

    for (index, step) in result.steps.iter().enumerate() {
        body.push_str(&format!("\nStep {}: {:?}", index + 1, step.kind()));
        if let Some(partition) = step.partition() {
            body.push_str(&format!(" on {partition}"));
        }
        body.push('\n');
        if let Some(staged) = step.staging_counters.filter(|c| c.has_changes()) {
            body.push_str(&format!("  staged changes: {}\n", staged.total()));
        }
        if let Some(exports) = step.export_counters.filter(|c| c.has_changes()) {
            body.push_str(&format!("  unconfirmed exports: {}\n", exports.total()));
        }
        for flow in step.outbound_flows.iter().filter(|f| f.has_changes()) {
            body.push_str(&format!("  outbound changes for {}\n", flow.target_agent_name));
        }
    }
    body
}
