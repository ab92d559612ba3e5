//! Service-wide tuning knobs shared by every controller.
//!
//! All fields have serde defaults so a configuration file only needs to name
//! what it overrides.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How aggressively requests are promoted to exclusive mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Requests keep the exclusive flag they were queued with.
    Unsupported,
    /// Requests for profiles containing a synchronization step run exclusively.
    #[default]
    Supported,
    /// Every request runs exclusively.
    Exclusive,
}

/// Outbound mail behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Send on every occurrence of a status, not only on transitions.
    #[serde(default)]
    pub send_all_error_instances: bool,
    /// Status codes that never produce mail (compared case-insensitively).
    #[serde(default = "default_mail_ignore_codes")]
    pub ignore_return_codes: Vec<String>,
}

fn default_mail_ignore_codes() -> Vec<String> {
    vec!["success".to_string()]
}

impl Default for MailSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            send_all_error_instances: false,
            ignore_return_codes: default_mail_ignore_codes(),
        }
    }
}

impl MailSettings {
    pub fn ignores(&self, status: &str) -> bool {
        self.ignore_return_codes
            .iter()
            .any(|code| code.eq_ignore_ascii_case(status))
    }
}

/// Settings applied to every controller in the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Terminal status codes that are worth retrying.
    #[serde(default = "default_retry_codes")]
    pub retry_codes: BTreeSet<String>,
    /// Maximum number of retries after the first attempt; negative = unlimited.
    #[serde(default = "default_retry_count")]
    pub retry_count: i32,
    #[serde(default = "default_retry_sleep_interval_ms")]
    pub retry_sleep_interval_ms: u64,
    #[serde(default = "default_execution_stagger_interval_ms")]
    pub execution_stagger_interval_ms: u64,
    #[serde(default = "default_post_run_interval_ms")]
    pub post_run_interval_ms: u64,
    #[serde(default = "default_unmanaged_changes_check_interval_secs")]
    pub unmanaged_changes_check_interval_secs: u64,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    #[serde(default)]
    pub run_mode: RunMode,
    /// Shared-store agents also take the sync-step lock for export steps.
    #[serde(default)]
    pub sync_lock_for_shared_store_export: bool,
    #[serde(default)]
    pub mail: MailSettings,
}

fn default_retry_codes() -> BTreeSet<String> {
    [
        "stopped-server-down",
        "stopped-connectivity",
        "stopped-deadlocked",
        "no-start-connection",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_retry_count() -> i32 {
    5
}

fn default_retry_sleep_interval_ms() -> u64 {
    30_000
}

fn default_execution_stagger_interval_ms() -> u64 {
    2_000
}

fn default_post_run_interval_ms() -> u64 {
    0
}

fn default_unmanaged_changes_check_interval_secs() -> u64 {
    3_600
}

fn default_stop_timeout_secs() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retry_codes: default_retry_codes(),
            retry_count: default_retry_count(),
            retry_sleep_interval_ms: default_retry_sleep_interval_ms(),
            execution_stagger_interval_ms: default_execution_stagger_interval_ms(),
            post_run_interval_ms: default_post_run_interval_ms(),
            unmanaged_changes_check_interval_secs: default_unmanaged_changes_check_interval_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            run_mode: RunMode::default(),
            sync_lock_for_shared_store_export: false,
            mail: MailSettings::default(),
        }
    }
}

impl Settings {
    pub fn retry_sleep_interval(&self) -> Duration {
        Duration::from_millis(self.retry_sleep_interval_ms)
    }

    pub fn execution_stagger_interval(&self) -> Duration {
        Duration::from_millis(self.execution_stagger_interval_ms)
    }

    pub fn post_run_interval(&self) -> Duration {
        Duration::from_millis(self.post_run_interval_ms)
    }

    pub fn unmanaged_changes_check_interval(&self) -> Duration {
        Duration::from_secs(self.unmanaged_changes_check_interval_secs.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}
