//! Retry classification and backoff.

use std::collections::BTreeSet;
use std::time::Duration;

use autosync_core::Settings;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep `delay`, then make another attempt.
    Retry { delay: Duration },
    /// Retryable, but the limit has been reached.
    Exhausted,
    NotRetryable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    codes: BTreeSet<String>,
    /// Retries after the first attempt. Negative means unlimited.
    limit: i32,
    base: Duration,
}

impl RetryPolicy {
    pub fn new<I, S>(codes: I, limit: i32, base: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            codes: codes
                .into_iter()
                .map(|c| c.as_ref().to_ascii_lowercase())
                .collect(),
            limit,
            base,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            &settings.retry_codes,
            settings.retry_count,
            settings.retry_sleep_interval(),
        )
    }

    pub fn is_retryable(&self, code: &str) -> bool {
        self.codes.contains(&code.to_ascii_lowercase())
    }

    /// `attempt` is 1-based: the number of attempts already made.
    pub fn decide(&self, code: &str, attempt: u32) -> RetryDecision {
        if !self.is_retryable(code) {
            return RetryDecision::NotRetryable;
        }
        if self.limit >= 0 && i64::from(attempt) > i64::from(self.limit) {
            return RetryDecision::Exhausted;
        }
        RetryDecision::Retry {
            delay: self.backoff(attempt),
        }
    }

    /// `base × attempt` plus up to a tenth of `base` of jitter.
    ///
    /// The jitter never exceeds one `base` step, so delays are strictly
    /// increasing in `attempt` whenever `base` is non-zero.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let scaled = self.base.saturating_mul(attempt.max(1));
        let spread = (self.base / 10).as_millis() as u64;
        if spread == 0 {
            return scaled;
        }
        let jitter = rand::thread_rng().gen_range(0..spread);
        scaled.saturating_add(Duration::from_millis(jitter))
    }
}
