//! Fixed-interval trigger, optionally aligned to a start time.

use std::time::Duration;

use async_trait::async_trait;
use autosync_controller::{ExecutionTrigger, TriggerContext, TriggerError};
use autosync_core::ExecutionRequest;
use chrono::{DateTime, Utc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::TriggerTask;

#[derive(Debug)]
pub struct IntervalTrigger {
    run_profile_name: String,
    interval: Duration,
    start: Option<DateTime<Utc>>,
    exclusive: bool,
    task: Option<TriggerTask>,
}

impl IntervalTrigger {
    pub fn new(
        run_profile_name: impl Into<String>,
        interval: Duration,
        start: Option<DateTime<Utc>>,
        exclusive: bool,
    ) -> Result<Self, TriggerError> {
        let run_profile_name = run_profile_name.into();
        if run_profile_name.trim().is_empty() {
            return Err(TriggerError::Invalid(
                "interval trigger needs a run profile name".to_string(),
            ));
        }
        if interval.is_zero() {
            return Err(TriggerError::Invalid(format!(
                "interval trigger for {run_profile_name} has a zero interval"
            )));
        }
        Ok(Self {
            run_profile_name,
            interval,
            start,
            exclusive,
            task: None,
        })
    }

    fn request(&self) -> ExecutionRequest {
        let request = ExecutionRequest::named(&self.run_profile_name);
        if self.exclusive {
            request.exclusive()
        } else {
            request
        }
    }
}

/// Delay until the first tick.
///
/// Without a start time the first tick is one full interval away. With one,
/// ticks fall on `start + k * interval`.
pub fn first_delay(now: DateTime<Utc>, start: Option<DateTime<Utc>>, interval: Duration) -> Duration {
    let Some(start) = start else {
        return interval;
    };
    if start > now {
        return (start - now).to_std().unwrap_or(interval);
    }

    let period = interval.as_millis();
    if period == 0 {
        return interval;
    }
    let elapsed = (now - start).to_std().unwrap_or_default().as_millis();
    match elapsed % period {
        0 => Duration::ZERO,
        rem => Duration::from_millis((period - rem) as u64),
    }
}

#[async_trait]
impl ExecutionTrigger for IntervalTrigger {
    fn display_name(&self) -> String {
        format!(
            "Interval: {} every {}s",
            self.run_profile_name,
            self.interval.as_secs()
        )
    }

    async fn start(&mut self, context: TriggerContext) -> Result<(), TriggerError> {
        if self.task.is_some() {
            return Err(TriggerError::AlreadyStarted(self.display_name()));
        }

        let delay = first_delay(Utc::now(), self.start, self.interval);
        let mut ticker = tokio::time::interval_at(Instant::now() + delay, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let request = self.request();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tracing::debug!(
            agent = %context.agent_name(),
            run_profile = %self.run_profile_name,
            first = ?delay,
            "interval trigger started"
        );

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if !context.fire(request.clone()) {
                            tracing::debug!(agent = %context.agent_name(), "controller gone, interval trigger exiting");
                            break;
                        }
                    }
                }
            }
        });

        self.task = Some(TriggerTask::new(cancel, handle));
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.stop().await;
        }
    }
}
