//! Recurring timers with reset and cancellation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Shift `duration` by a random amount of up to ±10%.
pub fn randomize_offset(duration: Duration) -> Duration {
    let millis = duration.as_millis() as u64;
    let spread = millis / 10;
    if spread == 0 {
        return duration;
    }
    let offset = rand::thread_rng().gen_range(0..=spread * 2);
    Duration::from_millis(millis - spread + offset)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSpec {
    pub interval: Duration,
    pub first_delay: Duration,
    /// Randomize every period, not just the first.
    pub jitter_every_tick: bool,
}

impl TimerSpec {
    /// Fixed `interval` after a randomized first period.
    pub fn staggered(interval: Duration) -> Self {
        Self {
            interval,
            first_delay: randomize_offset(interval),
            jitter_every_tick: false,
        }
    }

    /// Every period randomized around `interval`.
    pub fn jittered(interval: Duration) -> Self {
        Self {
            interval,
            first_delay: randomize_offset(interval),
            jitter_every_tick: true,
        }
    }

    fn next_period(&self) -> Duration {
        if self.jitter_every_tick {
            randomize_offset(self.interval)
        } else {
            self.interval
        }
    }
}

/// A background task calling `on_tick` once per period until stopped.
///
/// Ticks never overlap: the next period starts after `on_tick` returns.
#[derive(Debug)]
pub struct RecurringTimer {
    name: String,
    reset: Arc<Notify>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl RecurringTimer {
    pub fn start<F, Fut>(
        name: impl Into<String>,
        spec: TimerSpec,
        parent: &CancellationToken,
        mut on_tick: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let reset = Arc::new(Notify::new());
        let cancel = parent.child_token();

        let handle = {
            let reset = Arc::clone(&reset);
            let cancel = cancel.clone();
            let name = name.clone();
            tokio::spawn(async move {
                tracing::trace!(timer = %name, first = ?spec.first_delay, "timer started");
                let mut delay = spec.first_delay;
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = reset.notified() => {
                            tracing::trace!(timer = %name, "timer reset");
                            delay = spec.interval;
                        }
                        _ = tokio::time::sleep(delay) => {
                            on_tick().await;
                            delay = spec.next_period();
                        }
                    }
                }
                tracing::trace!(timer = %name, "timer stopped");
            })
        };

        Self {
            name,
            reset,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Restart the current period from zero.
    pub fn reset(&self) {
        self.reset.notify_one();
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    #[cfg(test)]
    pub async fn join(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for RecurringTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
