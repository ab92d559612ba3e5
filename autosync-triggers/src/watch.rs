//! File-system trigger: fires a run profile when files under a path change.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use autosync_controller::{trigger_io_err, ExecutionTrigger, TriggerContext, TriggerError};
use autosync_core::ExecutionRequest;
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::TriggerTask;

/// Entries older than this are forgotten by the debounce map.
const DEBOUNCE_RETENTION: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct FileWatchTrigger {
    path: PathBuf,
    run_profile_name: String,
    debounce: Duration,
    task: Option<TriggerTask>,
}

impl FileWatchTrigger {
    pub fn new(
        path: impl Into<PathBuf>,
        run_profile_name: impl Into<String>,
        debounce: Duration,
    ) -> Result<Self, TriggerError> {
        let run_profile_name = run_profile_name.into();
        if run_profile_name.trim().is_empty() {
            return Err(TriggerError::Invalid(
                "file watch trigger needs a run profile name".to_string(),
            ));
        }
        Ok(Self {
            path: path.into(),
            run_profile_name,
            debounce,
            task: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ExecutionTrigger for FileWatchTrigger {
    fn display_name(&self) -> String {
        format!("File watch: {} on {}", self.run_profile_name, self.path.display())
    }

    async fn start(&mut self, context: TriggerContext) -> Result<(), TriggerError> {
        if self.task.is_some() {
            return Err(TriggerError::AlreadyStarted(self.display_name()));
        }

        std::fs::metadata(&self.path).map_err(|e| trigger_io_err(&self.path, e))?;
        // Events arrive with canonical paths on some platforms.
        let root = std::fs::canonicalize(&self.path).unwrap_or_else(|_| self.path.clone());

        let (event_tx, event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
            let _ = event_tx.send(event);
        })
        .map_err(|e| TriggerError::Watch(e.to_string()))?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| TriggerError::Watch(e.to_string()))?;

        tracing::debug!(
            agent = %context.agent_name(),
            path = %root.display(),
            run_profile = %self.run_profile_name,
            "file watch trigger started"
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watch_loop(
            watcher,
            event_rx,
            context,
            ExecutionRequest::named(&self.run_profile_name),
            self.debounce,
            cancel.clone(),
        ));
        self.task = Some(TriggerTask::new(cancel, handle));
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.stop().await;
        }
    }
}

async fn watch_loop(
    // Dropping the watcher ends the OS subscription.
    _watcher: RecommendedWatcher,
    mut event_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    context: TriggerContext,
    request: ExecutionRequest,
    threshold: Duration,
    cancel: CancellationToken,
) {
    let mut debounce = HashMap::<PathBuf, Instant>::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        context.error(format!("watcher error: {err}"));
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }

                let now = Instant::now();
                let fresh: Vec<&PathBuf> = event
                    .paths
                    .iter()
                    .filter(|path| should_process_event(&mut debounce, path, now, threshold))
                    .collect();
                let Some(first) = fresh.first() else { continue };

                context.message(format!("Change detected at {}", first.display()));
                if !context.fire(request.clone()) {
                    break;
                }
            }
        }
    }
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

/// Per-path debounce: `false` when `path` was accepted less than
/// `threshold` ago.
pub fn should_process_event(
    debounce: &mut HashMap<PathBuf, Instant>,
    path: &Path,
    now: Instant,
    threshold: Duration,
) -> bool {
    debounce.retain(|_, seen_at| now.duration_since(*seen_at) <= DEBOUNCE_RETENTION);
    match debounce.get(path) {
        Some(last_seen) if now.duration_since(*last_seen) < threshold => false,
        _ => {
            debounce.insert(path.to_path_buf(), now);
            true
        }
    }
}
