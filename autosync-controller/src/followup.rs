//! Follow-up work derived from a run result.
//!
//! Pure: the controller turns the derived partitions into queued requests
//! and the derived targets into bus events.

use autosync_core::{AgentId, PartitionId, RunResult, StepResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FollowUps {
    /// Partitions with exports that no later import in the run confirmed.
    pub confirming_imports: Vec<PartitionId>,
    /// Partitions with staged imports that no later sync in the run processed.
    pub delta_syncs: Vec<PartitionId>,
    /// Agents that received outbound changes from a sync step.
    pub sync_targets: Vec<AgentId>,
    /// Steps that could not be attributed to a partition.
    pub skipped_steps: Vec<usize>,
}

impl FollowUps {
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.confirming_imports.is_empty()
            && self.delta_syncs.is_empty()
            && self.sync_targets.is_empty()
    }
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}

fn later_step_covers(
    steps: &[StepResult],
    from: usize,
    partition: PartitionId,
    covers: impl Fn(&StepResult) -> bool,
) -> bool {
    steps
        .iter()
        .skip(from)
        .filter(|step| step.partition() == Some(partition))
        .any(covers)
}

pub fn derive(result: &RunResult) -> FollowUps {
    let mut followups = FollowUps::default();
    let steps = &result.steps;

    for (index, step) in steps.iter().enumerate() {
        if step.has_unconfirmed_exports() {
            match step.partition() {
                None => push_unique(&mut followups.skipped_steps, index),
                Some(partition) => {
                    if !later_step_covers(steps, index + 1, partition, |s| s.kind().is_import()) {
                        push_unique(&mut followups.confirming_imports, partition);
                    }
                }
            }
        }

        if step.has_staged_imports() {
            match step.partition() {
                None => push_unique(&mut followups.skipped_steps, index),
                Some(partition) => {
                    // A combined import+sync step processes its own staged changes.
                    if !later_step_covers(steps, index, partition, |s| s.kind().is_sync()) {
                        push_unique(&mut followups.delta_syncs, partition);
                    }
                }
            }
        }

        if step.kind().is_sync() {
            for flow in step.outbound_flows.iter().filter(|f| f.has_changes()) {
                push_unique(&mut followups.sync_targets, flow.target_agent);
            }
        }
    }

    followups
}
