//! Which partitions have pending exports or staged imports.

use std::collections::HashSet;

use autosync_core::PartitionId;

use crate::engine::PendingObject;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionMode {
    /// One active partition: any pending object means every partition needs work.
    AssumeAll,
    /// Several active partitions: walk the objects and collect their partitions.
    WalkConnectorSpace,
}

impl DetectionMode {
    pub fn for_active_partitions(count: usize) -> Self {
        if count > 1 {
            DetectionMode::WalkConnectorSpace
        } else {
            DetectionMode::AssumeAll
        }
    }
}

/// Active partitions (in configuration order) that the object stream touches.
///
/// Stops consuming `objects` as soon as the answer is known.
pub fn partitions_requiring<I>(
    mode: DetectionMode,
    active: &[PartitionId],
    objects: I,
) -> Vec<PartitionId>
where
    I: IntoIterator<Item = PendingObject>,
{
    let mut objects = objects.into_iter();

    if mode == DetectionMode::AssumeAll {
        return match objects.next() {
            Some(_) => active.to_vec(),
            None => Vec::new(),
        };
    }

    let wanted: HashSet<PartitionId> = active.iter().copied().collect();
    let mut seen = HashSet::new();
    let mut scanned = 0usize;

    for object in objects {
        scanned += 1;
        let Some(partition) = object.partition_id else {
            tracing::warn!(object = %object.object_id, "pending object has no partition");
            continue;
        };
        if wanted.contains(&partition) && seen.insert(partition) && seen.len() >= wanted.len() {
            break;
        }
    }

    tracing::trace!(scanned, found = seen.len(), "partition detection finished");
    active.iter().copied().filter(|p| seen.contains(p)).collect()
}
