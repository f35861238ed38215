use std::collections::HashSet;

use vnet_id::TaskId;

use crate::locks::LockTarget;

/// A queued task as seen by the reservation scan.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: TaskId,
    pub lock_targets: Vec<LockTarget>,
    /// Whether the prerequisite (if any) has reached a terminal state.
    pub prerequisite_done: bool,
}

/// Pick the first task (oldest first) that can run now.
///
/// A task is skipped when its prerequisite is still open, when any of its
/// targets is held, or when an earlier runnable task that is still waiting
/// needs one of its targets. The last rule keeps a stream of small tasks from
/// starving an older task that needs the same lock.
pub fn select_reservable<'a>(
    queued: &'a [Candidate],
    held: &HashSet<LockTarget>,
) -> Option<&'a Candidate> {
    let mut wanted: HashSet<&LockTarget> = HashSet::new();

    for candidate in queued {
        if !candidate.prerequisite_done {
            continue;
        }
        let blocked = candidate
            .lock_targets
            .iter()
            .any(|t| held.contains(t) || wanted.contains(t));
        if !blocked {
            return Some(candidate);
        }
        wanted.extend(candidate.lock_targets.iter());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(targets: &[&str], prerequisite_done: bool) -> Candidate {
        Candidate {
            id: TaskId::new(),
            lock_targets: targets.iter().map(|t| LockTarget::from_stored(*t)).collect(),
            prerequisite_done,
        }
    }

    fn held(targets: &[&str]) -> HashSet<LockTarget> {
        targets.iter().map(|t| LockTarget::from_stored(*t)).collect()
    }

    #[test]
    fn test_picks_oldest_free_task() {
        let queued = vec![candidate(&["vpc:a"], true), candidate(&["vpc:b"], true)];
        let picked = select_reservable(&queued, &held(&[])).unwrap();
        assert_eq!(picked.id, queued[0].id);
    }

    #[test]
    fn test_skips_held_targets() {
        let queued = vec![candidate(&["vpc:a"], true), candidate(&["vpc:b"], true)];
        let picked = select_reservable(&queued, &held(&["vpc:a"])).unwrap();
        assert_eq!(picked.id, queued[1].id);
    }

    #[test]
    fn test_waiting_task_blocks_younger_tasks_on_same_target() {
        // The oldest task needs the IPAM lock and a busy VPC; the younger
        // task only needs the IPAM lock and must wait behind it.
        let queued = vec![
            candidate(&["ipcontrol-write", "vpc:a"], true),
            candidate(&["ipcontrol-write", "vpc:b"], true),
            candidate(&["vpc:c"], true),
        ];
        let picked = select_reservable(&queued, &held(&["vpc:a"])).unwrap();
        assert_eq!(picked.id, queued[2].id);
    }

    #[test]
    fn test_open_prerequisite_does_not_block_others() {
        let queued = vec![candidate(&["vpc:a"], false), candidate(&["vpc:a"], true)];
        let picked = select_reservable(&queued, &held(&[])).unwrap();
        assert_eq!(picked.id, queued[1].id);
    }

    #[test]
    fn test_nothing_runnable() {
        let queued = vec![candidate(&["vpc:a"], true)];
        assert!(select_reservable(&queued, &held(&["vpc:a"])).is_none());
    }
}
