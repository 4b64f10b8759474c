//! Per-commit flag bits used by the negotiator and by boundary/uninteresting
//! propagation — the Rust rendering of the original flag-byte-on-the-commit
//! design (see the crate's design notes): rather than a field squeezed onto
//! a shared commit struct, flags live in their own arena keyed by
//! [`ObjectId`], so callers can hold flag state independently of however
//! commits are cached elsewhere.

use std::collections::HashMap;

use git_hash::ObjectId;

bitflags::bitflags! {
    /// Flag bits a revision walk can set on a commit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CommitFlags: u8 {
        /// Already enqueued/visited by this walk.
        const SEEN = 0b0001;
        /// Reachable from a `have`/`^`-excluded tip — must not be emitted.
        const UNINTERESTING = 0b0010;
        /// The first interesting commit found downstream of an
        /// uninteresting one — a shallow/merge-base boundary marker.
        const BOUNDARY = 0b0100;
        /// Queued for parent expansion but not yet processed.
        const ADDED = 0b1000;
    }
}

/// Arena mapping commits to their current flag state.
///
/// Bulk `UNINTERESTING` propagation (marking a commit and transitively all
/// of its ancestors) is the operation the negotiator and `git log ^A B`
/// style ranges both need; `propagate_uninteresting` walks parent links
/// via the supplied callback until it reaches commits already marked.
#[derive(Debug, Default)]
pub struct FlagArena {
    flags: HashMap<ObjectId, CommitFlags>,
}

impl FlagArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, oid: &ObjectId) -> CommitFlags {
        self.flags.get(oid).copied().unwrap_or_default()
    }

    pub fn set(&mut self, oid: ObjectId, flags: CommitFlags) {
        self.flags.entry(oid).or_default().insert(flags);
    }

    pub fn clear(&mut self, oid: &ObjectId, flags: CommitFlags) {
        if let Some(existing) = self.flags.get_mut(oid) {
            existing.remove(flags);
        }
    }

    pub fn has(&self, oid: &ObjectId, flags: CommitFlags) -> bool {
        self.get(oid).contains(flags)
    }

    /// Mark `start` and every ancestor reachable from it (via `parents_of`)
    /// as `UNINTERESTING`, stopping at commits already marked.
    pub fn propagate_uninteresting(
        &mut self,
        start: ObjectId,
        mut parents_of: impl FnMut(&ObjectId) -> Vec<ObjectId>,
    ) {
        let mut stack = vec![start];
        while let Some(oid) = stack.pop() {
            if self.has(&oid, CommitFlags::UNINTERESTING) {
                continue;
            }
            self.set(oid, CommitFlags::UNINTERESTING);
            stack.extend(parents_of(&oid));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(n: u8) -> ObjectId {
        ObjectId::from_bytes(&[n; 20], git_hash::HashAlgorithm::Sha1).unwrap()
    }

    #[test]
    fn set_and_query_flags() {
        let mut arena = FlagArena::new();
        let a = oid(1);
        assert!(!arena.has(&a, CommitFlags::SEEN));
        arena.set(a, CommitFlags::SEEN | CommitFlags::ADDED);
        assert!(arena.has(&a, CommitFlags::SEEN));
        assert!(arena.has(&a, CommitFlags::ADDED));
        arena.clear(&a, CommitFlags::ADDED);
        assert!(!arena.has(&a, CommitFlags::ADDED));
        assert!(arena.has(&a, CommitFlags::SEEN));
    }

    #[test]
    fn propagate_uninteresting_stops_at_already_marked() {
        let mut arena = FlagArena::new();
        // a -> b -> c, and a -> d (d already uninteresting).
        let (a, b, c, d) = (oid(1), oid(2), oid(3), oid(4));
        arena.set(d, CommitFlags::UNINTERESTING);

        let parents = |o: &ObjectId| -> Vec<ObjectId> {
            if *o == a {
                vec![b, d]
            } else if *o == b {
                vec![c]
            } else {
                vec![]
            }
        };

        let mut visits = 0;
        arena.propagate_uninteresting(a, |o| {
            visits += 1;
            parents(o)
        });

        assert!(arena.has(&a, CommitFlags::UNINTERESTING));
        assert!(arena.has(&b, CommitFlags::UNINTERESTING));
        assert!(arena.has(&c, CommitFlags::UNINTERESTING));
        // d was already marked, so its subtree (none here) wasn't re-walked.
        assert_eq!(visits, 3); // a, b, c — d stopped the walk, not expanded
    }
}
