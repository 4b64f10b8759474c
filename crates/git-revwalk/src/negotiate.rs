//! Fetch negotiation: choosing `have` candidates from local history.
//!
//! Wraps a chronological [`RevWalk`] over the client's local ref tips. Each
//! round hands the caller a batch of candidate `have` ids, doubling the
//! batch size (32, 64, 128, … capped at 256) the way the protocol engine's
//! negotiator is specified to. When the server ACKs an id as common, the
//! caller reports it back via `ack_common`, which hides that commit (and,
//! through the walk's existing ancestor-propagation, its whole ancestry)
//! so later rounds don't resend commits the server already has.

use git_hash::ObjectId;
use git_repository::Repository;

use crate::walk::{RevWalk, SortOrder};
use crate::RevWalkError;

const INITIAL_ROUND_SIZE: usize = 32;
const MAX_ROUND_SIZE: usize = 256;
const MAX_HAVES: usize = 256;

/// Chooses `have` ids for fetch negotiation, one round at a time.
pub struct Negotiator<'a> {
    walk: RevWalk<'a>,
    round_size: usize,
    total_sent: usize,
    exhausted: bool,
}

impl<'a> Negotiator<'a> {
    /// Start a negotiation rooted at the client's local tips (typically
    /// every branch/tag head the client has).
    pub fn new(repo: &'a Repository, local_tips: &[ObjectId]) -> Result<Self, RevWalkError> {
        let mut walk = RevWalk::new(repo)?;
        walk.set_sort(SortOrder::Chronological);
        for tip in local_tips {
            walk.push(*tip)?;
        }
        Ok(Self {
            walk,
            round_size: INITIAL_ROUND_SIZE,
            total_sent: 0,
            exhausted: false,
        })
    }

    /// Produce the next batch of `have` candidates, in commit-time order,
    /// newest first. Returns an empty batch once negotiation is exhausted
    /// ([`Negotiator::should_send_done`] will then be true).
    pub fn next_round(&mut self) -> Result<Vec<ObjectId>, RevWalkError> {
        if self.exhausted {
            return Ok(Vec::new());
        }

        let budget = self.round_size.min(MAX_HAVES - self.total_sent);
        let mut haves = Vec::with_capacity(budget);
        while haves.len() < budget {
            match self.walk.next() {
                Some(Ok(oid)) => haves.push(oid),
                Some(Err(e)) => return Err(e),
                None => {
                    self.exhausted = true;
                    break;
                }
            }
        }

        self.total_sent += haves.len();
        if self.total_sent >= MAX_HAVES {
            self.exhausted = true;
        }
        self.round_size = (self.round_size * 2).min(MAX_ROUND_SIZE);

        Ok(haves)
    }

    /// Record that the server acknowledged `oid` as common. Hides it (and
    /// its ancestry) from future rounds.
    pub fn ack_common(&mut self, oid: ObjectId) -> Result<(), RevWalkError> {
        self.walk.hide(oid)
    }

    /// Whether the client should send `done` — either the walk ran out of
    /// local history to offer, or the 256-have cutoff was hit.
    pub fn should_send_done(&self) -> bool {
        self.exhausted
    }

    /// Total `have` ids sent across all rounds so far.
    pub fn total_sent(&self) -> usize {
        self.total_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git_hash::HashAlgorithm;
    use git_object::{Commit, Object};
    use git_utils::date::{GitDate, Signature};

    fn signature(name: &str, time: i64) -> Signature {
        Signature {
            name: name.as_bytes().to_vec().into(),
            email: b"t@example.com".to_vec().into(),
            date: GitDate {
                timestamp: time,
                tz_offset: 0,
            },
        }
    }

    fn write_commit(
        repo: &Repository,
        parents: Vec<ObjectId>,
        tree: ObjectId,
        time: i64,
        message: &str,
    ) -> ObjectId {
        let commit = Commit {
            tree,
            parents,
            author: signature("a", time),
            committer: signature("a", time),
            encoding: None,
            gpgsig: None,
            extra_headers: Vec::new(),
            message: message.as_bytes().to_vec().into(),
        };
        let obj = Object::Commit(commit);
        repo.odb().write(&obj).unwrap()
    }

    fn empty_tree(repo: &Repository) -> ObjectId {
        let tree = git_object::Tree {
            entries: Vec::new(),
        };
        repo.odb().write(&Object::Tree(tree)).unwrap()
    }

    #[test]
    fn round_size_doubles_and_caps() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let tree = empty_tree(&repo);

        // A chain of 100 commits, each one second apart.
        let mut parent = None;
        let mut tip = ObjectId::from_bytes(&[0; 20], HashAlgorithm::Sha1).unwrap();
        for i in 0..100 {
            let parents = parent.into_iter().collect::<Vec<_>>();
            tip = write_commit(&repo, parents, tree, i, &format!("c{i}"));
            parent = Some(tip);
        }

        let mut neg = Negotiator::new(&repo, &[tip]).unwrap();
        let r1 = neg.next_round().unwrap();
        assert_eq!(r1.len(), 32);
        let r2 = neg.next_round().unwrap();
        assert_eq!(r2.len(), 64);
        // Remaining history is 100 - 32 - 64 = 4.
        let r3 = neg.next_round().unwrap();
        assert_eq!(r3.len(), 4);
        assert!(neg.should_send_done());
    }

    #[test]
    fn ack_common_stops_further_ancestor_offers() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let tree = empty_tree(&repo);

        let c0 = write_commit(&repo, vec![], tree, 0, "c0");
        let c1 = write_commit(&repo, vec![c0], tree, 1, "c1");
        let c2 = write_commit(&repo, vec![c1], tree, 2, "c2");

        let mut neg = Negotiator::new(&repo, &[c2]).unwrap();
        let round = neg.next_round().unwrap();
        assert_eq!(round, vec![c2, c1, c0]);
        assert!(neg.should_send_done());

        // A fresh negotiator that immediately learns c1 is common should
        // never re-offer c0, since c0 is c1's ancestor.
        let mut neg2 = Negotiator::new(&repo, &[c2]).unwrap();
        neg2.ack_common(c1).unwrap();
        let round = neg2.next_round().unwrap();
        assert_eq!(round, vec![c2]);
    }
}
