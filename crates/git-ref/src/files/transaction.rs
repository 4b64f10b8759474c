use std::path::Path;

use git_hash::ObjectId;
use git_utils::date::Signature;
use git_utils::lockfile::LockFile;

use crate::error::RefError;
use crate::files::loose;
use crate::files::packed::PackedRefs;
use crate::reflog::{self, ReflogEntry};
use crate::store::{RefTransaction, RefUpdate, RefUpdateAction, UpdateStatus};
use crate::name::RefName;
use crate::Reference;

/// Commit a batch of ref updates against the files backend.
///
/// Each update in the batch is applied independently, with its own
/// lock/CAS/write/commit cycle:
/// 1. Acquire a lock on the ref being updated
/// 2. Verify the CAS (compare-and-swap) condition
/// 3. Write the new value to the lock file
/// 4. Commit the lock file (atomic rename), or delete the loose ref
/// 5. Append a reflog entry
///
/// If an update fails at any step, only that update is rejected — updates
/// already applied earlier in the same batch are left in place. The
/// returned vector reports one status per update, in the order the updates
/// were added to the transaction. The outer `Result` is reserved for
/// failures that prevent processing the batch at all (e.g. `packed-refs`
/// cannot be read).
pub(crate) fn commit_transaction(
    git_dir: &Path,
    transaction: RefTransaction,
    committer: Option<&Signature>,
) -> Result<Vec<(RefName, UpdateStatus)>, RefError> {
    if transaction.is_empty() {
        return Ok(Vec::new());
    }

    let packed = PackedRefs::load(git_dir)?;

    let mut results = Vec::with_capacity(transaction.updates.len());
    for update in transaction.updates {
        let status = apply_update(git_dir, &update, &packed, committer);
        results.push((update.name, status));
    }

    Ok(results)
}

/// Apply a single update's full lock/CAS/write/commit cycle.
fn apply_update(
    git_dir: &Path,
    update: &RefUpdate,
    packed: &PackedRefs,
    committer: Option<&Signature>,
) -> UpdateStatus {
    let lock_path = loose::loose_ref_path(git_dir, &update.name);

    if let Some(parent) = lock_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return UpdateStatus::IoFailure(e.to_string());
        }
    }

    let mut lock = match LockFile::acquire(&lock_path) {
        Ok(lock) => lock,
        Err(git_utils::UtilError::Lock(git_utils::LockError::AlreadyLocked { .. })) => {
            return UpdateStatus::LockFailure;
        }
        Err(e) => return UpdateStatus::IoFailure(e.to_string()),
    };

    let current = match loose::read_loose_ref(git_dir, &update.name) {
        Ok(current) => current,
        Err(e) => {
            let _ = lock.rollback();
            return UpdateStatus::IoFailure(e.to_string());
        }
    };

    let current_oid = match &current {
        Some(Reference::Direct { target, .. }) => Some(*target),
        Some(Reference::Symbolic { target, .. }) => {
            match resolve_symref(git_dir, target, packed, 10) {
                Ok(oid) => oid,
                Err(e) => {
                    let _ = lock.rollback();
                    return UpdateStatus::IoFailure(e.to_string());
                }
            }
        }
        None => packed.find(&update.name).map(|pr| pr.oid),
    };

    if let Err(status) = check_cas(&update.action, current_oid.as_ref(), &current) {
        let _ = lock.rollback();
        return status;
    }

    use std::io::Write;
    let write_result = match &update.action {
        RefUpdateAction::Create { new_target } | RefUpdateAction::Update { new_target, .. } => {
            lock.write_all(format!("{}\n", new_target.to_hex()).as_bytes())
        }
        RefUpdateAction::SetSymbolic { target } => {
            lock.write_all(format!("ref: {}\n", target).as_bytes())
        }
        RefUpdateAction::Delete { .. } => Ok(()),
    };

    if let Err(e) = write_result {
        let _ = lock.rollback();
        return UpdateStatus::IoFailure(e.to_string());
    }

    let commit_result = match &update.action {
        RefUpdateAction::Delete { .. } => {
            // We never write to a delete's lock file; drop it and remove
            // the loose ref itself.
            if let Err(e) = lock.rollback() {
                return UpdateStatus::IoFailure(e.to_string());
            }
            loose::delete_loose_ref(git_dir, &update.name)
        }
        _ => lock.commit().map_err(RefError::from),
    };

    if let Err(e) = commit_result {
        return UpdateStatus::IoFailure(e.to_string());
    }

    if let Some(sig) = committer {
        if let Some(msg) = &update.reflog_message {
            if let Some((old_oid, new_oid)) = reflog_oids(&update.action, current_oid) {
                let entry = ReflogEntry {
                    old_oid,
                    new_oid,
                    identity: sig.clone(),
                    message: msg.as_str().into(),
                };
                // A reflog write failure shouldn't undo an already-committed
                // ref update; the update itself still counts as applied.
                let _ = reflog::append_reflog_entry(git_dir, &update.name, &entry);
            }
        }
    }

    UpdateStatus::Ok
}

/// Check the CAS condition for a ref update against its pre-read state.
fn check_cas(
    action: &RefUpdateAction,
    current_oid: Option<&ObjectId>,
    current_ref: &Option<Reference>,
) -> Result<(), UpdateStatus> {
    match action {
        RefUpdateAction::Create { .. } => {
            if current_ref.is_some() || current_oid.is_some() {
                return Err(UpdateStatus::RejectedExists);
            }
        }
        RefUpdateAction::Update { old_target, .. } | RefUpdateAction::Delete { old_target } => {
            match current_oid {
                None => return Err(UpdateStatus::RejectedMissing),
                Some(actual) if actual != old_target => {
                    return Err(UpdateStatus::RejectedCas {
                        expected: *old_target,
                        actual: *actual,
                    });
                }
                _ => {}
            }
        }
        RefUpdateAction::SetSymbolic { .. } => {
            // No CAS check for symbolic refs.
        }
    }
    Ok(())
}

/// The (old, new) OID pair to record in the reflog for an applied update.
fn reflog_oids(
    action: &RefUpdateAction,
    current_oid: Option<ObjectId>,
) -> Option<(ObjectId, ObjectId)> {
    match action {
        RefUpdateAction::Create { new_target } => Some((ObjectId::NULL_SHA1, *new_target)),
        RefUpdateAction::Update { new_target, .. } => {
            Some((current_oid.unwrap_or(ObjectId::NULL_SHA1), *new_target))
        }
        RefUpdateAction::Delete { .. } => {
            Some((current_oid.unwrap_or(ObjectId::NULL_SHA1), ObjectId::NULL_SHA1))
        }
        RefUpdateAction::SetSymbolic { .. } => None,
    }
}

/// Resolve a symbolic ref chain to an OID, checking packed-refs as fallback.
fn resolve_symref(
    git_dir: &Path,
    name: &RefName,
    packed: &PackedRefs,
    max_depth: usize,
) -> Result<Option<ObjectId>, RefError> {
    if max_depth == 0 {
        return Err(RefError::SymrefLoop(name.to_string()));
    }

    match loose::read_loose_ref(git_dir, name)? {
        Some(Reference::Direct { target, .. }) => Ok(Some(target)),
        Some(Reference::Symbolic { target, .. }) => {
            resolve_symref(git_dir, &target, packed, max_depth - 1)
        }
        None => Ok(packed.find(name).map(|pr| pr.oid)),
    }
}
