use git_hash::ObjectId;

use crate::error::RefError;
use crate::name::RefName;
use crate::reflog::ReflogEntry;
use crate::Reference;

/// Trait for pluggable reference storage backends.
///
/// Provides the core operations: resolve, update, iterate, and reflog access.
/// The default implementation is `FilesRefStore` (loose refs + packed-refs).
pub trait RefStore: Send + Sync {
    /// Resolve a ref name to a Reference (may be Direct or Symbolic).
    fn resolve(&self, name: &RefName) -> Result<Option<Reference>, RefError>;

    /// Resolve a ref name to its final OID, following symbolic ref chains.
    fn resolve_to_oid(&self, name: &RefName) -> Result<Option<ObjectId>, RefError>;

    /// Iterate refs with an optional prefix filter.
    /// Results are sorted lexicographically by full ref name.
    fn iter(
        &self,
        prefix: Option<&str>,
    ) -> Result<Box<dyn Iterator<Item = Result<Reference, RefError>> + '_>, RefError>;

    /// Read the reflog for a ref.
    fn reflog(&self, name: &RefName) -> Result<Vec<ReflogEntry>, RefError>;

    /// Append a reflog entry for a ref.
    fn append_reflog(&self, name: &RefName, entry: &ReflogEntry) -> Result<(), RefError>;
}

/// Batch of ref updates.
///
/// Each update in the batch is applied independently (own lock, own CAS
/// check, own write/commit). If one update fails, refs already applied by
/// earlier updates in the same batch are left in place — there is no
/// rollback across updates, only the per-update lock/commit cycle is
/// atomic. Call `FilesRefStore::commit_transaction` to get back the
/// per-update status of every update in the batch.
pub struct RefTransaction {
    pub(crate) updates: Vec<RefUpdate>,
}

/// Outcome of applying a single ref update within a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    /// The update was applied.
    Ok,
    /// The ref's lock file was already held by another writer.
    LockFailure,
    /// `create` was rejected because the ref already exists.
    RejectedExists,
    /// `update`/`delete` was rejected because the ref does not exist.
    RejectedMissing,
    /// `update`/`delete` was rejected because the current value didn't
    /// match the caller's expected old value.
    RejectedCas { expected: ObjectId, actual: ObjectId },
    /// The update failed due to an I/O error unrelated to locking or CAS.
    IoFailure(String),
}

impl UpdateStatus {
    /// Whether the update was applied.
    pub fn is_ok(&self) -> bool {
        matches!(self, UpdateStatus::Ok)
    }
}

impl std::fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateStatus::Ok => write!(f, "ok"),
            UpdateStatus::LockFailure => write!(f, "unable to acquire lock"),
            UpdateStatus::RejectedExists => write!(f, "ref already exists"),
            UpdateStatus::RejectedMissing => write!(f, "ref does not exist"),
            UpdateStatus::RejectedCas { expected, actual } => {
                write!(f, "expected {expected}, found {actual}")
            }
            UpdateStatus::IoFailure(msg) => write!(f, "I/O failure: {msg}"),
        }
    }
}

/// A single update within a transaction.
pub struct RefUpdate {
    pub name: RefName,
    pub action: RefUpdateAction,
    pub reflog_message: Option<String>,
}

/// The action to perform on a ref within a transaction.
pub enum RefUpdateAction {
    /// Create a new ref (fails if it already exists).
    Create { new_target: ObjectId },
    /// Update an existing ref with compare-and-swap check.
    Update {
        old_target: ObjectId,
        new_target: ObjectId,
    },
    /// Delete a ref with compare-and-swap check.
    Delete { old_target: ObjectId },
    /// Set a symbolic ref to point to another ref.
    SetSymbolic { target: RefName },
}

impl RefTransaction {
    /// Create a new empty transaction.
    pub fn new() -> Self {
        Self {
            updates: Vec::new(),
        }
    }

    /// Add an update (CAS) operation to the transaction.
    pub fn update(
        &mut self,
        name: RefName,
        old: ObjectId,
        new: ObjectId,
        message: impl Into<String>,
    ) {
        self.updates.push(RefUpdate {
            name,
            action: RefUpdateAction::Update {
                old_target: old,
                new_target: new,
            },
            reflog_message: Some(message.into()),
        });
    }

    /// Add a create operation to the transaction.
    pub fn create(&mut self, name: RefName, target: ObjectId, message: impl Into<String>) {
        self.updates.push(RefUpdate {
            name,
            action: RefUpdateAction::Create { new_target: target },
            reflog_message: Some(message.into()),
        });
    }

    /// Add a delete operation to the transaction.
    pub fn delete(&mut self, name: RefName, old: ObjectId, message: impl Into<String>) {
        self.updates.push(RefUpdate {
            name,
            action: RefUpdateAction::Delete { old_target: old },
            reflog_message: Some(message.into()),
        });
    }

    /// Add a set-symbolic operation to the transaction.
    pub fn set_symbolic(
        &mut self,
        name: RefName,
        target: RefName,
        message: impl Into<String>,
    ) {
        self.updates.push(RefUpdate {
            name,
            action: RefUpdateAction::SetSymbolic { target },
            reflog_message: Some(message.into()),
        });
    }

    /// Get the list of updates in this transaction.
    pub fn updates(&self) -> &[RefUpdate] {
        &self.updates
    }

    /// Check if the transaction is empty.
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

impl Default for RefTransaction {
    fn default() -> Self {
        Self::new()
    }
}
