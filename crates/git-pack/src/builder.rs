//! High-level pack construction: object ordering, delta search window, and
//! ref-delta vs ofs-delta selection on top of the low-level [`PackWriter`].
//!
//! This module is deliberately independent of the object database and
//! revision-walker crates (`git-pack` sits below both in the dependency
//! graph). Callers supply the object set to pack and a [`PackSource`] that
//! resolves an [`ObjectId`] to its type and raw content; the reachability
//! closure itself is the caller's job (see `git-revwalk::objects::list_objects`
//! for the one this workspace uses).

use std::collections::HashMap;

use git_hash::ObjectId;
use git_object::ObjectType;

use crate::delta::compute::compute_delta_limited;
use crate::write::PackWriter;
use crate::{PackError, DEFAULT_DELTA_WINDOW, DEFAULT_WRITE_DELTA_DEPTH};

/// Resolves object content for objects a [`PackBuilder`] is asked to pack.
pub trait PackSource {
    /// Return `(type, content)` for `oid`, or `Ok(None)` if unknown.
    fn object(&self, oid: &ObjectId) -> Result<Option<(ObjectType, Vec<u8>)>, PackError>;
}

/// Blanket impl so a plain `HashMap` can stand in for tests and small
/// in-memory packs.
impl PackSource for HashMap<ObjectId, (ObjectType, Vec<u8>)> {
    fn object(&self, oid: &ObjectId) -> Result<Option<(ObjectType, Vec<u8>)>, PackError> {
        Ok(self.get(oid).cloned())
    }
}

/// Policy knobs for [`PackBuilder::build`], mirroring `pack.window`,
/// `pack.depth`, and the thin-pack switch a caller (fetch/push) controls.
#[derive(Debug, Clone)]
pub struct BuilderOptions {
    /// Number of preceding objects considered as delta-base candidates.
    pub window: usize,
    /// Maximum delta chain depth the builder will produce.
    pub depth: usize,
    /// If true, deltas may reference a base object that is not itself being
    /// written into this pack (the base must already exist on the far end).
    pub thin: bool,
    /// Abort a delta attempt once the candidate exceeds this many bytes;
    /// `None` falls back to the uncompressed object size.
    pub delta_size_limit: Option<usize>,
}

impl Default for BuilderOptions {
    fn default() -> Self {
        Self {
            window: DEFAULT_DELTA_WINDOW,
            depth: DEFAULT_WRITE_DELTA_DEPTH,
            thin: false,
            delta_size_limit: None,
        }
    }
}

#[derive(Clone)]
struct Candidate {
    oid: ObjectId,
    obj_type: ObjectType,
    content: Vec<u8>,
    /// Offset this object was (or will be) written at, filled in once its
    /// entry has been emitted.
    offset: Option<u64>,
    /// Current delta chain depth if this object ends up delta-encoded
    /// against something already in the window.
    chain_depth: usize,
}

/// Orders a set of objects and emits them into a [`PackWriter`], searching a
/// sliding window of recently-seen objects of the same type for a delta
/// base before falling back to a whole-object entry.
///
/// Ordering follows the same locality principle canonical packs use: type
/// first (commits, then tags, then trees and blobs grouped by similarity),
/// so that objects likely to share content sit near each other in the
/// window.
pub struct PackBuilder<'s> {
    source: &'s dyn PackSource,
    options: BuilderOptions,
}

impl<'s> PackBuilder<'s> {
    pub fn new(source: &'s dyn PackSource, options: BuilderOptions) -> Self {
        Self { source, options }
    }

    /// Build a pack containing exactly `objects` (already resolved to the
    /// full closure by the caller) and write it through `writer`.
    ///
    /// `external_bases`, when non-empty and `options.thin` is set, are
    /// objects assumed present on the receiving end: they are eligible
    /// delta bases but are never themselves written into the pack.
    pub fn build(
        &self,
        writer: &mut PackWriter,
        objects: &[ObjectId],
        external_bases: &[ObjectId],
    ) -> Result<(), PackError> {
        let mut candidates = Vec::with_capacity(objects.len());
        for oid in objects {
            let Some((obj_type, content)) = self.source.object(oid)? else {
                return Err(PackError::MissingBase(*oid));
            };
            candidates.push(Candidate {
                oid: *oid,
                obj_type,
                content,
                offset: None,
                chain_depth: 0,
            });
        }

        sort_for_locality(&mut candidates);

        // External (thin-pack) bases: resolvable as delta bases via
        // ref-delta only, never written, never windowed as targets.
        let mut external: HashMap<ObjectId, (ObjectType, Vec<u8>)> = HashMap::new();
        if self.options.thin {
            for oid in external_bases {
                if let Some(pair) = self.source.object(oid)? {
                    external.insert(*oid, pair);
                }
            }
        }

        // One sliding window per object type: deltas only ever make sense
        // between objects of the same type.
        let mut windows: HashMap<ObjectType, Vec<usize>> = HashMap::new();

        for i in 0..candidates.len() {
            let obj_type = candidates[i].obj_type;
            let window = windows.entry(obj_type).or_default();

            let best = self.find_best_delta(&candidates, *window, i, &external);

            match best {
                Some(DeltaChoice::InPack { base_idx, delta }) => {
                    let base_oid = candidates[base_idx].oid;
                    let base_offset = candidates[base_idx].offset;
                    let depth = candidates[base_idx].chain_depth + 1;
                    let target_oid = candidates[i].oid;
                    let offset = writer.current_offset();
                    if let Some(base_offset) = base_offset {
                        writer.add_delta_ofs(base_offset, target_oid, &delta)?;
                    } else {
                        writer.add_delta(base_oid, target_oid, &delta)?;
                    }
                    candidates[i].offset = Some(offset);
                    candidates[i].chain_depth = depth;
                }
                Some(DeltaChoice::External { base_oid, delta }) => {
                    let target_oid = candidates[i].oid;
                    let offset = writer.current_offset();
                    writer.add_delta(base_oid, target_oid, &delta)?;
                    candidates[i].offset = Some(offset);
                    candidates[i].chain_depth = 1;
                }
                None => {
                    let offset = writer.current_offset();
                    writer.add_object(obj_type, &candidates[i].content)?;
                    candidates[i].offset = Some(offset);
                    candidates[i].chain_depth = 0;
                }
            }

            let window = windows.entry(obj_type).or_default();
            window.push(i);
            if window.len() > self.options.window {
                window.remove(0);
            }
        }

        Ok(())
    }

    fn find_best_delta(
        &self,
        candidates: &[Candidate],
        window: Vec<usize>,
        target_idx: usize,
        external: &HashMap<ObjectId, (ObjectType, Vec<u8>)>,
    ) -> Option<DeltaChoice> {
        let target = &candidates[target_idx];
        let limit = self
            .options
            .delta_size_limit
            .unwrap_or(target.content.len());

        let mut best: Option<(usize, Vec<u8>)> = None;

        for &base_idx in &window {
            let base = &candidates[base_idx];
            if base.chain_depth + 1 > self.options.depth {
                continue;
            }
            let Some(delta) = compute_delta_limited(&base.content, &target.content, Some(limit))
            else {
                continue;
            };
            if best.as_ref().map_or(true, |(_, d)| delta.len() < d.len()) {
                best = Some((base_idx, delta));
            }
        }

        if let Some((base_idx, delta)) = best {
            return Some(DeltaChoice::InPack { base_idx, delta });
        }

        if self.options.thin {
            for (base_oid, (base_type, base_content)) in external {
                if *base_type != target.obj_type {
                    continue;
                }
                if let Some(delta) =
                    compute_delta_limited(base_content, &target.content, Some(limit))
                {
                    return Some(DeltaChoice::External {
                        base_oid: *base_oid,
                        delta,
                    });
                }
            }
        }

        None
    }
}

enum DeltaChoice {
    InPack { base_idx: usize, delta: Vec<u8> },
    External { base_oid: ObjectId, delta: Vec<u8> },
}

/// Order objects the way canonical packs do: commits first (newest-ish
/// locality doesn't matter much for delta search), then tags, then trees
/// and blobs, with same-type objects kept contiguous so the sliding window
/// only ever compares like with like.
fn sort_for_locality(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        type_rank(a.obj_type)
            .cmp(&type_rank(b.obj_type))
            .then_with(|| a.content.len().cmp(&b.content.len()))
    });
}

fn type_rank(t: ObjectType) -> u8 {
    match t {
        ObjectType::Commit => 0,
        ObjectType::Tag => 1,
        ObjectType::Tree => 2,
        ObjectType::Blob => 3,
    }
}
