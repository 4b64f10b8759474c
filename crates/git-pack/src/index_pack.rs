//! Internal pack indexer: turns a bare `.pack` stream into an `.idx` file.
//!
//! Replaces shelling out to `git index-pack`. Runs in two passes:
//!
//! 1. Walk every entry once in offset order, decompressing its payload and,
//!    for base (non-delta) entries, computing the OID directly.
//! 2. Resolve deltas to a fixed point: repeatedly sweep the list
//!    reconstructing any delta whose base (another entry in this pack, by
//!    offset for OFS_DELTA or by OID for REF_DELTA) is already resolved,
//!    until a sweep makes no progress. Whatever is still unresolved after
//!    that is a thin-pack REF_DELTA, completed from an external
//!    [`BaseSource`].
//!
//! A REF_DELTA whose base is neither in the pack nor resolvable through
//! `bases` makes the pack genuinely incomplete and indexing fails.

use std::collections::HashMap;
use std::path::Path;

use flate2::bufread::ZlibDecoder;
use git_hash::{hasher::Hasher, HashAlgorithm, ObjectId};
use git_object::ObjectType;
use std::io::Read;

use crate::entry::parse_entry_header;
use crate::write::build_pack_index;
use crate::{
    PackEntryType, PackError, MAX_DELTA_CHAIN_DEPTH, PACK_HEADER_SIZE, PACK_SIGNATURE,
    PACK_VERSION,
};

/// An external object source consulted for thin-pack bases not themselves
/// present in the pack being indexed.
pub trait BaseSource {
    fn find(&self, oid: &ObjectId) -> Option<(ObjectType, Vec<u8>)>;
}

impl BaseSource for () {
    fn find(&self, _oid: &ObjectId) -> Option<(ObjectType, Vec<u8>)> {
        None
    }
}

struct RawEntry {
    offset: u64,
    header_size: usize,
    compressed_len: usize,
    entry_type: PackEntryType,
    /// Decompressed payload: the object's own bytes for a base entry, the
    /// delta instruction stream for a delta entry. Replaced with the fully
    /// reconstructed object bytes once resolved.
    content: Vec<u8>,
    resolved: Option<(ObjectType, ObjectId)>,
}

/// Result of indexing: the `.idx` path plus summary counts.
pub struct IndexResult {
    pub idx_path: std::path::PathBuf,
    pub pack_checksum: ObjectId,
    pub object_count: u32,
}

/// Index `pack_path` in place, writing the sibling `.idx` file.
///
/// `bases` resolves any REF_DELTA base not itself present in the pack
/// (thin-pack completion). Pass `&()` for a non-thin pack.
pub fn index_pack(pack_path: &Path, bases: &dyn BaseSource) -> Result<IndexResult, PackError> {
    let data = std::fs::read(pack_path)?;
    index_pack_bytes(&data, pack_path, bases)
}

fn index_pack_bytes(
    data: &[u8],
    pack_path: &Path,
    bases: &dyn BaseSource,
) -> Result<IndexResult, PackError> {
    if data.len() < PACK_HEADER_SIZE + 20 {
        return Err(PackError::InvalidHeader("file too small".into()));
    }
    if &data[0..4] != PACK_SIGNATURE {
        return Err(PackError::InvalidHeader("bad PACK signature".into()));
    }
    let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if version != PACK_VERSION {
        return Err(PackError::UnsupportedVersion(version));
    }
    let num_objects = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    let pack_checksum = ObjectId::from_bytes(&data[data.len() - 20..], HashAlgorithm::Sha1)?;

    let mut entries: Vec<RawEntry> = Vec::with_capacity(num_objects as usize);
    let mut by_offset: HashMap<u64, usize> = HashMap::with_capacity(num_objects as usize);
    let mut pos = PACK_HEADER_SIZE as u64;

    for _ in 0..num_objects {
        let header = parse_entry_header(&data[pos as usize..], pos)?;
        let compressed = &data[header.data_offset as usize..];
        let (content, consumed) = decompress_counted(compressed, header.uncompressed_size, pos)?;

        let resolved = match header.entry_type {
            PackEntryType::Commit | PackEntryType::Tree | PackEntryType::Blob | PackEntryType::Tag => {
                let obj_type = header.entry_type.to_object_type().expect("non-delta type");
                let oid = hash_object(obj_type, &content)?;
                Some((obj_type, oid))
            }
            PackEntryType::OfsDelta { .. } | PackEntryType::RefDelta { .. } => None,
        };

        by_offset.insert(pos, entries.len());
        entries.push(RawEntry {
            offset: pos,
            header_size: header.header_size,
            compressed_len: consumed,
            entry_type: header.entry_type,
            content,
            resolved,
        });

        pos = header.data_offset + consumed as u64;
    }

    resolve_all_deltas(&mut entries, &by_offset, bases)?;

    let mut idx_entries: Vec<(ObjectId, u64, u32)> = Vec::with_capacity(entries.len());
    for e in &entries {
        let (_, oid) = e.resolved.expect("all entries resolved");
        let start = e.offset as usize;
        let end = start + e.header_size + e.compressed_len;
        let mut crc = crc32fast::Hasher::new();
        crc.update(&data[start..end]);
        idx_entries.push((oid, e.offset, crc.finalize()));
    }

    let idx_path = pack_path.with_extension("idx");
    build_pack_index(&idx_path, &mut idx_entries, &pack_checksum)?;

    Ok(IndexResult {
        idx_path,
        pack_checksum,
        object_count: entries.len() as u32,
    })
}

/// Resolve every delta entry to a fixed point: repeatedly sweep the list,
/// reconstructing any delta whose base is already resolved, until a sweep
/// makes no progress. This naturally handles REF_DELTA bases that appear
/// later in the pack than their delta (OFS_DELTA bases never need this —
/// their offset is always earlier, so they resolve within the first sweep
/// that reaches them).
fn resolve_all_deltas(
    entries: &mut [RawEntry],
    by_offset: &HashMap<u64, usize>,
    bases: &dyn BaseSource,
) -> Result<(), PackError> {
    let mut depth = vec![0usize; entries.len()];

    loop {
        let mut progress = false;
        for i in 0..entries.len() {
            if entries[i].resolved.is_some() {
                continue;
            }
            if try_resolve_one(entries, i, by_offset, &mut depth)? {
                progress = true;
            }
        }
        if !progress {
            break;
        }
    }

    for i in 0..entries.len() {
        if entries[i].resolved.is_some() {
            continue;
        }
        // Not resolvable from within the pack — fall back to the external
        // source for a thin-pack REF_DELTA base.
        let PackEntryType::RefDelta { base_oid } = entries[i].entry_type else {
            return Err(PackError::CorruptEntry(entries[i].offset));
        };
        let Some((base_type, base_content)) = bases.find(&base_oid) else {
            return Err(PackError::MissingBase(base_oid));
        };
        let delta_data = std::mem::take(&mut entries[i].content);
        let reconstructed = crate::delta::apply::apply_delta(&base_content, &delta_data)?;
        let oid = hash_object(base_type, &reconstructed)?;
        entries[i].content = reconstructed;
        entries[i].resolved = Some((base_type, oid));
    }

    Ok(())
}

/// Try to resolve `entries[idx]` assuming its base is already resolved.
/// Returns `Ok(true)` if it resolved this sweep, `Ok(false)` if its base
/// isn't ready yet, `Err` for a hard failure (cycle, chain too deep,
/// corrupt offset).
fn try_resolve_one(
    entries: &mut [RawEntry],
    idx: usize,
    by_offset: &HashMap<u64, usize>,
    depth: &mut [usize],
) -> Result<bool, PackError> {
    let base_idx = match entries[idx].entry_type {
        PackEntryType::OfsDelta { base_offset } => {
            let base_idx = *by_offset
                .get(&base_offset)
                .ok_or(PackError::CorruptEntry(entries[idx].offset))?;
            if base_idx == idx {
                return Err(PackError::DeltaBaseCycle(entries[idx].offset));
            }
            base_idx
        }
        PackEntryType::RefDelta { base_oid } => {
            match entries
                .iter()
                .position(|e| e.resolved.map(|(_, o)| o) == Some(base_oid))
            {
                Some(i) => i,
                None => return Ok(false),
            }
        }
        PackEntryType::Commit | PackEntryType::Tree | PackEntryType::Blob | PackEntryType::Tag => {
            unreachable!("base objects are resolved during pass one")
        }
    };

    if entries[base_idx].resolved.is_none() {
        return Ok(false);
    }

    let next_depth = depth[base_idx] + 1;
    if next_depth > MAX_DELTA_CHAIN_DEPTH {
        return Err(PackError::DeltaChainTooDeep {
            offset: entries[idx].offset,
            max_depth: MAX_DELTA_CHAIN_DEPTH,
        });
    }

    let base_type = entries[base_idx].resolved.unwrap().0;
    let base_content = entries[base_idx].content.clone();
    let delta_data = std::mem::take(&mut entries[idx].content);
    let reconstructed = crate::delta::apply::apply_delta(&base_content, &delta_data)?;
    let oid = hash_object(base_type, &reconstructed)?;

    entries[idx].content = reconstructed;
    entries[idx].resolved = Some((base_type, oid));
    depth[idx] = next_depth;
    Ok(true)
}

fn hash_object(obj_type: ObjectType, content: &[u8]) -> Result<ObjectId, PackError> {
    Hasher::hash_object(
        HashAlgorithm::Sha1,
        std::str::from_utf8(obj_type.as_bytes()).unwrap(),
        content,
    )
    .map_err(PackError::Hash)
}

fn decompress_counted(
    compressed: &[u8],
    expected_size: usize,
    offset: u64,
) -> Result<(Vec<u8>, usize), PackError> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut buf = Vec::with_capacity(expected_size);
    decoder
        .read_to_end(&mut buf)
        .map_err(|_| PackError::CorruptEntry(offset))?;
    let consumed = decoder.total_in() as usize;
    Ok((buf, consumed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::compute::compute_delta;
    use crate::write::PackWriter;
    use git_object::ObjectType;

    #[test]
    fn indexes_a_pack_with_only_base_objects() {
        let dir = tempfile::tempdir().unwrap();
        let pack_path = dir.path().join("p.pack");
        let mut writer = PackWriter::new(&pack_path).unwrap();
        writer.add_object(ObjectType::Blob, b"alpha").unwrap();
        writer.add_object(ObjectType::Blob, b"beta").unwrap();
        writer.finish().unwrap();

        let result = index_pack(&pack_path, &()).unwrap();
        assert_eq!(result.object_count, 2);
        assert!(result.idx_path.exists());

        let pack = crate::pack::PackFile::open(&pack_path).unwrap();
        let oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", b"alpha").unwrap();
        assert_eq!(pack.read_object(&oid).unwrap().unwrap().data, b"alpha");
    }

    #[test]
    fn indexes_a_pack_with_ofs_delta_chain() {
        let dir = tempfile::tempdir().unwrap();
        let pack_path = dir.path().join("p.pack");
        let base = vec![b'a'; 500];
        let mut mid = base.clone();
        mid.extend_from_slice(b"-mid");
        let mut tip = mid.clone();
        tip.extend_from_slice(b"-tip");

        let mut writer = PackWriter::new(&pack_path).unwrap();
        let base_offset = writer.current_offset();
        writer.add_object(ObjectType::Blob, &base).unwrap();

        let mid_offset = writer.current_offset();
        let delta1 = compute_delta(&base, &mid);
        let mid_oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", &mid).unwrap();
        writer.add_delta_ofs(base_offset, mid_oid, &delta1).unwrap();

        let delta2 = compute_delta(&mid, &tip);
        let tip_oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", &tip).unwrap();
        writer.add_delta_ofs(mid_offset, tip_oid, &delta2).unwrap();
        writer.finish().unwrap();

        let result = index_pack(&pack_path, &()).unwrap();
        assert_eq!(result.object_count, 3);

        let pack = crate::pack::PackFile::open(&pack_path).unwrap();
        assert_eq!(pack.read_object(&tip_oid).unwrap().unwrap().data, tip);
        assert_eq!(pack.read_object(&mid_oid).unwrap().unwrap().data, mid);
    }

    #[test]
    fn thin_pack_ref_delta_resolves_via_external_base() {
        struct MapSource(HashMap<ObjectId, (ObjectType, Vec<u8>)>);
        impl BaseSource for MapSource {
            fn find(&self, oid: &ObjectId) -> Option<(ObjectType, Vec<u8>)> {
                self.0.get(oid).cloned()
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let pack_path = dir.path().join("thin.pack");

        let base = b"the quick brown fox jumps over the lazy dog, repeatedly, for bulk";
        let mut target = base.to_vec();
        target.extend_from_slice(b" plus a tail");

        let base_oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", base).unwrap();
        let target_oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", &target).unwrap();
        let delta = compute_delta(base, &target);

        let mut writer = PackWriter::new(&pack_path).unwrap();
        writer.set_thin(true);
        writer.add_delta(base_oid, target_oid, &delta).unwrap();
        writer.finish().unwrap();

        let mut external = HashMap::new();
        external.insert(base_oid, (ObjectType::Blob, base.to_vec()));
        let source = MapSource(external);

        let result = index_pack(&pack_path, &source).unwrap();
        assert_eq!(result.object_count, 1);

        let pack = crate::pack::PackFile::open(&pack_path).unwrap();
        let obj = pack
            .read_object_with_resolver(&target_oid, |oid| source.find(oid))
            .unwrap()
            .unwrap();
        assert_eq!(obj.data, target);
    }

    #[test]
    fn missing_ref_delta_base_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let pack_path = dir.path().join("broken.pack");
        let base = b"content that will not actually be in the pack";
        let target = b"content that will not actually be in the pack either!";
        let base_oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", base).unwrap();
        let target_oid = Hasher::hash_object(HashAlgorithm::Sha1, "blob", target).unwrap();
        let delta = compute_delta(base, target);

        let mut writer = PackWriter::new(&pack_path).unwrap();
        writer.set_thin(true);
        writer.add_delta(base_oid, target_oid, &delta).unwrap();
        writer.finish().unwrap();

        let err = index_pack(&pack_path, &()).unwrap_err();
        assert!(matches!(err, PackError::MissingBase(_)));
    }
}
