//! Compute deltas between objects.
//!
//! Implements git's `diff-delta` strategy: a `DeltaIndex` built once over the
//! source buffer lets the encoder find candidate copy sources for every
//! 16-byte window of the target in roughly constant time per window, bounded
//! by a capped hash-chain walk rather than a linear scan.

use super::{encode_copy, encode_insert, write_varint};

/// Size of the block the rolling hash fingerprints.
const BLOCK_SIZE: usize = 16;

/// Chains longer than this are not walked past this many candidates; keeps
/// encode time roughly linear even on highly repetitive sources.
const MAX_CHAIN_LENGTH: usize = 64;

/// Minimum match length worth emitting as a copy instead of literal bytes.
const MIN_MATCH_LEN: usize = BLOCK_SIZE;

const HASH_BASE: u32 = 0x9E37_79B1;

/// `T[b]` holds `b * HASH_BASE^BLOCK_SIZE`, the contribution a byte leaving
/// the trailing edge of the window must be subtracted by when rolling.
/// `U[b]` is the contribution a byte newly entering the window adds.
/// Both are derived once; the roll itself is `O(1)`.
fn hash_tables() -> ([u32; 256], [u32; 256]) {
    let mut base_pow = 1u32;
    for _ in 0..BLOCK_SIZE {
        base_pow = base_pow.wrapping_mul(HASH_BASE);
    }
    let mut t = [0u32; 256];
    let mut u = [0u32; 256];
    for (b, (t_slot, u_slot)) in t.iter_mut().zip(u.iter_mut()).enumerate() {
        *t_slot = (b as u32).wrapping_mul(base_pow);
        *u_slot = b as u32;
    }
    (t, u)
}

/// Rabin-like polynomial fingerprint of a 16-byte block: 4-byte bootstrap
/// then a 12-step unrolled Horner accumulation.
fn hash_block(block: &[u8], u: &[u32; 256]) -> u32 {
    debug_assert_eq!(block.len(), BLOCK_SIZE);
    let mut h = u32::from_be_bytes([block[0], block[1], block[2], block[3]]);
    for &byte in &block[4..BLOCK_SIZE] {
        h = h.wrapping_mul(HASH_BASE).wrapping_add(u[byte as usize]);
    }
    h
}

/// One-step rolling update: drop `removed` from the trailing edge, admit
/// `added` at the leading edge.
#[inline]
fn step(hash: u32, removed: u8, added: u8, t: &[u32; 256], u: &[u32; 256]) -> u32 {
    hash.wrapping_mul(HASH_BASE)
        .wrapping_sub(t[removed as usize])
        .wrapping_add(u[added as usize])
}

/// Chained hash table over every overlapping 16-byte block of the source.
///
/// `table[slot]` is the most recently inserted block offset hashing to that
/// slot; `next[]` links each offset back to the previous one with the same
/// hash, so a lookup walks a chain of candidates rather than scanning the
/// whole source.
pub struct DeltaIndex<'s> {
    source: &'s [u8],
    mask: usize,
    table: Vec<i64>,
    next: std::collections::HashMap<usize, i64>,
    t: [u32; 256],
    u: [u32; 256],
}

impl<'s> DeltaIndex<'s> {
    pub fn new(source: &'s [u8]) -> Self {
        let (t, u) = hash_tables();
        let block_count = source.len().saturating_sub(BLOCK_SIZE).saturating_add(1);
        let table_size = block_count.max(1).next_power_of_two();
        let mask = table_size - 1;
        let mut table = vec![-1i64; table_size];
        let mut next = std::collections::HashMap::new();

        if source.len() >= BLOCK_SIZE {
            let mut hash = hash_block(&source[0..BLOCK_SIZE], &u);
            for offset in 0..=source.len() - BLOCK_SIZE {
                if offset > 0 {
                    let removed = source[offset - 1];
                    let added = source[offset + BLOCK_SIZE - 1];
                    hash = step(hash, removed, added, &t, &u);
                }
                let slot = (hash as usize) & mask;
                next.insert(offset, table[slot]);
                table[slot] = offset as i64;
            }
        }

        Self {
            source,
            mask,
            table,
            next,
            t,
            u,
        }
    }

    fn hash_at(&self, data: &[u8]) -> u32 {
        hash_block(data, &self.u)
    }

    /// Best match for `target[tpos..]` against the source, if any candidate
    /// in the hash chain (capped at `MAX_CHAIN_LENGTH`) agrees on the full
    /// 16-byte block. Returns `(source_offset, match_len)`.
    fn best_match(&self, hash: u32, target: &[u8], tpos: usize) -> Option<(usize, usize)> {
        let slot = (hash as usize) & self.mask;
        let mut cand = self.table[slot];
        let mut steps = 0;
        let mut best: Option<(usize, usize)> = None;

        while cand >= 0 && steps < MAX_CHAIN_LENGTH {
            let src_off = cand as usize;
            if self.source[src_off..src_off + BLOCK_SIZE] == target[tpos..tpos + BLOCK_SIZE] {
                let len = extend_forward(self.source, src_off, target, tpos);
                if best.map_or(true, |(_, best_len)| len > best_len) {
                    best = Some((src_off, len));
                }
            }
            cand = *self.next.get(&src_off).unwrap_or(&-1);
            steps += 1;
        }
        best
    }
}

fn extend_forward(source: &[u8], src_off: usize, target: &[u8], tgt_off: usize) -> usize {
    let max_len = (source.len() - src_off).min(target.len() - tgt_off);
    let mut len = BLOCK_SIZE;
    while len < max_len && source[src_off + len] == target[tgt_off + len] {
        len += 1;
    }
    len
}

/// Extend a match backwards into the pending-insert region, shortening the
/// literal run that would otherwise precede the copy. Returns the number of
/// bytes the match grew by (and therefore how many trailing insert bytes to
/// drop).
fn extend_backward(source: &[u8], src_off: usize, target: &[u8], tgt_off: usize, insert_len: usize) -> usize {
    let mut grown = 0;
    while grown < insert_len
        && src_off > grown
        && source[src_off - grown - 1] == target[tgt_off - grown - 1]
    {
        grown += 1;
    }
    grown
}

/// Compute a delta that transforms `source` into `target`.
///
/// Returns the raw delta byte stream that can be applied with `apply_delta`.
pub fn compute_delta(source: &[u8], target: &[u8]) -> Vec<u8> {
    compute_delta_limited(source, target, None).expect("unbounded compute_delta never aborts")
}

/// As `compute_delta`, but aborts (returning `None`) once the cumulative
/// encoded length would exceed `limit`. Mirrors the writer's `deltaSizeLimit`
/// early-out so a too-large delta never displaces a full-object write.
pub fn compute_delta_limited(source: &[u8], target: &[u8], limit: Option<usize>) -> Option<Vec<u8>> {
    let mut delta = Vec::new();
    delta.extend_from_slice(&write_varint(source.len()));
    delta.extend_from_slice(&write_varint(target.len()));

    if target.is_empty() {
        return Some(delta);
    }
    if source.len() < BLOCK_SIZE {
        flush_insert_all(&mut delta, target);
        return check_limit(delta, limit);
    }

    let index = DeltaIndex::new(source);
    let mut tpos = 0usize;
    let mut pending: Vec<u8> = Vec::new();
    let mut hash = 0u32;
    let mut hash_valid = false;

    while tpos < target.len() {
        let remaining = target.len() - tpos;
        if remaining < BLOCK_SIZE {
            pending.extend_from_slice(&target[tpos..]);
            tpos = target.len();
            break;
        }

        if !hash_valid {
            hash = index.hash_at(&target[tpos..tpos + BLOCK_SIZE]);
            hash_valid = true;
        }

        if let Some((src_off, fwd_len)) = index.best_match(hash, target, tpos) {
            // Bias backward: shrink the pending insert if the match also
            // covers its tail. `tpos` still advances by `fwd_len` only — the
            // backward-absorbed bytes were already at positions < tpos.
            let mut copy_src_off = src_off;
            let mut copy_len = fwd_len;
            if !pending.is_empty() {
                let grown = extend_backward(source, src_off, target, tpos, pending.len());
                if grown > 0 {
                    copy_src_off -= grown;
                    copy_len += grown;
                    pending.truncate(pending.len() - grown);
                }
            }

            flush_insert_all(&mut delta, &pending);
            pending.clear();
            emit_copy(&mut delta, copy_src_off, copy_len);
            if check_limit_inplace(&delta, limit).is_none() {
                return None;
            }
            tpos += fwd_len;
            hash_valid = false;
            continue;
        }

        pending.push(target[tpos]);
        if pending.len() == 127 {
            flush_insert(&mut delta, &mut pending);
            if check_limit_inplace(&delta, limit).is_none() {
                return None;
            }
        }

        if tpos + BLOCK_SIZE < target.len() {
            let removed = target[tpos];
            let added = target[tpos + BLOCK_SIZE];
            hash = step(hash, removed, added, &index.t, &index.u);
        } else {
            hash_valid = false;
        }
        tpos += 1;
    }

    flush_insert_all(&mut delta, &pending);
    check_limit(delta, limit)
}

fn check_limit(delta: Vec<u8>, limit: Option<usize>) -> Option<Vec<u8>> {
    match limit {
        Some(limit) if delta.len() > limit => None,
        _ => Some(delta),
    }
}

fn check_limit_inplace(delta: &[u8], limit: Option<usize>) -> Option<()> {
    match limit {
        Some(limit) if delta.len() > limit => None,
        _ => Some(()),
    }
}

fn flush_insert_all(delta: &mut Vec<u8>, data: &[u8]) {
    let mut pending = data.to_vec();
    flush_insert(delta, &mut pending);
}

/// Flush pending insert bytes as one or more insert instructions.
fn flush_insert(delta: &mut Vec<u8>, pending: &mut Vec<u8>) {
    while !pending.is_empty() {
        let chunk_len = std::cmp::min(pending.len(), 127);
        let chunk: Vec<u8> = pending.drain(..chunk_len).collect();
        delta.extend_from_slice(&encode_insert(&chunk));
    }
}

/// Emit a copy instruction, splitting into multiple if needed (max copy size = 0xffffff).
fn emit_copy(delta: &mut Vec<u8>, offset: usize, mut size: usize) {
    let mut off = offset;
    while size > 0 {
        let chunk = std::cmp::min(size, 0x00ff_ffff); // max 24-bit size
        delta.extend_from_slice(&encode_copy(off as u64, chunk));
        off += chunk;
        size -= chunk;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::apply::apply_delta;

    fn roundtrip(source: &[u8], target: &[u8]) -> Vec<u8> {
        let delta = compute_delta(source, target);
        let result = apply_delta(source, &delta).unwrap();
        assert_eq!(result, target);
        delta
    }

    #[test]
    fn identical_objects() {
        let data = b"Hello, World! This is a test of delta compression.";
        roundtrip(data, data);
    }

    #[test]
    fn completely_different() {
        let source = b"AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
        let target = b"BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB";
        roundtrip(source, target);
    }

    #[test]
    fn empty_target() {
        let source = b"something";
        let target = b"";
        roundtrip(source, target);
    }

    #[test]
    fn empty_source() {
        let source = b"";
        let target = b"new content here";
        roundtrip(source, target);
    }

    #[test]
    fn prepend_data() {
        let source = b"0123456789abcdef0123456789abcdef"; // 32 bytes
        let mut target = b"PREPENDED_".to_vec();
        target.extend_from_slice(source);
        roundtrip(source, &target);
    }

    #[test]
    fn append_data() {
        let source = b"0123456789abcdef0123456789abcdef"; // 32 bytes
        let mut target = source.to_vec();
        target.extend_from_slice(b"_APPENDED");
        roundtrip(source, &target);
    }

    #[test]
    fn large_similar_objects() {
        let source: Vec<u8> = (0..4096).map(|i| (i % 256) as u8).collect();
        let mut target = source.clone();
        target[2048] = 0xFF;
        target[2049] = 0xFE;
        target[2050] = 0xFD;

        let delta = roundtrip(&source, &target);
        assert!(delta.len() < target.len());
    }

    #[test]
    fn s3_scenario_small_edit_in_large_buffer() {
        // spec S3: 4 KiB of 'a', 8 bytes replaced in the middle.
        let source = vec![b'a'; 4096];
        let mut target = source.clone();
        target[2048..2056].copy_from_slice(b"ZZZZZZZZ");
        let delta = roundtrip(&source, &target);
        assert!(delta.len() <= 40, "delta too large: {}", delta.len());
    }

    #[test]
    fn backward_bias_shrinks_preceding_insert() {
        // Target has a literal run immediately followed by a region that,
        // if the match is extended backward, absorbs part of that run.
        let source = b"XXXXXXXXXXXXXXXXabcdefghijklmnop".to_vec();
        let mut target = b"prefix-".to_vec();
        target.extend_from_slice(b"XXXXXXXXXXXXXXXXabcdefghijklmnop");
        roundtrip(&source, &target);
    }

    #[test]
    fn delta_size_limit_aborts() {
        let source = b"AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
        let target = b"BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB";
        assert!(compute_delta_limited(source, target, Some(1)).is_none());
    }

    #[test]
    fn rolling_hash_matches_fresh_hash() {
        let (t, u) = hash_tables();
        let data: Vec<u8> = (0..64).map(|i| (i * 7 % 251) as u8).collect();
        let mut hash = hash_block(&data[0..BLOCK_SIZE], &u);
        for offset in 1..=data.len() - BLOCK_SIZE {
            hash = step(hash, data[offset - 1], data[offset + BLOCK_SIZE - 1], &t, &u);
            let fresh = hash_block(&data[offset..offset + BLOCK_SIZE], &u);
            assert_eq!(hash, fresh, "mismatch at offset {offset}");
        }
    }
}
