//! Content-addressed offset table and the two-stage dedup lookup (C5).
//!
//! Grounded on `SSWIMMA.py`'s `RefCounts` rebuild (every resource's refcount
//! is reconstructed from the existing offset table before an append, then
//! bumped as new content is processed) and `SSWIMMX.py`'s `export()` (copies
//! only resources with a positive refcount and recomputes counts to match the
//! exported images) — see spec §4.5.

use crate::error::FormatError;
use crate::hash::Sha1Key;
use crate::records::{OffsetTableEntry, ResourceHeader, OFFSET_TABLE_ENTRY_SIZE, RESFLAG_FREE};
use std::collections::HashMap;

/// The in-memory form of the on-disk offset table: every resource the
/// archive currently knows about, indexed by content hash for O(1) dedup
/// lookups. Disk order is insertion order and carries no meaning (spec
/// §4.5's "readers must tolerate arbitrary order").
#[derive(Debug, Default, Clone)]
pub struct OffsetTable {
    entries: Vec<OffsetTableEntry>,
    index: HashMap<Sha1Key, usize>,
}

impl OffsetTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<OffsetTableEntry>) -> Self {
        let mut t = Self { entries: Vec::with_capacity(entries.len()), index: HashMap::new() };
        for e in entries {
            t.push(e);
        }
        t
    }

    fn push(&mut self, entry: OffsetTableEntry) {
        let idx = self.entries.len();
        self.index.insert(entry.hash, idx);
        self.entries.push(entry);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() % OFFSET_TABLE_ENTRY_SIZE != 0 {
            return Err(FormatError::Truncated { needed: OFFSET_TABLE_ENTRY_SIZE, found: buf.len() });
        }
        let mut entries = Vec::with_capacity(buf.len() / OFFSET_TABLE_ENTRY_SIZE);
        for chunk in buf.chunks_exact(OFFSET_TABLE_ENTRY_SIZE) {
            entries.push(OffsetTableEntry::decode(chunk)?);
        }
        Ok(Self::from_entries(entries))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * OFFSET_TABLE_ENTRY_SIZE);
        for e in &self.entries {
            out.extend_from_slice(&e.encode());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OffsetTableEntry> {
        self.entries.iter()
    }

    pub fn get(&self, hash: &Sha1Key) -> Option<&OffsetTableEntry> {
        self.index.get(hash).map(|&i| &self.entries[i])
    }

    /// Entries whose resource header carries the `metadata` flag — the
    /// image metadata resources, identified and enumerated separately from
    /// file content (spec §4.5's tie-break rule).
    pub fn metadata_entries(&self) -> impl Iterator<Item = &OffsetTableEntry> {
        self.entries.iter().filter(|e| e.resource.is_metadata())
    }

    /// `capture`/`append`: bump an existing entry's refcount, or insert a
    /// fresh one with refcount 1.
    pub fn bump_or_insert(&mut self, hash: Sha1Key, resource: ResourceHeader, part_number: u16) -> u32 {
        if let Some(&idx) = self.index.get(&hash) {
            let e = &mut self.entries[idx];
            e.ref_count += 1;
            e.ref_count
        } else {
            self.push(OffsetTableEntry { resource, part_number, ref_count: 1, hash });
            1
        }
    }

    /// `export`: insert a resource with an explicit refcount already
    /// recomputed by the caller, rather than incrementing one entry at a
    /// time.
    pub fn insert_with_count(&mut self, hash: Sha1Key, resource: ResourceHeader, part_number: u16, ref_count: u32) {
        self.push(OffsetTableEntry { resource, part_number, ref_count, hash });
    }

    /// `delete`/`update`: decrement one reference. Entries that reach zero
    /// are kept — only flagged free — so existing offsets stay valid;
    /// reclaiming the space is `export`'s job, not delete's (spec §4.5).
    pub fn decrement(&mut self, hash: &Sha1Key) -> Option<u32> {
        let idx = *self.index.get(hash)?;
        let e = &mut self.entries[idx];
        e.ref_count = e.ref_count.saturating_sub(1);
        if e.ref_count == 0 {
            e.resource.set_flags(e.resource.flags() | RESFLAG_FREE);
        }
        Some(e.ref_count)
    }

    /// `update` on image `i`: decrement by the number of times image `i`
    /// referenced this resource, not just once.
    pub fn decrement_by(&mut self, hash: &Sha1Key, n: u32) -> Option<u32> {
        let mut last = None;
        for _ in 0..n {
            last = self.decrement(hash);
        }
        last
    }
}

/// The "chunk-hash table built incrementally in memory" from spec §4.5: maps
/// a file's first-32-KiB prefilter hash to every full content hash observed
/// so far that shares that prefix. Distinct contents sharing a 32 KiB prefix
/// are rare but not impossible, so each prefilter key fans out to a list.
#[derive(Debug, Default, Clone)]
pub struct PrefilterIndex {
    by_prefix: HashMap<Sha1Key, Vec<Sha1Key>>,
}

impl PrefilterIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `full` was observed with prefilter hash `prefix` so a
    /// later capture of the same content is recognized at stage 1.
    pub fn record(&mut self, prefix: Sha1Key, full: Sha1Key) {
        let bucket = self.by_prefix.entry(prefix).or_default();
        if !bucket.contains(&full) {
            bucket.push(full);
        }
    }

    /// Candidates worth a full-hash comparison for a file whose first 32 KiB
    /// hashed to `prefix`. Empty means stage 1 should treat the file as
    /// unique outright (spec §4.5 step 1).
    pub fn candidates(&self, prefix: &Sha1Key) -> &[Sha1Key] {
        self.by_prefix.get(prefix).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// What a caller should do with a file about to be captured, decided purely
/// from the prefilter hash before touching the file a second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefilterDecision {
    /// No known content shares this 32 KiB prefix: compress while hashing on
    /// the fly, then reconcile with [`Deduplicator::resolve_after_compress`].
    LikelyUnique,
    /// At least one known content shares this prefix: read the file again,
    /// compute the full hash, and check
    /// [`Deduplicator::lookup_full`] before compressing at all.
    CheckFullHash,
}

/// Owns the offset table and the prefilter index together, and implements
/// the exact two-stage lookup spec §4.5 describes.
#[derive(Debug, Default)]
pub struct Deduplicator {
    pub table: OffsetTable,
    prefilter: PrefilterIndex,
}

/// What happened when a freshly computed full hash was reconciled against
/// the table, either before or after compressing the candidate's bytes.
#[derive(Debug, Clone, Copy)]
pub enum ResolveOutcome {
    /// No existing entry for this hash; the caller's freshly written bytes
    /// become a new offset-table entry.
    New { ref_count: u32 },
    /// An entry already existed and its refcount was bumped; if the caller
    /// already wrote bytes for this content (the stage-1 "compress first"
    /// path), it must rewind its output stream and discard them.
    Duplicate { ref_count: u32 },
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_table(table: OffsetTable) -> Self {
        Self { table, prefilter: PrefilterIndex::new() }
    }

    /// Stage 1 of spec §4.5: decide from the prefilter hash alone whether a
    /// full comparison is worth the second read.
    pub fn decide(&self, prefilter_hash: Sha1Key) -> PrefilterDecision {
        if self.prefilter.candidates(&prefilter_hash).is_empty() {
            PrefilterDecision::LikelyUnique
        } else {
            PrefilterDecision::CheckFullHash
        }
    }

    /// Stage 2's early-out: the prefilter matched, so the caller read the
    /// file again and has a full hash in hand *before* compressing anything.
    /// A hit means skip compression entirely.
    pub fn lookup_full(&self, full_hash: &Sha1Key) -> Option<&OffsetTableEntry> {
        self.table.get(full_hash)
    }

    /// Reconcile a full hash computed while (or after) compressing a
    /// candidate's bytes: insert if unique, bump if a duplicate slipped
    /// through the prefilter (e.g. a fresh prefix never seen before that
    /// nonetheless collides in full — spec §4.5 step 1's rare case).
    pub fn resolve_after_compress(
        &mut self,
        prefilter_hash: Sha1Key,
        full_hash: Sha1Key,
        resource: ResourceHeader,
        part_number: u16,
    ) -> ResolveOutcome {
        self.prefilter.record(prefilter_hash, full_hash);
        if let Some(existing) = self.table.get(&full_hash) {
            let ref_count = existing.ref_count + 1;
            self.table.bump_or_insert(full_hash, resource, part_number);
            ResolveOutcome::Duplicate { ref_count }
        } else {
            let ref_count = self.table.bump_or_insert(full_hash, resource, part_number);
            ResolveOutcome::New { ref_count }
        }
    }

    /// Stage 2's hit path: the full hash was already known before any bytes
    /// were written.
    pub fn bump_known(&mut self, full_hash: &Sha1Key) -> Option<u32> {
        let idx = *self.table.index.get(full_hash)?;
        let e = &mut self.table.entries[idx];
        e.ref_count += 1;
        Some(e.ref_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rh(offset: u64) -> ResourceHeader {
        ResourceHeader::new(offset, 10, 10, 0)
    }

    #[test]
    fn bump_or_insert_inserts_then_bumps() {
        let mut t = OffsetTable::new();
        let h = Sha1Key([1u8; 20]);
        assert_eq!(t.bump_or_insert(h, rh(208), 1), 1);
        assert_eq!(t.bump_or_insert(h, rh(208), 1), 2);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn decrement_flags_free_at_zero_but_keeps_entry() {
        let mut t = OffsetTable::new();
        let h = Sha1Key([2u8; 20]);
        t.bump_or_insert(h, rh(300), 1);
        assert_eq!(t.decrement(&h), Some(0));
        assert_eq!(t.len(), 1);
        assert!(t.get(&h).unwrap().resource.is_free());
    }

    #[test]
    fn offset_table_roundtrip_through_bytes() {
        let mut t = OffsetTable::new();
        t.bump_or_insert(Sha1Key([3u8; 20]), rh(400), 1);
        t.bump_or_insert(Sha1Key([4u8; 20]), rh(500), 1);
        let bytes = t.encode();
        let back = OffsetTable::decode(&bytes).unwrap();
        assert_eq!(back.len(), 2);
        assert!(back.get(&Sha1Key([3u8; 20])).is_some());
    }

    #[test]
    fn prefilter_decision_flow() {
        let mut dedup = Deduplicator::new();
        let prefix = Sha1Key([9u8; 20]);
        let full = Sha1Key([10u8; 20]);
        assert_eq!(dedup.decide(prefix), PrefilterDecision::LikelyUnique);

        let outcome = dedup.resolve_after_compress(prefix, full, rh(208), 1);
        assert!(matches!(outcome, ResolveOutcome::New { ref_count: 1 }));

        // A second file with the same prefix now triggers a full check.
        assert_eq!(dedup.decide(prefix), PrefilterDecision::CheckFullHash);
        assert!(dedup.lookup_full(&full).is_some());

        let bumped = dedup.bump_known(&full).unwrap();
        assert_eq!(bumped, 2);
    }

    #[test]
    fn update_decrements_by_reference_count_in_one_image() {
        let mut t = OffsetTable::new();
        let h = Sha1Key([5u8; 20]);
        t.bump_or_insert(h, rh(600), 1);
        t.bump_or_insert(h, rh(600), 1);
        t.bump_or_insert(h, rh(600), 1);
        assert_eq!(t.decrement_by(&h, 2), Some(1));
        assert!(!t.get(&h).unwrap().resource.is_free());
    }
}
