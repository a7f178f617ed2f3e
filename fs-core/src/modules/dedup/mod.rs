//! Deduplication index and block reference ledger
//!
//! Every refcounted data block has exactly one entry here, keyed by its
//! physical block number. When the dedup feature is on, entries are also
//! chained into a fixed 65536-bucket hash table keyed by content hash so
//! identical payloads can be found and shared.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Cursor, Read, Write};

use crate::block_bitmap::Allocator;
use crate::error::{Error, Result};
use crate::format::{
    CompressionAlgorithm, DedupRecord, EncryptionAlgorithm, Extent, DEDUP_RECORD_SIZE,
};
use crate::modules::codec::Hash;

/// Number of hash buckets
pub const DEDUP_BUCKETS: usize = 65536;

/// Dedup table stream magic ("ADDT")
const TABLE_MAGIC: u32 = u32::from_le_bytes(*b"ADDT");
const TABLE_HEADER: usize = 16;
const NIL: u32 = u32::MAX;

/// One distinct stored block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupEntry {
    pub hash: Hash,
    pub physical: u64,
    pub refcount: u32,
    pub stored_size: u32,
    pub logical_size: u32,
    pub compression: CompressionAlgorithm,
    pub encryption: EncryptionAlgorithm,
    /// Extent flags the payload was written with
    pub flags: u32,
    pub nonce: [u8; 12],
    pub tag: [u8; 16],
    next: u32,
}

impl DedupEntry {
    /// Entry for a newly written block, refcount 1
    pub fn from_extent(extent: &Extent) -> Self {
        Self {
            hash: extent.hash,
            physical: extent.physical,
            refcount: 1,
            stored_size: extent.stored_size,
            logical_size: extent.logical_size,
            compression: extent.compression,
            encryption: extent.encryption,
            flags: extent.flags,
            nonce: extent.nonce,
            tag: extent.tag,
            next: NIL,
        }
    }

    /// Extent record sharing this entry's block
    pub fn to_extent(&self, logical: u64) -> Extent {
        Extent {
            logical,
            physical: self.physical,
            length: 1,
            flags: self.flags,
            refcount: self.refcount,
            stored_size: self.stored_size,
            logical_size: self.logical_size,
            compression: self.compression,
            encryption: self.encryption,
            hash: self.hash,
            nonce: self.nonce,
            tag: self.tag,
        }
    }

    /// Persisted form; `next` is a record index within the same stream
    fn to_record(&self, next: u32) -> DedupRecord {
        DedupRecord {
            hash: self.hash,
            physical: self.physical,
            refcount: self.refcount,
            stored_size: self.stored_size,
            logical_size: self.logical_size,
            compression: self.compression,
            encryption: self.encryption,
            flags: self.flags,
            nonce: self.nonce,
            tag: self.tag,
            next,
        }
    }

    fn from_record(record: DedupRecord) -> Self {
        Self {
            hash: record.hash,
            physical: record.physical,
            refcount: record.refcount,
            stored_size: record.stored_size,
            logical_size: record.logical_size,
            compression: record.compression,
            encryption: record.encryption,
            flags: record.flags,
            nonce: record.nonce,
            tag: record.tag,
            next: NIL,
        }
    }
}

/// Dedup counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    /// Writes that shared an existing block
    pub hits: u64,
    /// Writes that stored a new block
    pub misses: u64,
    /// Hash hits whose content differed on verification
    pub collisions: u64,
    /// Blocks released at refcount zero
    pub released: u64,
}

/// Content-hash index plus the per-block reference ledger
pub struct DedupIndex {
    slots: Vec<Option<DedupEntry>>,
    free_slots: Vec<u32>,
    by_block: HashMap<u64, u32>,
    /// Bucket heads; `None` when the dedup feature is off or after release
    buckets: Option<Vec<u32>>,
    stats: DedupStats,
}

impl DedupIndex {
    /// Empty index; allocates the bucket table only when `enabled`
    pub fn new(enabled: bool) -> Result<Self> {
        let buckets = if enabled {
            let mut table: Vec<u32> = Vec::new();
            table
                .try_reserve_exact(DEDUP_BUCKETS)
                .map_err(|_| Error::OutOfMemory)?;
            table.resize(DEDUP_BUCKETS, NIL);
            Some(table)
        } else {
            None
        };
        Ok(Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            by_block: HashMap::new(),
            buckets,
            stats: DedupStats::default(),
        })
    }

    /// Whether content lookups are active
    pub fn is_enabled(&self) -> bool {
        self.buckets.is_some()
    }

    fn bucket_of(hash: &Hash) -> usize {
        u16::from_le_bytes([hash[0], hash[1]]) as usize
    }

    fn entry(&self, slot: u32) -> Option<&DedupEntry> {
        self.slots.get(slot as usize).and_then(|e| e.as_ref())
    }

    /// Entry holding content `hash`, if any
    ///
    /// Walks the bucket chain comparing full hashes. Always `None` while
    /// the bucket table is not allocated.
    pub fn find(&self, hash: &Hash) -> Option<&DedupEntry> {
        self.find_matching(hash, |_| true)
    }

    /// Like [`find`](Self::find) but skips entries rejected by `accept`
    pub fn find_matching(
        &self,
        hash: &Hash,
        accept: impl Fn(&DedupEntry) -> bool,
    ) -> Option<&DedupEntry> {
        let buckets = self.buckets.as_ref()?;
        let mut slot = buckets[Self::bucket_of(hash)];
        while slot != NIL {
            let entry = self.entry(slot)?;
            if &entry.hash == hash && accept(entry) {
                return Some(entry);
            }
            slot = entry.next;
        }
        None
    }

    /// Track a freshly written block with refcount 1
    pub fn add(&mut self, mut entry: DedupEntry) -> Result<()> {
        if self.by_block.contains_key(&entry.physical) {
            return Err(Error::invalid(format!(
                "block {} is already tracked",
                entry.physical
            )));
        }
        entry.refcount = 1;
        entry.next = NIL;
        self.stats.misses += 1;
        self.insert(entry);
        Ok(())
    }

    /// Track an existing block with a known reference count
    ///
    /// Used when rebuilding the ledger from the extent chains; does not
    /// count as a miss.
    pub fn restore(&mut self, mut entry: DedupEntry, refcount: u32) -> Result<()> {
        if refcount == 0 {
            return Err(Error::invalid(format!(
                "block {} restored without references",
                entry.physical
            )));
        }
        if self.by_block.contains_key(&entry.physical) {
            return Err(Error::invalid(format!(
                "block {} is already tracked",
                entry.physical
            )));
        }
        entry.refcount = refcount;
        entry.next = NIL;
        self.insert(entry);
        Ok(())
    }

    fn insert(&mut self, mut entry: DedupEntry) {
        let slot = match self.free_slots.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(None);
                (self.slots.len() - 1) as u32
            }
        };
        if let Some(buckets) = self.buckets.as_mut() {
            let bucket = Self::bucket_of(&entry.hash);
            entry.next = buckets[bucket];
            buckets[bucket] = slot;
        }
        log::trace!(
            "DEDUP: tracking block {} (refcount {})",
            entry.physical,
            entry.refcount
        );
        self.by_block.insert(entry.physical, slot);
        self.slots[slot as usize] = Some(entry);
    }

    /// Take one more reference on `physical`
    pub fn inc_refcount(&mut self, physical: u64) -> Result<u32> {
        let slot = *self.by_block.get(&physical).ok_or(Error::NotFound)?;
        let entry = self.slots[slot as usize]
            .as_mut()
            .ok_or(Error::NotFound)?;
        entry.refcount = entry
            .refcount
            .checked_add(1)
            .ok_or_else(|| Error::invalid(format!("refcount overflow on block {}", physical)))?;
        log::trace!("DEDUP: block {} refcount -> {}", physical, entry.refcount);
        Ok(entry.refcount)
    }

    /// Record a content hit: one more reference on `physical`
    pub fn share(&mut self, physical: u64) -> Result<u32> {
        let count = self.inc_refcount(physical)?;
        self.stats.hits += 1;
        Ok(count)
    }

    /// Drop one reference on `physical`
    ///
    /// At zero the entry is unlinked and the block goes back to `alloc`.
    pub fn dec_refcount(&mut self, physical: u64, alloc: &mut Allocator) -> Result<u32> {
        let slot = *self.by_block.get(&physical).ok_or(Error::NotFound)?;
        let entry = self.slots[slot as usize]
            .as_mut()
            .ok_or(Error::NotFound)?;
        if entry.refcount > 1 {
            entry.refcount -= 1;
            log::trace!("DEDUP: block {} refcount -> {}", physical, entry.refcount);
            return Ok(entry.refcount);
        }

        // The entry stays intact if the block cannot be freed
        alloc.free(physical, 1)?;
        self.unlink(slot);
        self.stats.released += 1;
        log::debug!("DEDUP: block {} released", physical);
        Ok(0)
    }

    fn unlink(&mut self, slot: u32) {
        let Some(entry) = self.slots[slot as usize].take() else {
            return;
        };
        self.by_block.remove(&entry.physical);
        self.free_slots.push(slot);

        let Some(buckets) = self.buckets.as_mut() else {
            return;
        };
        let bucket = Self::bucket_of(&entry.hash);
        if buckets[bucket] == slot {
            buckets[bucket] = entry.next;
            return;
        }
        let mut cur = buckets[bucket];
        while cur != NIL {
            let next = match self.slots[cur as usize].as_ref() {
                Some(e) => e.next,
                None => break,
            };
            if next == slot {
                if let Some(prev) = self.slots[cur as usize].as_mut() {
                    prev.next = entry.next;
                }
                return;
            }
            cur = next;
        }
    }

    /// Current refcount of `physical`, if tracked
    pub fn refcount(&self, physical: u64) -> Option<u32> {
        self.entry_for_block(physical).map(|e| e.refcount)
    }

    pub fn entry_for_block(&self, physical: u64) -> Option<&DedupEntry> {
        self.by_block.get(&physical).and_then(|&slot| self.entry(slot))
    }

    pub fn len(&self) -> usize {
        self.by_block.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_block.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DedupEntry> {
        self.slots.iter().filter_map(|e| e.as_ref())
    }

    pub fn stats(&self) -> DedupStats {
        self.stats
    }

    pub(crate) fn note_collision(&mut self) {
        self.stats.collisions += 1;
    }

    /// Drop the bucket table; lookups stop matching, the ledger stays
    pub fn release_table(&mut self) {
        if self.buckets.take().is_some() {
            log::debug!("DEDUP: hash table released");
        }
    }

    /// Serialise the ledger for the dedup-table inode
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let count = self.len();
        let mut out = Vec::with_capacity(TABLE_HEADER + count * DEDUP_RECORD_SIZE);
        out.write_u32::<LittleEndian>(TABLE_MAGIC)?;
        out.write_u32::<LittleEndian>(count as u32)?;
        out.write_u64::<LittleEndian>(0)?;

        // Records are written in slot order with free slots skipped, so bucket
        // links are renumbered to record indices
        let mut record_of = vec![NIL; self.slots.len()];
        for (index, slot) in self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_some())
            .map(|(slot, _)| slot)
            .enumerate()
        {
            record_of[slot] = index as u32;
        }
        for entry in self.iter() {
            let next = record_of.get(entry.next as usize).copied().unwrap_or(NIL);
            out.write_all(&entry.to_record(next).encode()?)?;
        }
        Ok(out)
    }

    /// Rebuild an index from [`to_bytes`](Self::to_bytes) output
    pub fn from_bytes(bytes: &[u8], enabled: bool) -> Result<Self> {
        let mut index = Self::new(enabled)?;
        if bytes.is_empty() {
            return Ok(index);
        }
        let mut cursor = Cursor::new(bytes);
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != TABLE_MAGIC {
            return Err(Error::format(format!("bad dedup table magic {:#010x}", magic)));
        }
        let count = cursor.read_u32::<LittleEndian>()? as usize;
        let _reserved = cursor.read_u64::<LittleEndian>()?;
        if TABLE_HEADER + count * DEDUP_RECORD_SIZE > bytes.len() {
            return Err(Error::format(format!(
                "dedup table claims {} records in {} bytes",
                count,
                bytes.len()
            )));
        }

        let mut buf = [0u8; DEDUP_RECORD_SIZE];
        for _ in 0..count {
            cursor.read_exact(&mut buf)?;
            let entry = DedupEntry::from_record(DedupRecord::decode(&buf)?);
            if index.by_block.contains_key(&entry.physical) {
                return Err(Error::format(format!(
                    "dedup table lists block {} twice",
                    entry.physical
                )));
            }
            index.insert(entry);
        }
        log::info!(
            "DEDUP: loaded {} entries (lookups {})",
            index.len(),
            if enabled { "on" } else { "off" }
        );
        Ok(index)
    }
}

impl std::fmt::Debug for DedupIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupIndex")
            .field("entries", &self.len())
            .field("enabled", &self.is_enabled())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;

    fn entry(hash: Hash, physical: u64) -> DedupEntry {
        DedupEntry {
            hash,
            physical,
            refcount: 1,
            stored_size: 100,
            logical_size: 4096,
            compression: CompressionAlgorithm::Lz4,
            encryption: EncryptionAlgorithm::None,
            flags: 0,
            nonce: [0u8; 12],
            tag: [0u8; 16],
            next: NIL,
        }
    }

    fn hash(first: u8, second: u8, rest: u8) -> Hash {
        let mut h = [rest; 32];
        h[0] = first;
        h[1] = second;
        h
    }

    #[test]
    fn test_find_add_share() {
        let mut alloc = Allocator::new(&Layout::new(1024));
        let mut index = DedupIndex::new(true).unwrap();
        let block = alloc.allocate(1).unwrap();
        let h = hash(1, 2, 3);

        assert!(index.find(&h).is_none());
        index.add(entry(h, block)).unwrap();
        assert_eq!(index.find(&h).unwrap().physical, block);

        assert_eq!(index.share(block).unwrap(), 2);
        assert_eq!(index.refcount(block), Some(2));
        assert_eq!(index.stats().hits, 1);
        assert_eq!(index.stats().misses, 1);
    }

    #[test]
    fn test_bucket_collisions_compare_full_hash() {
        let mut alloc = Allocator::new(&Layout::new(1024));
        let mut index = DedupIndex::new(true).unwrap();
        // Same first two bytes, so same bucket
        let h1 = hash(9, 9, 1);
        let h2 = hash(9, 9, 2);
        let b1 = alloc.allocate(1).unwrap();
        let b2 = alloc.allocate(1).unwrap();
        index.add(entry(h1, b1)).unwrap();
        index.add(entry(h2, b2)).unwrap();

        assert_eq!(index.find(&h1).unwrap().physical, b1);
        assert_eq!(index.find(&h2).unwrap().physical, b2);
        assert!(index.find(&hash(9, 9, 3)).is_none());

        // Unlinking the chain head keeps the tail reachable
        index.dec_refcount(b2, &mut alloc).unwrap();
        assert!(index.find(&h2).is_none());
        assert_eq!(index.find(&h1).unwrap().physical, b1);
    }

    #[test]
    fn test_unlink_inside_bucket_chain() {
        let mut alloc = Allocator::new(&Layout::new(1024));
        let mut index = DedupIndex::new(true).unwrap();
        let hashes = [hash(3, 3, 1), hash(3, 3, 2), hash(3, 3, 3)];
        let blocks: Vec<u64> = hashes
            .iter()
            .map(|h| {
                let block = alloc.allocate(1).unwrap();
                index.add(entry(*h, block)).unwrap();
                block
            })
            .collect();

        // Chain is newest first: blocks[2] -> blocks[1] -> blocks[0]
        index.dec_refcount(blocks[1], &mut alloc).unwrap();
        assert!(index.find(&hashes[1]).is_none());
        assert_eq!(index.find(&hashes[2]).unwrap().physical, blocks[2]);
        assert_eq!(index.find(&hashes[0]).unwrap().physical, blocks[0]);

        // Tail of the chain
        index.dec_refcount(blocks[0], &mut alloc).unwrap();
        assert!(index.find(&hashes[0]).is_none());
        assert_eq!(index.find(&hashes[2]).unwrap().physical, blocks[2]);

        // The freed slots are reused without disturbing the survivor
        let b3 = alloc.allocate(1).unwrap();
        index.add(entry(hashes[0], b3)).unwrap();
        assert_eq!(index.find(&hashes[0]).unwrap().physical, b3);
        assert_eq!(index.find(&hashes[2]).unwrap().physical, blocks[2]);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_failed_release_keeps_entry() {
        let mut alloc = Allocator::new(&Layout::new(1024));
        let mut index = DedupIndex::new(true).unwrap();
        let block = alloc.allocate(1).unwrap();
        let h = hash(8, 1, 8);
        index.add(entry(h, block)).unwrap();

        // Freed behind the ledger's back: the release must fail cleanly
        alloc.free(block, 1).unwrap();
        assert!(index.dec_refcount(block, &mut alloc).is_err());
        assert_eq!(index.refcount(block), Some(1));
        assert_eq!(index.find(&h).unwrap().physical, block);
    }

    #[test]
    fn test_stream_links_are_record_indices() {
        let mut alloc = Allocator::new(&Layout::new(1024));
        let mut index = DedupIndex::new(true).unwrap();
        let blocks: Vec<u64> = (1..=3u8)
            .map(|i| {
                let block = alloc.allocate(1).unwrap();
                index.add(entry(hash(6, 6, i), block)).unwrap();
                block
            })
            .collect();
        // Leave a hole in slot 0 so slot and record numbers differ
        index.dec_refcount(blocks[0], &mut alloc).unwrap();

        let bytes = index.to_bytes().unwrap();
        let records: Vec<DedupRecord> = bytes[TABLE_HEADER..]
            .chunks(DEDUP_RECORD_SIZE)
            .map(|chunk| DedupRecord::decode(chunk).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].physical, blocks[1]);
        assert_eq!(records[1].physical, blocks[2]);
        // Newest first: blocks[2] links to blocks[1], which ends the chain
        assert_eq!(records[1].next, 0);
        assert_eq!(records[0].next, NIL);
    }

    #[test]
    fn test_restore_keeps_refcount() {
        let mut alloc = Allocator::new(&Layout::new(1024));
        let mut index = DedupIndex::new(true).unwrap();
        let block = alloc.allocate(1).unwrap();
        let h = hash(2, 4, 6);
        index.restore(entry(h, block), 3).unwrap();
        assert_eq!(index.refcount(block), Some(3));
        assert_eq!(index.find(&h).unwrap().physical, block);
        assert_eq!(index.stats().misses, 0);
        assert!(index.restore(entry(h, block), 1).is_err());
        assert!(index.restore(entry(hash(2, 4, 7), block + 1), 0).is_err());
    }

    #[test]
    fn test_release_at_zero_frees_block() {
        let mut alloc = Allocator::new(&Layout::new(1024));
        let mut index = DedupIndex::new(true).unwrap();
        let free_before = alloc.free_blocks();
        let block = alloc.allocate(1).unwrap();
        index.add(entry(hash(4, 5, 6), block)).unwrap();
        index.inc_refcount(block).unwrap();

        assert_eq!(index.dec_refcount(block, &mut alloc).unwrap(), 1);
        assert!(alloc.is_allocated(block));

        assert_eq!(index.dec_refcount(block, &mut alloc).unwrap(), 0);
        assert!(!alloc.is_allocated(block));
        assert_eq!(alloc.free_blocks(), free_before);
        assert!(index.is_empty());
        assert!(matches!(
            index.dec_refcount(block, &mut alloc),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_disabled_index_still_counts_references() {
        let mut alloc = Allocator::new(&Layout::new(1024));
        let mut index = DedupIndex::new(false).unwrap();
        let block = alloc.allocate(1).unwrap();
        let h = hash(7, 7, 7);
        index.add(entry(h, block)).unwrap();

        assert!(index.find(&h).is_none());
        assert_eq!(index.inc_refcount(block).unwrap(), 2);
        index.dec_refcount(block, &mut alloc).unwrap();
        index.dec_refcount(block, &mut alloc).unwrap();
        assert!(!alloc.is_allocated(block));
    }

    #[test]
    fn test_table_stream_round_trip() {
        let mut alloc = Allocator::new(&Layout::new(1024));
        let mut index = DedupIndex::new(true).unwrap();
        for i in 0..5u8 {
            let block = alloc.allocate(1).unwrap();
            index.add(entry(hash(i, 0, i), block)).unwrap();
            if i % 2 == 0 {
                index.inc_refcount(block).unwrap();
            }
        }
        let bytes = index.to_bytes().unwrap();

        let loaded = DedupIndex::from_bytes(&bytes, true).unwrap();
        assert_eq!(loaded.len(), 5);
        for original in index.iter() {
            let found = loaded.find(&original.hash).unwrap();
            assert_eq!(found.physical, original.physical);
            assert_eq!(found.refcount, original.refcount);
        }

        let mut lookups_off = DedupIndex::from_bytes(&bytes, false).unwrap();
        assert!(lookups_off.find(&hash(0, 0, 0)).is_none());
        lookups_off.release_table();
        assert_eq!(lookups_off.len(), 5);
    }
}
