//! Extent maps and the file data path
//!
//! A file's data is a sparse array of 4 KiB logical blocks. Each present
//! block is one [`Extent`]: where its payload lives and how to decode it.
//! The extents are kept in an ordered map keyed by logical block index and
//! persisted as a chain of extent blocks hanging off the inode.
//!
//! Write path per block: compress, hash, look the hash up in the dedup
//! index, then either share the matching block or allocate, encrypt and
//! write a new one. Read path: read, decrypt, decompress.

use std::collections::BTreeMap;

use crate::blockdev::BLOCK_SIZE;
use crate::error::{Error, Result};
use crate::format::{
    decode_extent_block, encode_extent_block, CompressionAlgorithm, EncryptionAlgorithm, Extent,
    Inode, EXTENTS_PER_BLOCK, EXTENT_FLAG_RAW, EXTENT_FLAG_VOLUME_KEY,
};
use crate::layout::now_secs;
use crate::modules::codec::{self, Key};
use crate::modules::dedup::DedupEntry;
use crate::volume::MountState;

const BS: u64 = BLOCK_SIZE as u64;

/// In-memory extent index of one inode
#[derive(Debug, Clone, Default)]
pub(crate) struct ExtentMap {
    pub extents: BTreeMap<u64, Extent>,
    /// Blocks currently holding the persisted chain
    pub chain: Vec<u64>,
}

impl ExtentMap {
    /// Same extents, not tied to any persisted chain
    pub fn detached(self) -> Self {
        Self {
            extents: self.extents,
            chain: Vec::new(),
        }
    }

    /// Ordered content hashes of the present blocks
    pub fn hashes(&self) -> impl Iterator<Item = &[u8; 32]> {
        self.extents.values().map(|e| &e.hash)
    }
}

fn raw_extent(logical: u64, physical: u64, len: usize) -> Extent {
    Extent {
        logical,
        physical,
        length: 1,
        flags: EXTENT_FLAG_RAW,
        refcount: 1,
        stored_size: len as u32,
        logical_size: len as u32,
        compression: CompressionAlgorithm::None,
        encryption: EncryptionAlgorithm::None,
        hash: [0u8; 32],
        nonce: [0u8; 12],
        tag: [0u8; 16],
    }
}

impl MountState {
    /// Load the extent chain of `inode`
    pub(crate) async fn load_extents(&self, inode: &Inode) -> Result<ExtentMap> {
        let mut map = ExtentMap::default();
        let mut next = inode.extent_root;
        let mut buf = vec![0u8; BLOCK_SIZE];
        while next != 0 {
            if !self.layout.is_data_block(next) || map.chain.len() as u64 >= self.layout.total_blocks
            {
                return Err(Error::format(format!(
                    "inode {} has a broken extent chain at block {}",
                    inode.id, next
                )));
            }
            self.cache.read_block(next, &mut buf).await?;
            let (records, link) = decode_extent_block(&buf)?;
            for extent in records {
                map.extents.insert(extent.logical, extent);
            }
            map.chain.push(next);
            next = link;
        }
        if map.extents.len() != inode.extent_count as usize {
            return Err(Error::format(format!(
                "inode {} lists {} extents, chain holds {}",
                inode.id,
                inode.extent_count,
                map.extents.len()
            )));
        }
        Ok(map)
    }

    /// Persist `map` as the extent chain of `inode`
    ///
    /// Reuses the blocks of the existing chain, allocating or freeing the
    /// difference. Updates `extent_root`, `extent_count` and `blocks` on the
    /// inode but does not store the inode itself.
    pub(crate) async fn store_extents(&mut self, inode: &mut Inode, map: &mut ExtentMap) -> Result<()> {
        let mut records: Vec<Extent> = map.extents.values().cloned().collect();
        for record in records.iter_mut().filter(|r| !r.is_raw()) {
            record.refcount = self.dedup.refcount(record.physical).unwrap_or(1);
        }
        let needed = (records.len() + EXTENTS_PER_BLOCK - 1) / EXTENTS_PER_BLOCK;

        let mut grown = Vec::new();
        while map.chain.len() + grown.len() < needed {
            match self.alloc.allocate(1) {
                Ok(block) => grown.push(block),
                Err(e) => {
                    self.free_chain(&grown)?;
                    return Err(e);
                }
            }
        }
        map.chain.extend(grown);
        if map.chain.len() > needed {
            let surplus = map.chain.split_off(needed);
            self.free_chain(&surplus)?;
        }

        for (i, chunk) in records.chunks(EXTENTS_PER_BLOCK).enumerate() {
            let next = map.chain.get(i + 1).copied().unwrap_or(0);
            let block = encode_extent_block(chunk, next)?;
            self.cache.write_block(map.chain[i], &block).await?;
        }

        inode.extent_root = map.chain.first().copied().unwrap_or(0);
        inode.extent_count = records.len() as u32;
        inode.blocks = records.iter().map(|r| r.length as u64).sum();
        Ok(())
    }

    pub(crate) fn free_chain(&mut self, blocks: &[u64]) -> Result<()> {
        for &block in blocks {
            self.alloc.free(block, 1)?;
            self.cache.invalidate(block);
        }
        Ok(())
    }

    /// Drop the reference an extent holds on its block
    pub(crate) fn release_extent(&mut self, extent: &Extent) -> Result<()> {
        if extent.is_raw() {
            self.alloc.free(extent.physical, extent.length as u64)
        } else {
            self.dedup
                .dec_refcount(extent.physical, &mut self.alloc)
                .map(|_| ())
        }
    }

    fn release_all(&mut self, extents: &[Extent]) {
        for extent in extents {
            if let Err(e) = self.release_extent(extent) {
                log::error!(
                    "EXTENT: could not release block {}: {}",
                    extent.physical,
                    e
                );
            }
        }
    }

    fn extent_key(&self, extent: &Extent, file_key: Option<&Key>) -> Result<Key> {
        if extent.flags & EXTENT_FLAG_VOLUME_KEY != 0 {
            self.keys
                .as_ref()
                .map(|k| k.data)
                .ok_or_else(|| Error::CryptoFailure("volume data key unavailable".to_string()))
        } else {
            file_key
                .copied()
                .ok_or_else(|| Error::CryptoFailure("file key unavailable".to_string()))
        }
    }

    /// Read the stored payload of `extent`, decrypted but still compressed
    pub(crate) async fn read_payload(&self, extent: &Extent, file_key: Option<&Key>) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.device.read_block(extent.physical, &mut buf).await?;
        buf.truncate(extent.stored_size as usize);
        if extent.encryption != EncryptionAlgorithm::None {
            let key = self.extent_key(extent, file_key)?;
            codec::open_in_place(&key, &mut buf, &extent.nonce, &extent.tag)?;
        }
        Ok(buf)
    }

    /// Logical content of one block
    pub(crate) async fn read_extent(&self, extent: &Extent, file_key: Option<&Key>) -> Result<Vec<u8>> {
        let payload = self.read_payload(extent, file_key).await?;
        if extent.is_raw() {
            return Ok(payload);
        }
        codec::decompress(extent.compression, &payload, extent.logical_size as usize)
    }

    /// Key and extent flags new blocks of `inode` are sealed with
    fn write_key(&self, inode: &Inode, file_key: Option<&Key>) -> Result<(Option<Key>, u32)> {
        if inode.encryption == EncryptionAlgorithm::None {
            return Ok((None, 0));
        }
        let keys = self
            .keys
            .as_ref()
            .ok_or_else(|| Error::CryptoFailure("volume keys not loaded".to_string()))?;
        if self.dedup.is_enabled() {
            // Shared blocks must be readable from any file
            Ok((Some(keys.data), EXTENT_FLAG_VOLUME_KEY))
        } else {
            let key = file_key
                .copied()
                .ok_or_else(|| Error::CryptoFailure("file key unavailable".to_string()))?;
            Ok((Some(key), 0))
        }
    }

    /// Store one logical block and return an extent holding a reference to it
    ///
    /// `existing` is the extent currently at this index; if it already holds
    /// identical content it is reused.
    async fn store_block(
        &mut self,
        inode: &Inode,
        file_key: Option<&Key>,
        logical: u64,
        content: &[u8],
        existing: Option<&Extent>,
    ) -> Result<Extent> {
        let prepared = codec::prepare_block(inode.compression, content)?;
        let (key, flags) = self.write_key(inode, file_key)?;

        if let Some(old) = existing {
            if !old.is_raw()
                && old.hash == prepared.hash
                && old.encryption == inode.encryption
                && old.flags == flags
            {
                self.dedup.inc_refcount(old.physical)?;
                return Ok(old.clone());
            }
        }

        if self.dedup.is_enabled() {
            let candidate = self
                .dedup
                .find_matching(&prepared.hash, |e| {
                    e.encryption == inode.encryption && e.flags == flags
                })
                .cloned();
            if let Some(entry) = candidate {
                let shared = entry.to_extent(logical);
                let same = if self.verify_dedup_hits {
                    match self.read_extent(&shared, file_key).await {
                        Ok(data) => data == content,
                        Err(_) => false,
                    }
                } else {
                    true
                };
                if same {
                    let refcount = self.dedup.share(entry.physical)?;
                    log::trace!(
                        "DEDUP: block {} of inode {} shares block {} (refcount {})",
                        logical,
                        inode.id,
                        entry.physical,
                        refcount
                    );
                    return Ok(Extent { refcount, ..shared });
                }
                self.dedup.note_collision();
                log::warn!(
                    "DEDUP: hash hit on block {} with different content, storing separately",
                    entry.physical
                );
            }
        }

        let physical = self.alloc.allocate(1)?;
        let mut payload = prepared.payload;
        let (nonce, tag, encryption) = match key {
            Some(key) => match codec::seal_in_place(&key, &mut payload) {
                Ok((nonce, tag)) => (nonce, tag, inode.encryption),
                Err(e) => {
                    self.alloc.free(physical, 1)?;
                    return Err(e);
                }
            },
            None => ([0u8; 12], [0u8; 16], EncryptionAlgorithm::None),
        };
        let stored_size = payload.len() as u32;
        payload.resize(BLOCK_SIZE, 0);
        if let Err(e) = self.device.write_block(physical, &payload).await {
            self.alloc.free(physical, 1)?;
            return Err(e.into());
        }

        let extent = Extent {
            logical,
            physical,
            length: 1,
            flags,
            refcount: 1,
            stored_size,
            logical_size: prepared.logical_size,
            compression: prepared.compression,
            encryption,
            hash: prepared.hash,
            nonce,
            tag,
        };
        if let Err(e) = self.dedup.add(DedupEntry::from_extent(&extent)) {
            self.alloc.free(physical, 1)?;
            return Err(e);
        }
        Ok(extent)
    }

    /// Store the blocks covering `[offset, offset + data.len())`
    ///
    /// Pushes one extent per block into `fresh` as it goes, so the caller
    /// can drop their references if a later block fails.
    async fn store_range(
        &mut self,
        inode: &Inode,
        map: &ExtentMap,
        file_key: Option<&Key>,
        offset: u64,
        data: &[u8],
        new_size: u64,
        fresh: &mut Vec<Extent>,
    ) -> Result<()> {
        let end = offset + data.len() as u64;
        for idx in offset / BS..=(end - 1) / BS {
            let block_start = idx * BS;
            let valid = (new_size - block_start).min(BS) as usize;
            let lo = (offset.max(block_start) - block_start) as usize;
            let hi = (end.min(block_start + BS) - block_start) as usize;

            let existing = map.extents.get(&idx);
            let mut content = vec![0u8; valid];
            if lo > 0 || hi < valid {
                if let Some(old) = existing {
                    let old_data = self.read_extent(old, file_key).await?;
                    let n = old_data.len().min(valid);
                    content[..n].copy_from_slice(&old_data[..n]);
                }
            }
            let src = (block_start + lo as u64 - offset) as usize;
            content[lo..hi].copy_from_slice(&data[src..src + (hi - lo)]);

            let extent = self
                .store_block(inode, file_key, idx, &content, existing)
                .await?;
            fresh.push(extent);
        }
        Ok(())
    }

    /// Write `data` at `offset`; `inode` must not be shared
    ///
    /// Either every touched block is replaced or none is: blocks stored
    /// before a failure are released again.
    pub(crate) async fn write_data(&mut self, inode: &mut Inode, offset: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| Error::invalid("write extends past the largest file offset"))?;
        let file_key = self.file_key(inode)?;
        let mut map = self.load_extents(inode).await?;
        let new_size = inode.size.max(end);

        let mut fresh = Vec::new();
        if let Err(e) = self
            .store_range(inode, &map, file_key.as_ref(), offset, data, new_size, &mut fresh)
            .await
        {
            self.release_all(&fresh);
            return Err(e);
        }

        let mut replaced = Vec::new();
        for extent in fresh.iter().cloned() {
            if let Some(old) = map.extents.insert(extent.logical, extent) {
                replaced.push(old);
            }
        }
        let mut updated = inode.clone();
        updated.size = new_size;
        if let Err(e) = self.commit_extents(&mut updated, &mut map).await {
            self.release_all(&fresh);
            return Err(e);
        }
        self.release_all(&replaced);
        *inode = updated;

        log::trace!(
            "EXTENT: inode {} wrote {} bytes at {}, size {}",
            inode.id,
            data.len(),
            offset,
            inode.size
        );
        Ok(data.len())
    }

    /// Persist the extent chain and the inode after a data change
    async fn commit_extents(&mut self, inode: &mut Inode, map: &mut ExtentMap) -> Result<()> {
        let now = now_secs();
        inode.mtime = now;
        inode.ctime = now;
        refresh_content_hash(inode, map);
        self.store_extents(inode, map).await?;
        self.store_inode(inode).await
    }

    /// Read up to `len` bytes at `offset`; holes read as zeros
    pub(crate) async fn read_data(&self, inode: &Inode, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset >= inode.size || len == 0 {
            return Ok(Vec::new());
        }
        let end = inode.size.min(offset.saturating_add(len as u64));
        let file_key = self.file_key(inode)?;
        let map = self.load_extents(inode).await?;

        let mut out = vec![0u8; (end - offset) as usize];
        for idx in offset / BS..=(end - 1) / BS {
            let Some(extent) = map.extents.get(&idx) else {
                continue;
            };
            let content = self.read_extent(extent, file_key.as_ref()).await?;
            let block_start = idx * BS;
            let lo = offset.max(block_start);
            let hi = end.min(block_start + BS).min(block_start + content.len() as u64);
            if hi <= lo {
                continue;
            }
            let dst = (lo - offset) as usize;
            let src = (lo - block_start) as usize;
            let n = (hi - lo) as usize;
            out[dst..dst + n].copy_from_slice(&content[src..src + n]);
        }
        Ok(out)
    }

    /// Set the size of `inode`; `inode` must not be shared
    ///
    /// Shrinking releases whole blocks past the end through the reference
    /// ledger and rewrites a partial last block so stale bytes never come
    /// back when the file grows again. Growing leaves a hole.
    pub(crate) async fn truncate_data(&mut self, inode: &mut Inode, size: u64) -> Result<()> {
        if size == inode.size {
            return Ok(());
        }
        let mut map = self.load_extents(inode).await?;
        let mut updated = inode.clone();
        updated.size = size;

        if size > inode.size {
            self.commit_extents(&mut updated, &mut map).await?;
            *inode = updated;
            return Ok(());
        }

        let keep = (size + BS - 1) / BS;
        let mut dropped: Vec<Extent> = map.extents.split_off(&keep).into_values().collect();

        let mut fresh = Vec::new();
        let tail = (size % BS) as usize;
        if tail != 0 {
            let idx = size / BS;
            if let Some(old) = map.extents.get(&idx).cloned() {
                if old.logical_size as usize > tail {
                    let file_key = self.file_key(inode)?;
                    let mut content = self.read_extent(&old, file_key.as_ref()).await?;
                    content.truncate(tail);
                    let extent = self
                        .store_block(inode, file_key.as_ref(), idx, &content, None)
                        .await?;
                    fresh.push(extent.clone());
                    map.extents.insert(idx, extent);
                    dropped.push(old);
                }
            }
        }

        if let Err(e) = self.commit_extents(&mut updated, &mut map).await {
            self.release_all(&fresh);
            return Err(e);
        }
        self.release_all(&dropped);
        *inode = updated;
        log::trace!("EXTENT: inode {} truncated to {}", inode.id, size);
        Ok(())
    }

    /// Make `bytes` the whole content of `inode`
    pub(crate) async fn replace_content(&mut self, inode: &mut Inode, bytes: &[u8]) -> Result<()> {
        self.write_data(inode, 0, bytes).await?;
        self.truncate_data(inode, bytes.len() as u64).await
    }

    /// Read a metadata inode's content, stored without codec
    pub(crate) async fn read_stream(&self, id: u64) -> Result<Vec<u8>> {
        let inode = self.load_inode(id).await?;
        let map = self.load_extents(&inode).await?;
        let mut out = Vec::with_capacity(inode.size as usize);
        let mut buf = vec![0u8; BLOCK_SIZE];
        for (idx, extent) in &map.extents {
            if !extent.is_raw() || *idx != out.len() as u64 / BS {
                return Err(Error::format(format!(
                    "metadata inode {} has an unexpected extent at {}",
                    id, idx
                )));
            }
            self.device.read_block(extent.physical, &mut buf).await?;
            out.extend_from_slice(&buf[..extent.logical_size as usize]);
        }
        if out.len() as u64 != inode.size {
            return Err(Error::format(format!(
                "metadata inode {} holds {} bytes, expected {}",
                id,
                out.len(),
                inode.size
            )));
        }
        Ok(out)
    }

    /// Overwrite a metadata inode's content, stored without codec
    ///
    /// Its blocks are owned directly rather than through the reference
    /// ledger, since the ledger itself is one of these streams.
    pub(crate) async fn write_stream(&mut self, id: u64, bytes: &[u8]) -> Result<()> {
        let mut inode = self.load_inode(id).await?;
        let mut map = self.load_extents(&inode).await?;
        let needed = (bytes.len() as u64 + BS - 1) / BS;

        let mut grown = Vec::new();
        for idx in 0..needed {
            if map.extents.contains_key(&idx) {
                continue;
            }
            match self.alloc.allocate(1) {
                Ok(block) => {
                    grown.push(block);
                    map.extents.insert(idx, raw_extent(idx, block, 0));
                }
                Err(e) => {
                    for block in grown {
                        self.alloc.free(block, 1)?;
                    }
                    return Err(e);
                }
            }
        }
        for extent in map.extents.split_off(&needed).into_values() {
            self.alloc.free(extent.physical, 1)?;
        }

        let mut block = vec![0u8; BLOCK_SIZE];
        for (idx, chunk) in bytes.chunks(BLOCK_SIZE).enumerate() {
            let extent = map
                .extents
                .get_mut(&(idx as u64))
                .ok_or_else(|| Error::format("metadata stream lost an extent"))?;
            extent.stored_size = chunk.len() as u32;
            extent.logical_size = chunk.len() as u32;
            block.fill(0);
            block[..chunk.len()].copy_from_slice(chunk);
            self.device.write_block(extent.physical, &block).await?;
        }

        inode.size = bytes.len() as u64;
        inode.mtime = now_secs();
        self.store_extents(&mut inode, &mut map).await?;
        self.store_inode(&inode).await
    }
}

/// Whole-file hash over the size and the ordered block hashes
pub(crate) fn refresh_content_hash(inode: &mut Inode, map: &ExtentMap) {
    inode.content_hash = if inode.size == 0 {
        [0u8; 32]
    } else {
        codec::file_hash(inode.size, map.hashes())
    };
}
