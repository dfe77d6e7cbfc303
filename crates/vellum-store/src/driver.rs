//! Storage driver: external→internal id remapping and free-page reuse.
//!
//! The driver sits between a B+ tree and a raw [`BlockStore`]. Every page
//! id the tree sees is *external*; the driver maps it to the *internal* id
//! actually used in the block store, and recycles internal ids of freed
//! pages through a persistent free-page index. Both maps are themselves
//! B+ trees over the same block store:
//!
//! ```text
//!   data tree ──► StorageDriver ──► BlockStore
//!                   │  id map   ──► BlockStore   (bypass, no remap)
//!                   │  free map ──► BlockStore   (bypass, no remap)
//!                   └─ allocator core (counter + pending queue)
//! ```
//!
//! The sub-trees ride on `BypassStore`, which talks to the block store
//! directly and draws fresh ids from the shared allocator core, never
//! from the driver. That breaks the tree/driver cycle: an id-map lookup
//! can never recurse into an id-map lookup.
//!
//! Ids 0..=2 are reserved for the three meta pages (data tree, id map,
//! free map) and are never handed out by any allocator.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use vellum_common::{Result, VellumError};
use vellum_tree::page::FreePage;
use vellum_tree::{BPlusTree, PageStore};

use crate::block::BlockStore;

/// Reserved block id of the data tree's meta page.
pub const DATA_META_ID: u64 = 0;
/// Reserved block id of the id-map tree's meta page.
pub const ID_MAP_META_ID: u64 = 1;
/// Reserved block id of the free-map tree's meta page.
pub const FREE_MAP_META_ID: u64 = 2;
/// Number of reserved ids; allocators start above this.
pub const RESERVED_IDS: u64 = 3;

fn encode_id(id: u64) -> Bytes {
    Bytes::copy_from_slice(&id.to_be_bytes())
}

fn decode_id(bytes: &[u8]) -> Result<u64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| VellumError::corrupt(format!("id record of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(array))
}

/// Counter and pending queue shared by the driver and its bypass adapters.
///
/// The pending queue holds internal ids freed while the free-map tree was
/// mid-operation; their blocks already carry a detached tombstone. They are
/// drained lowest-id first before any other allocation source.
struct AllocatorCore {
    counter: Mutex<u64>,
    pending: Mutex<Vec<u64>>,
}

impl AllocatorCore {
    fn new(seed: u64) -> Self {
        Self {
            counter: Mutex::new(seed),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn bump(&self) -> u64 {
        let mut counter = self.counter.lock();
        let id = *counter;
        *counter += 1;
        id
    }

    fn push_pending(&self, id: u64) {
        self.pending.lock().push(id);
    }

    fn pop_pending(&self) -> Option<u64> {
        let mut pending = self.pending.lock();
        let index = pending
            .iter()
            .enumerate()
            .min_by_key(|(_, id)| **id)
            .map(|(index, _)| index)?;
        Some(pending.swap_remove(index))
    }

    fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Page store the driver's private trees ride on: raw block access plus
/// the shared allocator core. Does not route through the driver.
struct BypassStore<B: BlockStore> {
    block: Arc<B>,
    alloc: Arc<AllocatorCore>,
    meta_id: u64,
}

impl<B: BlockStore> PageStore for BypassStore<B> {
    fn max_page_size(&self) -> usize {
        self.block.options().max_page_size
    }

    fn metadata_id(&self) -> u64 {
        self.meta_id
    }

    fn get_metadata(&self) -> Result<Option<Bytes>> {
        self.block.get(self.meta_id)
    }

    fn put_metadata(&self, bytes: Bytes) -> Result<()> {
        self.block.put(self.meta_id, bytes)
    }

    fn allocate(&self) -> Result<u64> {
        if let Some(id) = self.alloc.pop_pending() {
            return Ok(id);
        }
        Ok(self.alloc.bump())
    }

    fn get(&self, id: u64) -> Result<Option<Bytes>> {
        self.block.get(id)
    }

    fn put(&self, id: u64, bytes: Bytes) -> Result<()> {
        self.block.put(id, bytes)
    }

    fn free(&self, id: u64) -> Result<()> {
        // A sub-tree frees pages only from inside one of its own
        // operations, which is exactly the reentrant case: tombstone the
        // block as detached and queue the id instead of touching the
        // free map.
        self.block.put(id, FreePage { id, detached: true }.encode())?;
        self.alloc.push_pending(id);
        Ok(())
    }

    fn scan(&self) -> Result<Vec<(u64, Bytes)>> {
        self.block.scan()
    }
}

/// The two-level storage layer between a B+ tree and a raw block store.
///
/// Implements [`PageStore`] over *external* ids: `get`/`put`/`free` remap
/// through the id-map tree, `allocate` hands out fresh external ids, and
/// the meta page lives at reserved block id 0 with no remapping.
pub struct StorageDriver<B: BlockStore> {
    block: Arc<B>,
    alloc: Arc<AllocatorCore>,
    id_map: BPlusTree<BypassStore<B>>,
    free_map: BPlusTree<BypassStore<B>>,
    external_counter: Mutex<u64>,
}

impl<B: BlockStore> StorageDriver<B> {
    /// Opens a driver over the block store, bootstrapping the id-map and
    /// free-map trees if the store is empty.
    ///
    /// On reopen both allocation counters are seeded above every id found
    /// in the store, so live ids are never re-issued.
    pub fn open(block: B) -> Result<Self> {
        let block = Arc::new(block);

        let mut max_internal = RESERVED_IDS - 1;
        for (id, _) in block.scan()? {
            max_internal = max_internal.max(id);
        }
        let alloc = Arc::new(AllocatorCore::new(max_internal + 1));

        let id_map = BPlusTree::open(BypassStore {
            block: Arc::clone(&block),
            alloc: Arc::clone(&alloc),
            meta_id: ID_MAP_META_ID,
        })?;
        let free_map = BPlusTree::open(BypassStore {
            block: Arc::clone(&block),
            alloc: Arc::clone(&alloc),
            meta_id: FREE_MAP_META_ID,
        })?;

        let mut external = RESERVED_IDS;
        let mut probe = 0u64;
        while let Some(key) = id_map.find_next(&probe.to_be_bytes())? {
            let id = decode_id(&key)?;
            external = external.max(id.saturating_add(1));
            if id == u64::MAX {
                break;
            }
            probe = id + 1;
        }

        Ok(Self {
            block,
            alloc,
            id_map,
            free_map,
            external_counter: Mutex::new(external),
        })
    }

    /// Returns the raw block store.
    pub fn block(&self) -> &B {
        &self.block
    }

    /// Collects every `(external, internal)` id pair. Diagnostics only.
    pub fn mapped_ids(&self) -> Result<Vec<(u64, u64)>> {
        let mut pairs = Vec::new();
        let mut probe = 0u64;
        while let Some(key) = self.id_map.find_next(&probe.to_be_bytes())? {
            let external = decode_id(&key)?;
            let internal = self.lookup(external)?.ok_or_else(|| {
                VellumError::corrupt(format!("id map lost entry {} mid-walk", external))
            })?;
            pairs.push((external, internal));
            match external.checked_add(1) {
                Some(next) => probe = next,
                None => break,
            }
        }
        Ok(pairs)
    }

    /// Collects every reclaimable internal id. Diagnostics only.
    pub fn free_ids(&self) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        let mut probe = 0u64;
        while let Some(key) = self.free_map.find_next(&probe.to_be_bytes())? {
            let id = decode_id(&key)?;
            ids.push(id);
            match id.checked_add(1) {
                Some(next) => probe = next,
                None => break,
            }
        }
        Ok(ids)
    }

    fn lookup(&self, external: u64) -> Result<Option<u64>> {
        match self.id_map.find(&external.to_be_bytes())? {
            Some(Some(bytes)) => Ok(Some(decode_id(&bytes)?)),
            Some(None) => Err(VellumError::corrupt(format!(
                "id map entry {} has a null value",
                external
            ))),
            None => Ok(None),
        }
    }

    /// Produces the next internal id: drained pendings first, then the
    /// lowest free-map entry, then the counter.
    ///
    /// The free map is consulted only while idle; if the allocator is
    /// reached from inside a free-map operation it falls through to the
    /// counter instead of recursing.
    fn next_id(&self) -> Result<u64> {
        if let Some(id) = self.alloc.pop_pending() {
            return Ok(id);
        }
        if !self.free_map.in_operation() {
            if let Some(key) = self.free_map.find_next(&0u64.to_be_bytes())? {
                let id = decode_id(&key)?;
                match self.block.get(id)? {
                    Some(bytes) => {
                        let tombstone = FreePage::decode(bytes)?;
                        if tombstone.detached {
                            return Err(VellumError::corrupt(format!(
                                "free map names detached block {}",
                                id
                            )));
                        }
                        self.block.put(id, FreePage { id, detached: true }.encode())?;
                    }
                    // The store deleted the block outright; nothing to latch.
                    None => {}
                }
                self.free_map.delete(&key)?;
                return Ok(id);
            }
        }
        Ok(self.alloc.bump())
    }

    fn release_internal(&self, internal: u64, external: u64) -> Result<()> {
        if self.free_map.in_operation() {
            self.block
                .put(internal, FreePage { id: internal, detached: true }.encode())?;
            self.alloc.push_pending(internal);
            return Ok(());
        }
        if self.block.options().supports_internal_delete {
            self.block.delete(internal)?;
        } else {
            self.block
                .put(internal, FreePage { id: internal, detached: false }.encode())?;
        }
        self.free_map.add(encode_id(internal), Some(encode_id(external)))
    }
}

impl<B: BlockStore> PageStore for StorageDriver<B> {
    fn max_page_size(&self) -> usize {
        self.block.options().max_page_size
    }

    fn metadata_id(&self) -> u64 {
        DATA_META_ID
    }

    fn get_metadata(&self) -> Result<Option<Bytes>> {
        self.block.get(DATA_META_ID)
    }

    fn put_metadata(&self, bytes: Bytes) -> Result<()> {
        self.block.put(DATA_META_ID, bytes)
    }

    fn allocate(&self) -> Result<u64> {
        let mut counter = self.external_counter.lock();
        let id = *counter;
        *counter += 1;
        Ok(id)
    }

    fn get(&self, id: u64) -> Result<Option<Bytes>> {
        let internal = self.lookup(id)?.ok_or(VellumError::PageNotFound { id })?;
        self.block.get(internal)
    }

    fn put(&self, id: u64, bytes: Bytes) -> Result<()> {
        let internal = match self.lookup(id)? {
            Some(internal) => internal,
            None => {
                let internal = self.next_id()?;
                self.id_map.add(encode_id(id), Some(encode_id(internal)))?;
                internal
            }
        };
        self.block.put(internal, bytes)
    }

    fn free(&self, id: u64) -> Result<()> {
        let internal = self.lookup(id)?.ok_or(VellumError::PageNotFound { id })?;
        self.release_internal(internal, id)?;
        self.id_map.delete(&id.to_be_bytes())?;
        Ok(())
    }

    fn scan(&self) -> Result<Vec<(u64, Bytes)>> {
        self.block.scan()
    }
}
