//! Raw block storage: an unordered byte map keyed by integer id.

use std::collections::BTreeMap;

use bytes::Bytes;
use parking_lot::RwLock;
use vellum_common::{Result, StoreOptions};

/// An unordered block store.
///
/// The store knows nothing about pages or trees; it maps integer ids to
/// opaque byte blocks. Backends range from a process-local map to a remote
/// key/value service. All ordering, allocation, and reuse lives above, in
/// the storage driver.
pub trait BlockStore {
    /// Advertised limits and capabilities.
    fn options(&self) -> StoreOptions;

    /// Reads a block.
    fn get(&self, id: u64) -> Result<Option<Bytes>>;

    /// Writes a block.
    fn put(&self, id: u64, bytes: Bytes) -> Result<()>;

    /// Removes a block. A no-op if the block does not exist.
    fn delete(&self, id: u64) -> Result<()>;

    /// Collects every stored `(id, bytes)` pair. Diagnostics only.
    fn scan(&self) -> Result<Vec<(u64, Bytes)>>;
}

/// Process-memory block store.
pub struct MemoryStore {
    options: StoreOptions,
    blocks: RwLock<BTreeMap<u64, Bytes>>,
}

impl MemoryStore {
    /// Creates a store with default options.
    pub fn new() -> Self {
        Self::with_options(StoreOptions::default())
    }

    /// Creates a store with explicit options.
    pub fn with_options(options: StoreOptions) -> Self {
        Self {
            options,
            blocks: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of live blocks.
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    /// True if no blocks are stored.
    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore for MemoryStore {
    fn options(&self) -> StoreOptions {
        self.options
    }

    fn get(&self, id: u64) -> Result<Option<Bytes>> {
        Ok(self.blocks.read().get(&id).cloned())
    }

    fn put(&self, id: u64, bytes: Bytes) -> Result<()> {
        self.blocks.write().insert(id, bytes);
        Ok(())
    }

    fn delete(&self, id: u64) -> Result<()> {
        self.blocks.write().remove(&id);
        Ok(())
    }

    fn scan(&self) -> Result<Vec<(u64, Bytes)>> {
        Ok(self
            .blocks
            .read()
            .iter()
            .map(|(id, bytes)| (*id, bytes.clone()))
            .collect())
    }
}

impl<B: BlockStore + ?Sized> BlockStore for std::sync::Arc<B> {
    fn options(&self) -> StoreOptions {
        (**self).options()
    }

    fn get(&self, id: u64) -> Result<Option<Bytes>> {
        (**self).get(id)
    }

    fn put(&self, id: u64, bytes: Bytes) -> Result<()> {
        (**self).put(id, bytes)
    }

    fn delete(&self, id: u64) -> Result<()> {
        (**self).delete(id)
    }

    fn scan(&self) -> Result<Vec<(u64, Bytes)>> {
        (**self).scan()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_missing_block() {
        let store = MemoryStore::new();
        assert_eq!(store.get(7).unwrap(), None);
    }

    #[test]
    fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put(1, Bytes::from_static(b"one")).unwrap();
        assert_eq!(store.get(1).unwrap(), Some(Bytes::from_static(b"one")));

        store.put(1, Bytes::from_static(b"uno")).unwrap();
        assert_eq!(store.get(1).unwrap(), Some(Bytes::from_static(b"uno")));

        store.delete(1).unwrap();
        assert_eq!(store.get(1).unwrap(), None);
        // Deleting again is a no-op.
        store.delete(1).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_scan_ordered_by_id() {
        let store = MemoryStore::new();
        for id in [5u64, 1, 3] {
            store.put(id, Bytes::from_static(b"x")).unwrap();
        }
        let ids: Vec<u64> = store.scan().unwrap().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![1, 3, 5]);
    }

    #[test]
    fn test_options_passthrough() {
        let options = StoreOptions::new(512, false);
        let store = MemoryStore::with_options(options);
        assert_eq!(store.options(), options);
        assert_eq!(MemoryStore::new().options(), StoreOptions::default());
    }
}
