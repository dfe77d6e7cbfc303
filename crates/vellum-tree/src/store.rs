//! Page storage contract and an in-memory implementation.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;
use vellum_common::Result;

/// Storage contract a [`crate::tree::BPlusTree`] rides on.
///
/// Implementations decide what a page id means: the in-memory store below
/// maps ids straight to buffers, while the storage driver in `vellum-store`
/// remaps external ids to internal block ids and recycles freed ones.
pub trait PageStore {
    /// Maximum serialized length of a page at rest.
    fn max_page_size(&self) -> usize;

    /// Reserved id the tree's meta page occupies.
    fn metadata_id(&self) -> u64;

    /// Reads the tree's meta page bytes, if any were ever written.
    fn get_metadata(&self) -> Result<Option<Bytes>>;

    /// Writes the tree's meta page bytes.
    fn put_metadata(&self, bytes: Bytes) -> Result<()>;

    /// Hands out a page id never returned before and not currently live.
    fn allocate(&self) -> Result<u64>;

    /// Reads a page.
    fn get(&self, id: u64) -> Result<Option<Bytes>>;

    /// Writes a page.
    fn put(&self, id: u64, bytes: Bytes) -> Result<()>;

    /// Releases a page id for later reuse.
    fn free(&self, id: u64) -> Result<()>;

    /// Collects every stored `(id, bytes)` pair. Diagnostics only.
    fn scan(&self) -> Result<Vec<(u64, Bytes)>>;
}

impl<S: PageStore + ?Sized> PageStore for &S {
    fn max_page_size(&self) -> usize {
        (**self).max_page_size()
    }

    fn metadata_id(&self) -> u64 {
        (**self).metadata_id()
    }

    fn get_metadata(&self) -> Result<Option<Bytes>> {
        (**self).get_metadata()
    }

    fn put_metadata(&self, bytes: Bytes) -> Result<()> {
        (**self).put_metadata(bytes)
    }

    fn allocate(&self) -> Result<u64> {
        (**self).allocate()
    }

    fn get(&self, id: u64) -> Result<Option<Bytes>> {
        (**self).get(id)
    }

    fn put(&self, id: u64, bytes: Bytes) -> Result<()> {
        (**self).put(id, bytes)
    }

    fn free(&self, id: u64) -> Result<()> {
        (**self).free(id)
    }

    fn scan(&self) -> Result<Vec<(u64, Bytes)>> {
        (**self).scan()
    }
}

/// In-memory page storage without id remapping.
///
/// Pages live in a map behind a lock; ids are handed out monotonically and
/// freed ids are simply dropped. Suitable for tests and for embedding a
/// tree that does not need the storage driver.
pub struct MemoryPageStore {
    max_page_size: usize,
    inner: RwLock<Inner>,
}

struct Inner {
    pages: HashMap<u64, Bytes>,
    metadata: Option<Bytes>,
    next_id: u64,
}

impl MemoryPageStore {
    /// Creates a store with the given page size limit.
    pub fn new(max_page_size: usize) -> Self {
        Self {
            max_page_size,
            inner: RwLock::new(Inner {
                pages: HashMap::new(),
                metadata: None,
                next_id: 1,
            }),
        }
    }

    /// Number of live pages.
    pub fn len(&self) -> usize {
        self.inner.read().pages.len()
    }

    /// True if no pages are stored.
    pub fn is_empty(&self) -> bool {
        self.inner.read().pages.is_empty()
    }
}

impl PageStore for MemoryPageStore {
    fn max_page_size(&self) -> usize {
        self.max_page_size
    }

    fn metadata_id(&self) -> u64 {
        0
    }

    fn get_metadata(&self) -> Result<Option<Bytes>> {
        Ok(self.inner.read().metadata.clone())
    }

    fn put_metadata(&self, bytes: Bytes) -> Result<()> {
        self.inner.write().metadata = Some(bytes);
        Ok(())
    }

    fn allocate(&self) -> Result<u64> {
        let mut inner = self.inner.write();
        let id = inner.next_id;
        inner.next_id += 1;
        Ok(id)
    }

    fn get(&self, id: u64) -> Result<Option<Bytes>> {
        Ok(self.inner.read().pages.get(&id).cloned())
    }

    fn put(&self, id: u64, bytes: Bytes) -> Result<()> {
        self.inner.write().pages.insert(id, bytes);
        Ok(())
    }

    fn free(&self, id: u64) -> Result<()> {
        self.inner.write().pages.remove(&id);
        Ok(())
    }

    fn scan(&self) -> Result<Vec<(u64, Bytes)>> {
        let inner = self.inner.read();
        let mut pages: Vec<_> = inner
            .pages
            .iter()
            .map(|(id, bytes)| (*id, bytes.clone()))
            .collect();
        pages.sort_by_key(|(id, _)| *id);
        Ok(pages)
    }
}
