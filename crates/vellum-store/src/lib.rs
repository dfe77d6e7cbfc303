//! Block stores and the storage driver for VellumDB.
//!
//! This crate provides:
//! - The `BlockStore` contract: an unordered byte map keyed by integer id
//! - `MemoryStore` and `FileStore` backends
//! - `StorageDriver`: the two-level layer between a B+ tree and a raw
//!   block store, pairing an external-to-internal id map with a persistent
//!   free-page index, both stored as B+ trees over the same block store

pub mod block;
pub mod driver;
pub mod file;

pub use block::{BlockStore, MemoryStore};
pub use driver::{StorageDriver, DATA_META_ID, FREE_MAP_META_ID, ID_MAP_META_ID, RESERVED_IDS};
pub use file::FileStore;
