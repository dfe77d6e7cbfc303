//! Page-oriented B+ tree engine for VellumDB.
//!
//! This crate provides:
//! - The tagged page model: data pages (leaf/internal), meta pages, and
//!   free-page tombstones, all sharing one self-describing envelope
//! - The `PageStore` contract a tree rides on, plus an in-memory store
//! - The `BPlusTree` engine: lookup, ordered successor, upsert, delete,
//!   with splitting, borrowing, merging, and root collapse driven by
//!   serialized page size

pub mod page;
pub mod store;
pub mod tree;

pub use page::{DataPage, Entry, FreePage, MetaPage, Page, PageTag, Pointer};
pub use store::{MemoryPageStore, PageStore};
pub use tree::{compare_keys, BPlusTree, KeyCompare, TreeStats, FILL_FACTOR};
