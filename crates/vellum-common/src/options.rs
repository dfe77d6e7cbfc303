//! Block-store option surface.

use serde::{Deserialize, Serialize};

/// Default maximum serialized page size in bytes (4 KB).
pub const DEFAULT_PAGE_SIZE: usize = 4 * 1024;

/// Capabilities and limits a block store advertises to its consumers.
///
/// The tree sizes its pages from `max_page_size`; the storage driver
/// consults `supports_internal_delete` to decide whether a reclaimed block
/// can be physically removed or must be overwritten with a tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOptions {
    /// Maximum serialized length of a page at rest.
    pub max_page_size: usize,
    /// True if the store can delete a block outright.
    pub supports_internal_delete: bool,
}

impl StoreOptions {
    /// Creates options with the given page size and delete support.
    pub fn new(max_page_size: usize, supports_internal_delete: bool) -> Self {
        Self {
            max_page_size,
            supports_internal_delete,
        }
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_page_size: DEFAULT_PAGE_SIZE,
            supports_internal_delete: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = StoreOptions::default();
        assert_eq!(options.max_page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(options.max_page_size, 4096);
        assert!(options.supports_internal_delete);
    }

    #[test]
    fn test_new() {
        let options = StoreOptions::new(512, false);
        assert_eq!(options.max_page_size, 512);
        assert!(!options.supports_internal_delete);
    }

    #[test]
    fn test_clone_copy_eq() {
        let a = StoreOptions::new(1024, true);
        let b = a;
        assert_eq!(a, b);
        assert_ne!(a, StoreOptions::new(2048, true));
    }

    #[test]
    fn test_serde_roundtrip() {
        let original = StoreOptions::new(8192, false);
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: StoreOptions = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original, deserialized);
    }
}
