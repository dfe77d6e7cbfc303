//! Page model: the tagged on-disk envelope and its three variants.
//!
//! Every page is a concatenation of three self-delimited items:
//!
//! ```text
//! +-----------+----------+------------------------------------------+
//! | id: uint  | tag:uint | body (tag-dependent)                     |
//! +-----------+----------+------------------------------------------+
//! Data body:  [is_leaf: bool][count: uint] then per element
//!             leaf:     [key: bytes][value: opt bytes]
//!             internal: [separator: opt bytes][page_id: uint]
//! Meta body:  [root_id: uint]
//! Free body:  [detached: bool]
//! ```
//!
//! The reader can identify any page from the envelope alone; decoding with
//! a mismatched type expectation is rejected.

use bytes::{Buf, Bytes, BytesMut};
use vellum_common::codec;
use vellum_common::{Result, VellumError};

use crate::tree::KeyCompare;

/// On-disk page type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageTag {
    /// B+ tree node (leaf or internal).
    Data = 1,
    /// Root pointer record for one tree.
    Meta = 2,
    /// Tombstone marking a reclaimable block.
    Free = 3,
}

impl TryFrom<u8> for PageTag {
    type Error = VellumError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PageTag::Data),
            2 => Ok(PageTag::Meta),
            3 => Ok(PageTag::Free),
            _ => Err(VellumError::corrupt(format!("unknown page tag: {}", value))),
        }
    }
}

/// A key/value pair stored in a leaf page.
///
/// `value == None` is a present-but-null value, distinct from the key being
/// absent from the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The key bytes.
    pub key: Bytes,
    /// The value bytes, or None for an explicit null.
    pub value: Option<Bytes>,
}

/// A separator/child pair stored in an internal page.
///
/// The last pointer of every internal page carries `separator == None`,
/// meaning "keys at or above the preceding separator".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pointer {
    /// Upper bound (exclusive) on keys below this child; None on the last pointer.
    pub separator: Option<Bytes>,
    /// Page id of the child.
    pub page_id: u64,
}

/// A B+ tree node: a leaf holding entries or an internal page holding
/// child pointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPage {
    /// Page id this node occupies.
    pub id: u64,
    /// True for leaf pages.
    pub is_leaf: bool,
    /// Leaf payload; empty on internal pages.
    pub entries: Vec<Entry>,
    /// Internal payload; empty on leaves.
    pub pointers: Vec<Pointer>,
}

impl DataPage {
    /// Creates an empty leaf page.
    pub fn leaf(id: u64) -> Self {
        Self {
            id,
            is_leaf: true,
            entries: Vec::new(),
            pointers: Vec::new(),
        }
    }

    /// Creates an internal page from its pointers.
    pub fn internal(id: u64, pointers: Vec<Pointer>) -> Self {
        Self {
            id,
            is_leaf: false,
            entries: Vec::new(),
            pointers,
        }
    }

    /// Binary search over the page's sorted key axis: entry keys on a leaf,
    /// the non-null separator prefix on an internal page.
    ///
    /// Returns the insertion index and whether an exact match was found.
    /// Empty pages return `(0, false)`.
    pub fn child_index(&self, key: &[u8], compare: KeyCompare) -> Result<(usize, bool)> {
        let mut low = 0usize;
        let mut high = if self.is_leaf {
            self.entries.len()
        } else {
            self.pointers.len().saturating_sub(1)
        };

        while low < high {
            let mid = low + (high - low) / 2;
            let probe: &[u8] = if self.is_leaf {
                &self.entries[mid].key
            } else {
                match &self.pointers[mid].separator {
                    Some(separator) => separator,
                    None => {
                        return Err(VellumError::KeyInvalid(
                            "null separator inside the sorted prefix".to_string(),
                        ))
                    }
                }
            };
            match compare(probe, key) {
                std::cmp::Ordering::Equal => return Ok((mid, true)),
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
            }
        }
        Ok((low, false))
    }

    /// Inserts or overwrites a key/value pair. Leaf pages only.
    ///
    /// The caller is responsible for re-checking serialized size afterwards.
    pub fn upsert_entry(&mut self, key: Bytes, value: Option<Bytes>, compare: KeyCompare) -> Result<()> {
        if !self.is_leaf {
            return Err(VellumError::corrupt(format!(
                "upsert into internal page {}",
                self.id
            )));
        }
        let (index, found) = self.child_index(&key, compare)?;
        if found {
            self.entries[index].value = value;
        } else {
            self.entries.insert(index, Entry { key, value });
        }
        Ok(())
    }

    /// Removes a key. Leaf pages only. Returns the old value if the key was
    /// present.
    pub fn delete_entry(&mut self, key: &[u8], compare: KeyCompare) -> Result<Option<Option<Bytes>>> {
        if !self.is_leaf {
            return Err(VellumError::corrupt(format!(
                "delete from internal page {}",
                self.id
            )));
        }
        let (index, found) = self.child_index(key, compare)?;
        if found {
            Ok(Some(self.entries.remove(index).value))
        } else {
            Ok(None)
        }
    }

    /// Serializes the page.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        codec::put_uint(&mut buf, self.id);
        codec::put_uint(&mut buf, PageTag::Data as u64);
        codec::put_bool(&mut buf, self.is_leaf);
        if self.is_leaf {
            codec::put_uint(&mut buf, self.entries.len() as u64);
            for entry in &self.entries {
                codec::put_bytes(&mut buf, &entry.key);
                codec::put_opt_bytes(&mut buf, entry.value.as_deref());
            }
        } else {
            codec::put_uint(&mut buf, self.pointers.len() as u64);
            for pointer in &self.pointers {
                codec::put_opt_bytes(&mut buf, pointer.separator.as_deref());
                codec::put_uint(&mut buf, pointer.page_id);
            }
        }
        buf.freeze()
    }

    /// Deserializes a data page, rejecting any other page type.
    pub fn decode(bytes: Bytes) -> Result<Self> {
        match Page::decode(bytes)? {
            Page::Data(page) => Ok(page),
            other => Err(VellumError::corrupt(format!(
                "expected a data page, found {:?}",
                other.tag()
            ))),
        }
    }
}

/// Root pointer record: names the current root page id of one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaPage {
    /// Reserved page id this record occupies.
    pub id: u64,
    /// Current root page id of the tree.
    pub root_id: u64,
}

impl MetaPage {
    /// Serializes the record.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        codec::put_uint(&mut buf, self.id);
        codec::put_uint(&mut buf, PageTag::Meta as u64);
        codec::put_uint(&mut buf, self.root_id);
        buf.freeze()
    }

    /// Deserializes a meta page, rejecting any other page type.
    pub fn decode(bytes: Bytes) -> Result<Self> {
        match Page::decode(bytes)? {
            Page::Meta(page) => Ok(page),
            other => Err(VellumError::corrupt(format!(
                "expected a meta page, found {:?}",
                other.tag()
            ))),
        }
    }
}

/// Tombstone written over a freed block until its id is reissued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreePage {
    /// Page id of the freed block.
    pub id: u64,
    /// True once the allocator has committed to reissuing this id.
    pub detached: bool,
}

impl FreePage {
    /// Serializes the tombstone.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        codec::put_uint(&mut buf, self.id);
        codec::put_uint(&mut buf, PageTag::Free as u64);
        codec::put_bool(&mut buf, self.detached);
        buf.freeze()
    }

    /// Deserializes a free page, rejecting any other page type.
    pub fn decode(bytes: Bytes) -> Result<Self> {
        match Page::decode(bytes)? {
            Page::Free(page) => Ok(page),
            other => Err(VellumError::corrupt(format!(
                "expected a free page, found {:?}",
                other.tag()
            ))),
        }
    }
}

/// Any page, decoded from its self-describing envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Page {
    /// B+ tree node.
    Data(DataPage),
    /// Root pointer record.
    Meta(MetaPage),
    /// Free-block tombstone.
    Free(FreePage),
}

impl Page {
    /// Returns the type tag of this page.
    pub fn tag(&self) -> PageTag {
        match self {
            Page::Data(_) => PageTag::Data,
            Page::Meta(_) => PageTag::Meta,
            Page::Free(_) => PageTag::Free,
        }
    }

    /// Deserializes any page from its envelope.
    pub fn decode(bytes: Bytes) -> Result<Self> {
        let mut buf = bytes;
        let id = codec::get_uint(&mut buf)?;
        let tag = codec::get_uint(&mut buf)?;
        let tag = u8::try_from(tag)
            .map_err(|_| VellumError::corrupt(format!("page tag out of range: {}", tag)))?;
        match PageTag::try_from(tag)? {
            PageTag::Data => {
                let is_leaf = codec::get_bool(&mut buf)?;
                let count = codec::get_uint(&mut buf)? as usize;
                let mut page = if is_leaf {
                    DataPage::leaf(id)
                } else {
                    DataPage::internal(id, Vec::new())
                };
                for index in 0..count {
                    if is_leaf {
                        let key = codec::get_bytes(&mut buf)?;
                        let value = codec::get_opt_bytes(&mut buf)?;
                        page.entries.push(Entry { key, value });
                    } else {
                        let separator = codec::get_opt_bytes(&mut buf)?;
                        let page_id = codec::get_uint(&mut buf)?;
                        if separator.is_none() && index + 1 != count {
                            return Err(VellumError::corrupt(format!(
                                "page {}: null separator before the last pointer",
                                id
                            )));
                        }
                        page.pointers.push(Pointer { separator, page_id });
                    }
                }
                if !is_leaf {
                    if let Some(last) = page.pointers.last() {
                        if last.separator.is_some() {
                            return Err(VellumError::corrupt(format!(
                                "page {}: last pointer carries a separator",
                                id
                            )));
                        }
                    }
                }
                if buf.has_remaining() {
                    return Err(VellumError::corrupt(format!(
                        "page {}: {} trailing bytes",
                        id,
                        buf.remaining()
                    )));
                }
                Ok(Page::Data(page))
            }
            PageTag::Meta => {
                let root_id = codec::get_uint(&mut buf)?;
                if buf.has_remaining() {
                    return Err(VellumError::corrupt(format!(
                        "page {}: {} trailing bytes",
                        id,
                        buf.remaining()
                    )));
                }
                Ok(Page::Meta(MetaPage { id, root_id }))
            }
            PageTag::Free => {
                let detached = codec::get_bool(&mut buf)?;
                if buf.has_remaining() {
                    return Err(VellumError::corrupt(format!(
                        "page {}: {} trailing bytes",
                        id,
                        buf.remaining()
                    )));
                }
                Ok(Page::Free(FreePage { id, detached }))
            }
        }
    }
}
