//! File-backed block store: one file per block under a directory.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use vellum_common::{Result, StoreOptions, VellumError};

/// Block store over a directory, one hex-named file per block.
///
/// The block space is sparse and unordered, so a file per block is the
/// simplest faithful layout: `put` overwrites the file, `delete` unlinks
/// it, `scan` walks the directory. Durability is best-effort (no fsync);
/// crash recovery is out of scope.
pub struct FileStore {
    dir: PathBuf,
    options: StoreOptions,
}

impl FileStore {
    /// Opens a store in `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_options(dir, StoreOptions::default())
    }

    /// Opens a store with explicit options.
    pub fn open_with_options(dir: impl Into<PathBuf>, options: StoreOptions) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, options })
    }

    /// Returns the backing directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn block_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{:016x}.block", id))
    }

    fn parse_block_name(name: &str) -> Option<u64> {
        let stem = name.strip_suffix(".block")?;
        if stem.len() != 16 {
            return None;
        }
        u64::from_str_radix(stem, 16).ok()
    }
}

impl crate::block::BlockStore for FileStore {
    fn options(&self) -> StoreOptions {
        self.options
    }

    fn get(&self, id: u64) -> Result<Option<Bytes>> {
        match fs::read(self.block_path(id)) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn put(&self, id: u64, bytes: Bytes) -> Result<()> {
        fs::write(self.block_path(id), &bytes)?;
        Ok(())
    }

    fn delete(&self, id: u64) -> Result<()> {
        match fs::remove_file(self.block_path(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn scan(&self) -> Result<Vec<(u64, Bytes)>> {
        let mut blocks = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_str().ok_or_else(|| {
                VellumError::Backend(format!("non-UTF-8 file name in {}", self.dir.display()))
            })?;
            if let Some(id) = Self::parse_block_name(name) {
                blocks.push((id, Bytes::from(fs::read(entry.path())?)));
            }
        }
        blocks.sort_by_key(|(id, _)| *id);
        Ok(blocks)
    }
}
