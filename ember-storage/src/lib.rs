use std::collections::HashMap;
use std::path::Path;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive backend: {0}")]
    Backend(String),
    #[error("corrupt archive value under key {0}")]
    Corrupt(String),
}

impl From<sled::Error> for ArchiveError {
    fn from(e: sled::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

/// Durable block archive. The chain keeps the working copy in memory and
/// treats the archive as an opaque byte store keyed by height and hash.
pub trait BlockArchive: Send + Sync {
    /// Persists a serialised block under its height key, its hash key and
    /// the latest-height marker in one atomic write.
    fn save_block(&self, index: u64, hash: &str, bytes: &[u8]) -> Result<(), ArchiveError>;
    fn block_by_index(&self, index: u64) -> Result<Option<Vec<u8>>, ArchiveError>;
    fn block_by_hash(&self, hash: &str) -> Result<Option<Vec<u8>>, ArchiveError>;
    /// Height of the most recently saved block; `None` for a fresh archive.
    fn height(&self) -> Result<Option<u64>, ArchiveError>;
    /// Flushes outstanding writes. Called once on shutdown.
    fn close(&self) -> Result<(), ArchiveError>;
}

const HEIGHT_KEY: &str = "blockchain:height";

fn index_key(index: u64) -> String {
    format!("block:index:{index}")
}

fn hash_key(hash: &str) -> String {
    format!("block:hash:{hash}")
}

/// sled-backed archive living under the node's `--db-path`.
pub struct SledArchive {
    db: sled::Db,
}

impl SledArchive {
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let db = sled::open(path)?;
        debug!(path = %path.display(), "opened block archive");
        Ok(Self { db })
    }
}

impl BlockArchive for SledArchive {
    fn save_block(&self, index: u64, hash: &str, bytes: &[u8]) -> Result<(), ArchiveError> {
        let height_bytes =
            serde_json::to_vec(&index).map_err(|e| ArchiveError::Backend(e.to_string()))?;
        let ik = index_key(index);
        let hk = hash_key(hash);
        let res: sled::transaction::TransactionResult<()> = self.db.transaction(|t| {
            t.insert(ik.as_bytes(), bytes)?;
            t.insert(hk.as_bytes(), bytes)?;
            t.insert(HEIGHT_KEY.as_bytes(), height_bytes.as_slice())?;
            Ok(())
        });
        res.map_err(|e| ArchiveError::Backend(format!("{e:?}")))
    }

    fn block_by_index(&self, index: u64) -> Result<Option<Vec<u8>>, ArchiveError> {
        Ok(self.db.get(index_key(index))?.map(|v| v.to_vec()))
    }

    fn block_by_hash(&self, hash: &str) -> Result<Option<Vec<u8>>, ArchiveError> {
        Ok(self.db.get(hash_key(hash))?.map(|v| v.to_vec()))
    }

    fn height(&self) -> Result<Option<u64>, ArchiveError> {
        match self.db.get(HEIGHT_KEY)? {
            None => Ok(None),
            Some(v) => serde_json::from_slice(&v)
                .map(Some)
                .map_err(|_| ArchiveError::Corrupt(HEIGHT_KEY.to_string())),
        }
    }

    fn close(&self) -> Result<(), ArchiveError> {
        self.db.flush()?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryInner {
    by_index: HashMap<u64, Vec<u8>>,
    by_hash: HashMap<String, Vec<u8>>,
    height: Option<u64>,
}

/// In-memory archive for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryArchive {
    inner: RwLock<MemoryInner>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockArchive for MemoryArchive {
    fn save_block(&self, index: u64, hash: &str, bytes: &[u8]) -> Result<(), ArchiveError> {
        let mut inner = self.inner.write();
        inner.by_index.insert(index, bytes.to_vec());
        inner.by_hash.insert(hash.to_string(), bytes.to_vec());
        inner.height = Some(inner.height.map_or(index, |h| h.max(index)));
        Ok(())
    }

    fn block_by_index(&self, index: u64) -> Result<Option<Vec<u8>>, ArchiveError> {
        Ok(self.inner.read().by_index.get(&index).cloned())
    }

    fn block_by_hash(&self, hash: &str) -> Result<Option<Vec<u8>>, ArchiveError> {
        Ok(self.inner.read().by_hash.get(hash).cloned())
    }

    fn height(&self) -> Result<Option<u64>, ArchiveError> {
        Ok(self.inner.read().height)
    }

    fn close(&self) -> Result<(), ArchiveError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(archive: &dyn BlockArchive) {
        assert_eq!(archive.height().unwrap(), None);
        archive.save_block(0, "aa", b"genesis").unwrap();
        archive.save_block(1, "bb", b"next").unwrap();
        assert_eq!(archive.height().unwrap(), Some(1));
        assert_eq!(archive.block_by_index(0).unwrap().unwrap(), b"genesis");
        assert_eq!(archive.block_by_hash("bb").unwrap().unwrap(), b"next");
        assert_eq!(archive.block_by_index(7).unwrap(), None);
        assert_eq!(archive.block_by_hash("cc").unwrap(), None);
    }

    #[test]
    fn memory_archive_roundtrip() {
        roundtrip(&MemoryArchive::new());
    }

    #[test]
    fn sled_archive_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = SledArchive::open(dir.path()).unwrap();
        roundtrip(&archive);
        archive.close().unwrap();
    }

    #[test]
    fn sled_archive_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let archive = SledArchive::open(dir.path()).unwrap();
            archive.save_block(0, "aa", b"genesis").unwrap();
            archive.close().unwrap();
        }
        let archive = SledArchive::open(dir.path()).unwrap();
        assert_eq!(archive.height().unwrap(), Some(0));
        assert_eq!(archive.block_by_hash("aa").unwrap().unwrap(), b"genesis");
    }
}
