//! Content-addressed storage for downloaded wallpapers and derived thumbnails.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::CoreError;
use crate::types::AssetKey;

use super::Result;

const SHARD_LEN: usize = 2;

/// Disk allowance for stored thumbnails.
pub const DEFAULT_THUMBNAIL_DISK_BUDGET: u64 = 100 * 1024 * 1024;

/// What one [`AssetStore::prune_to`] pass deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: usize,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
}

struct StoredBlob {
    path: PathBuf,
    len: u64,
    touched: SystemTime,
}

/// Single owner of the on-disk bytes. Files live under a two-level sharded layout derived from
/// the blake3 hash of the key.
#[derive(Debug, Clone)]
pub struct AssetStore {
    root: PathBuf,
}

impl AssetStore {
    /// Create or reuse a store rooted at the provided path.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| CoreError::disk_write(&root, err))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve the on-disk path of a key without touching the file system.
    pub fn path_for(&self, key: &AssetKey) -> PathBuf {
        let hash = blake3::hash(key.name().as_bytes());
        let hex = hash.to_hex();
        let (shard_one, remainder) = hex.as_str().split_at(SHARD_LEN);
        let (shard_two, remainder) = remainder.split_at(SHARD_LEN);

        self.root.join(shard_one).join(shard_two).join(format!("{remainder}.{}", key.extension()))
    }

    pub fn contains(&self, key: &AssetKey) -> bool {
        self.path_for(key).is_file()
    }

    /// Read stored bytes, `None` when the key was never written or has been deleted.
    pub fn read(&self, key: &AssetKey) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(CoreError::disk_write(path, err)),
        }
    }

    /// Atomically persist bytes for the key and return the final path.
    ///
    /// The bytes go to a temporary file in the destination shard, are synced, then renamed over
    /// the target so readers never observe a partial file.
    pub fn write(&self, key: &AssetKey, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.path_for(key);
        let Some(parent) = path.parent() else {
            return Err(CoreError::disk_write(&path, "derived asset path has no parent"));
        };

        fs::create_dir_all(parent).map_err(|err| CoreError::disk_write(parent, err))?;
        let mut tmp = NamedTempFile::new_in(parent).map_err(|err| CoreError::disk_write(parent, err))?;
        tmp.write_all(bytes).map_err(|err| CoreError::disk_write(&path, err))?;
        tmp.as_file().sync_all().map_err(|err| CoreError::disk_write(&path, err))?;
        tmp.persist(&path).map_err(|err| CoreError::disk_write(&path, err.error))?;

        debug!(key = key.name(), bytes = bytes.len(), path = %path.display(), "asset stored");
        Ok(path)
    }

    /// Mark a blob as recently used so pruning keeps it longer.
    pub fn touch(&self, key: &AssetKey) -> Result<()> {
        let path = self.path_for(key);
        fs::File::options()
            .write(true)
            .open(&path)
            .and_then(|file| file.set_modified(SystemTime::now()))
            .map_err(|err| CoreError::disk_write(path, err))
    }

    /// Once the stored blobs exceed `budget` bytes, delete the least recently written or touched
    /// ones until at most 90% of the budget remains.
    pub fn prune_to(&self, budget: u64) -> Result<PruneReport> {
        let mut blobs = Vec::new();
        collect_blobs(&self.root, 0, &mut blobs)?;
        let mut total: u64 = blobs.iter().map(|blob| blob.len).sum();
        let mut report = PruneReport { remaining_bytes: total, ..PruneReport::default() };
        if total <= budget {
            return Ok(report);
        }

        let target = budget - budget / 10;
        blobs.sort_by_key(|blob| blob.touched);
        for blob in blobs {
            if total <= target {
                break;
            }
            match fs::remove_file(&blob.path) {
                Ok(()) => {
                    report.removed += 1;
                    report.freed_bytes += blob.len;
                    total -= blob.len;
                }
                Err(err) if err.kind() == ErrorKind::NotFound => total -= blob.len,
                Err(err) => debug!(path = %blob.path.display(), %err, "could not prune blob"),
            }
        }
        report.remaining_bytes = total;
        debug!(root = %self.root.display(), removed = report.removed, freed = report.freed_bytes, "store pruned");
        Ok(report)
    }

    /// Remove a stored blob. Deleting a missing key is not an error.
    pub fn delete(&self, key: &AssetKey) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CoreError::disk_write(path, err)),
        }
    }
}

/// Files in the two shard levels below `dir`. In-flight temp files are skipped.
fn collect_blobs(dir: &Path, depth: usize, out: &mut Vec<StoredBlob>) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound && depth > 0 => return Ok(()),
        Err(err) => return Err(CoreError::disk_write(dir, err)),
    };
    for entry in entries.filter_map(|entry| entry.ok()) {
        let Ok(meta) = entry.metadata() else { continue };
        let path = entry.path();
        if meta.is_dir() && depth < 2 {
            collect_blobs(&path, depth + 1, out)?;
        } else if meta.is_file() && depth == 2 && !entry.file_name().to_string_lossy().starts_with('.') {
            let touched = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            out.push(StoredBlob { path, len: meta.len(), touched });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    /// Write `len` bytes for `name` and date it `age_secs` into the past.
    fn aged(store: &AssetStore, name: &str, len: usize, age_secs: u64) -> AssetKey {
        let key = AssetKey::new(format!("thumb::{name}"), "jpg");
        let path = store.write(&key, &vec![7; len]).unwrap();
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs)).unwrap();
        key
    }

    #[test]
    fn prune_deletes_oldest_blobs_down_to_ninety_percent() -> Result<()> {
        let temp = tempfile::tempdir().unwrap();
        let store = AssetStore::open(temp.path())?;
        let oldest = aged(&store, "a", 100, 400);
        let older = aged(&store, "b", 100, 300);
        let newer = aged(&store, "c", 100, 200);
        let newest = aged(&store, "d", 100, 100);

        let report = store.prune_to(250)?;
        assert_eq!(report, PruneReport { removed: 2, freed_bytes: 200, remaining_bytes: 200 });
        assert!(!store.contains(&oldest));
        assert!(!store.contains(&older));
        assert!(store.contains(&newer));
        assert!(store.contains(&newest));
        Ok(())
    }

    #[test]
    fn prune_within_budget_keeps_everything() -> Result<()> {
        let temp = tempfile::tempdir().unwrap();
        let store = AssetStore::open(temp.path())?;
        let key = aged(&store, "a", 100, 10);
        assert_eq!(store.prune_to(100)?, PruneReport { removed: 0, freed_bytes: 0, remaining_bytes: 100 });
        assert!(store.contains(&key));
        Ok(())
    }

    #[test]
    fn touched_blobs_outlive_newer_untouched_ones() -> Result<()> {
        let temp = tempfile::tempdir().unwrap();
        let store = AssetStore::open(temp.path())?;
        let reused = aged(&store, "reused", 100, 500);
        let idle = aged(&store, "idle", 100, 100);
        store.touch(&reused)?;

        store.prune_to(150)?;
        assert!(store.contains(&reused));
        assert!(!store.contains(&idle));
        Ok(())
    }

    #[test]
    fn touching_a_missing_blob_fails() -> Result<()> {
        let temp = tempfile::tempdir().unwrap();
        let store = AssetStore::open(temp.path())?;
        assert!(store.touch(&AssetKey::new("thumb::nope", "jpg")).is_err());
        Ok(())
    }

    #[test]
    fn write_then_read_round_trip() -> Result<()> {
        let temp = tempfile::tempdir().unwrap();
        let store = AssetStore::open(temp.path())?;
        let key = AssetKey::new("full::94x38z", "jpg");

        let path = store.write(&key, &[0xAA, 0xBB, 0xCC])?;
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("jpg"));
        assert_eq!(store.read(&key)?, Some(vec![0xAA, 0xBB, 0xCC]));
        assert!(store.contains(&key));
        Ok(())
    }

    #[test]
    fn missing_entry_returns_none() -> Result<()> {
        let temp = tempfile::tempdir().unwrap();
        let store = AssetStore::open(temp.path())?;
        assert!(store.read(&AssetKey::new("thumb::nope", "jpg"))?.is_none());
        Ok(())
    }

    #[test]
    fn delete_is_idempotent() -> Result<()> {
        let temp = tempfile::tempdir().unwrap();
        let store = AssetStore::open(temp.path())?;
        let key = AssetKey::new("thumb::gone", "jpg");
        store.write(&key, &[1, 2, 3])?;
        store.delete(&key)?;
        store.delete(&key)?;
        assert!(!store.contains(&key));
        Ok(())
    }

    #[test]
    fn rewrite_replaces_previous_bytes() -> Result<()> {
        let temp = tempfile::tempdir().unwrap();
        let store = AssetStore::open(temp.path())?;
        let key = AssetKey::new("full::swap", "png");
        store.write(&key, &[1])?;
        store.write(&key, &[2, 2])?;
        assert_eq!(store.read(&key)?, Some(vec![2, 2]));
        Ok(())
    }

    #[test]
    fn writes_use_sharded_directories() -> Result<()> {
        let temp = tempfile::tempdir().unwrap();
        let store = AssetStore::open(temp.path())?;
        let path = store.write(&AssetKey::new("full::shard", "webp"), &[9, 9])?;

        let relative = path.strip_prefix(store.root()).unwrap();
        let parts: Vec<String> =
            relative.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), SHARD_LEN);
        assert_eq!(parts[1].len(), SHARD_LEN);
        assert!(parts[2].ends_with(".webp"));
        Ok(())
    }
}
