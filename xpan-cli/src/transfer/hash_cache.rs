use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

use super::hasher::FileDigest;

/// Digest cache keyed by `(absolute path, mtime, size)`. Any change to the
/// keying tuple invalidates the entry; losing the whole cache only costs
/// recomputation. Stores are appended to a journal and folded into the
/// snapshot on `flush`.
pub struct HashCache {
    snapshot_path: PathBuf,
    journal_path: PathBuf,
    map: RwLock<HashMap<String, StoredEntry>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredEntry {
    mtime_nanos: u64,
    size: u64,
    chunk_size: u64,
    digest: FileDigest,
    block_md5s: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalRecord {
    path: String,
    entry: StoredEntry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedHashes {
    pub digest: FileDigest,
    pub block_md5s: Vec<String>,
}

impl HashCache {
    /// Loads the snapshot and replays the journal over it. Corrupt state is
    /// discarded silently; the cache starts empty in that case.
    pub fn open(snapshot_path: PathBuf) -> Self {
        let journal_path = journal_path_for(&snapshot_path);
        let mut map: HashMap<String, StoredEntry> = std::fs::read_to_string(&snapshot_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        if let Ok(journal) = std::fs::read_to_string(&journal_path) {
            for line in journal.lines() {
                let Ok(record) = serde_json::from_str::<JournalRecord>(line) else {
                    break;
                };
                map.insert(record.path, record.entry);
            }
        }
        Self {
            snapshot_path,
            journal_path,
            map: RwLock::new(map),
        }
    }

    pub async fn lookup(&self, path: &Path, chunk_size: u64) -> Option<CachedHashes> {
        let meta = tokio::fs::metadata(path).await.ok()?;
        let mtime_nanos = mtime_nanos(&meta)?;
        let key = cache_key(path);
        let map = self.map.read().expect("hash cache lock poisoned");
        let entry = map.get(&key)?;
        if entry.mtime_nanos != mtime_nanos
            || entry.size != meta.len()
            || entry.chunk_size != chunk_size
        {
            return None;
        }
        Some(CachedHashes {
            digest: entry.digest.clone(),
            block_md5s: entry.block_md5s.clone(),
        })
    }

    pub async fn store(
        &self,
        path: &Path,
        chunk_size: u64,
        digest: FileDigest,
        block_md5s: Vec<String>,
    ) -> io::Result<()> {
        let meta = tokio::fs::metadata(path).await?;
        let Some(mtime_nanos) = mtime_nanos(&meta) else {
            return Ok(());
        };
        let key = cache_key(path);
        let entry = StoredEntry {
            mtime_nanos,
            size: meta.len(),
            chunk_size,
            digest,
            block_md5s,
        };
        let line = serde_json::to_string(&JournalRecord {
            path: key.clone(),
            entry: entry.clone(),
        })?;

        let mut map = self.map.write().expect("hash cache lock poisoned");
        map.insert(key, entry);
        if let Some(parent) = self.journal_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut journal = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)?;
        writeln!(journal, "{line}")?;
        Ok(())
    }

    /// Rewrites the snapshot atomically and truncates the journal. The lock
    /// is held throughout so no store lands between snapshot and truncate.
    pub fn flush(&self) -> io::Result<()> {
        let map = self.map.read().expect("hash cache lock poisoned");
        let serialized = serde_json::to_vec(&*map)?;

        if let Some(parent) = self.snapshot_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.snapshot_path.with_extension("json.tmp");
        std::fs::write(&tmp, serialized)?;
        std::fs::rename(&tmp, &self.snapshot_path)?;
        let _ = std::fs::remove_file(&self.journal_path);
        Ok(())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map.read().expect("hash cache lock poisoned").len()
    }
}

fn journal_path_for(snapshot: &Path) -> PathBuf {
    snapshot.with_extension("journal")
}

fn cache_key(path: &Path) -> String {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    abs.to_string_lossy().into_owned()
}

fn mtime_nanos(meta: &std::fs::Metadata) -> Option<u64> {
    meta.modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_nanos() as u64)
}
