use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::hasher::FileDigest;

/// State of an interrupted chunked upload. Chunk size and the block list are
/// fixed for the lifetime of `upload_id`; a mismatch on resume discards the
/// session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub upload_id: String,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub chunk_size: u64,
    pub total_chunks: usize,
    pub block_md5s: Vec<String>,
    pub completed: BTreeSet<usize>,
    pub digest: FileDigest,
    pub created_at: u64,
}

/// State of an interrupted segmented download. Segment `i` covers bytes
/// `[i * segment_size, min((i + 1) * segment_size, total_size))`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSession {
    pub fs_id: u64,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub total_size: u64,
    pub segment_size: u64,
    pub completed: BTreeSet<usize>,
    pub temp_path: PathBuf,
}

/// One JSON file per active transfer under the state directory. Saves go
/// through a temp file and a rename so a crash never leaves a torn session.
pub struct ResumeStore {
    uploads_dir: PathBuf,
    downloads_dir: PathBuf,
}

impl ResumeStore {
    pub fn new(uploads_dir: PathBuf, downloads_dir: PathBuf) -> Self {
        Self {
            uploads_dir,
            downloads_dir,
        }
    }

    pub fn upload_key(local_path: &Path, size: u64, chunk_size: u64, remote_path: &str) -> String {
        let material = format!(
            "{}|{size}|{chunk_size}|{remote_path}",
            local_path.to_string_lossy()
        );
        format!("{:x}", md5::compute(material.as_bytes()))
    }

    pub fn download_key(fs_id: u64, local_path: &Path) -> String {
        let material = format!("{fs_id}|{}", local_path.to_string_lossy());
        format!("{:x}", md5::compute(material.as_bytes()))
    }

    pub fn load_upload(&self, key: &str) -> Option<UploadSession> {
        load(&self.uploads_dir.join(format!("{key}.json")))
    }

    pub fn save_upload(&self, key: &str, session: &UploadSession) -> io::Result<()> {
        save(&self.uploads_dir, key, session)
    }

    pub fn clear_upload(&self, key: &str) {
        let _ = std::fs::remove_file(self.uploads_dir.join(format!("{key}.json")));
    }

    pub fn load_download(&self, key: &str) -> Option<DownloadSession> {
        load(&self.downloads_dir.join(format!("{key}.json")))
    }

    pub fn save_download(&self, key: &str, session: &DownloadSession) -> io::Result<()> {
        save(&self.downloads_dir, key, session)
    }

    pub fn clear_download(&self, key: &str) {
        let _ = std::fs::remove_file(self.downloads_dir.join(format!("{key}.json")));
    }
}

fn load<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn save<T: Serialize>(dir: &Path, key: &str, value: &T) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let serialized = serde_json::to_vec(value)?;
    let tmp = dir.join(format!("{key}.json.tmp"));
    std::fs::write(&tmp, serialized)?;
    std::fs::rename(&tmp, dir.join(format!("{key}.json")))
}
