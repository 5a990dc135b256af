use std::env;
use std::path::PathBuf;

use thiserror::Error;

const DEFAULT_REMOTE_ROOT: &str = "/apps/bypy";

const DEFAULT_UPLOAD_CHUNK_SIZE: u64 = 4 * 1024 * 1024;
const DEFAULT_DOWNLOAD_SEGMENT_SIZE: u64 = 4 * 1024 * 1024;
const DEFAULT_UPLOAD_WORKERS: usize = 8;
const DEFAULT_DOWNLOAD_WORKERS: usize = 32;
const DEFAULT_SYNC_FILE_WORKERS: usize = 4;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_SLICE_MD5_SIZE: u64 = 256 * 1024;
const DEFAULT_RAPID_THRESHOLD: u64 = 256 * 1024;

// The provider caps the slice count per upload session (hard limit is
// around 2048 partseq values); chunk size scales up in 4 MiB units to stay
// under it.
pub const MAX_UPLOAD_SLICES: u64 = 2000;
pub const CHUNK_SIZE_UNIT: u64 = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("platform config directory is unavailable")]
    MissingConfigDir,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub remote_root: String,
    pub state_dir: PathBuf,
    pub upload_chunk_size: u64,
    pub download_segment_size: u64,
    pub upload_workers: usize,
    pub download_workers: usize,
    pub sync_file_workers: usize,
    pub max_retries: u32,
    pub slice_md5_size: u64,
    pub rapid_upload_threshold: u64,
    pub verify_download_md5: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let state_dir = match env::var("XPAN_STATE_DIR") {
            Ok(value) if !value.is_empty() => PathBuf::from(value),
            _ => dirs::config_dir()
                .ok_or(ConfigError::MissingConfigDir)?
                .join("xpan"),
        };
        Ok(Self {
            remote_root: env::var("XPAN_REMOTE_ROOT")
                .unwrap_or_else(|_| DEFAULT_REMOTE_ROOT.to_string()),
            state_dir,
            upload_chunk_size: read_u64_env("XPAN_UPLOAD_CHUNK_SIZE", DEFAULT_UPLOAD_CHUNK_SIZE),
            download_segment_size: read_u64_env(
                "XPAN_DOWNLOAD_SEGMENT_SIZE",
                DEFAULT_DOWNLOAD_SEGMENT_SIZE,
            ),
            upload_workers: read_usize_env("XPAN_UPLOAD_WORKERS", DEFAULT_UPLOAD_WORKERS),
            download_workers: read_usize_env("XPAN_DOWNLOAD_WORKERS", DEFAULT_DOWNLOAD_WORKERS),
            sync_file_workers: read_usize_env("XPAN_SYNC_FILE_WORKERS", DEFAULT_SYNC_FILE_WORKERS),
            max_retries: read_u64_env("XPAN_MAX_RETRIES", u64::from(DEFAULT_MAX_RETRIES)) as u32,
            slice_md5_size: read_u64_env("XPAN_SLICE_MD5_SIZE", DEFAULT_SLICE_MD5_SIZE),
            rapid_upload_threshold: read_u64_env("XPAN_RAPID_THRESHOLD", DEFAULT_RAPID_THRESHOLD),
            verify_download_md5: read_bool_env("XPAN_VERIFY_DOWNLOAD_MD5", false),
        })
    }

    pub fn with_state_dir(state_dir: PathBuf) -> Self {
        Self {
            remote_root: DEFAULT_REMOTE_ROOT.to_string(),
            state_dir,
            upload_chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
            download_segment_size: DEFAULT_DOWNLOAD_SEGMENT_SIZE,
            upload_workers: DEFAULT_UPLOAD_WORKERS,
            download_workers: DEFAULT_DOWNLOAD_WORKERS,
            sync_file_workers: DEFAULT_SYNC_FILE_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            slice_md5_size: DEFAULT_SLICE_MD5_SIZE,
            rapid_upload_threshold: DEFAULT_RAPID_THRESHOLD,
            verify_download_md5: false,
        }
    }

    pub fn token_file(&self) -> PathBuf {
        self.state_dir.join("token.json")
    }

    pub fn hash_cache_file(&self) -> PathBuf {
        self.state_dir.join("hash_cache.json")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.state_dir.join("uploads")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.state_dir.join("downloads")
    }

    /// Effective chunk size for a file, grown in 4 MiB units so the slice
    /// count stays under the provider's per-session cap.
    pub fn chunk_size_for(&self, file_size: u64) -> u64 {
        let base = self.upload_chunk_size.max(1);
        let chunks = file_size.div_ceil(base);
        if chunks <= MAX_UPLOAD_SLICES {
            return base;
        }
        let needed = file_size.div_ceil(MAX_UPLOAD_SLICES);
        needed.div_ceil(CHUNK_SIZE_UNIT) * CHUNK_SIZE_UNIT
    }
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn read_usize_env(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}
