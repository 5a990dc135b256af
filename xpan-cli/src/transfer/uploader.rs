use std::collections::BTreeSet;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use xpan_core::{ProgressSink, RemoteFile, WritePolicy, XpanClient, XpanError};

use super::hash_cache::{CachedHashes, HashCache};
use super::hasher;
use super::pool::WorkerPool;
use super::resume::{ResumeStore, UploadSession};
use super::retry::{with_retries, RetryPolicy};
use super::TransferError;
use crate::config::Config;

// Budget for re-precreating after the server drops an upload session.
const MAX_SESSION_REFRESHES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwritePolicy {
    FailIfExists,
    Overwrite,
    Rename,
    Skip,
}

impl OverwritePolicy {
    fn write_policy(self) -> WritePolicy {
        match self {
            // Skip is resolved client-side before any request goes out.
            OverwritePolicy::FailIfExists | OverwritePolicy::Skip => WritePolicy::Fail,
            OverwritePolicy::Overwrite => WritePolicy::Overwrite,
            OverwritePolicy::Rename => WritePolicy::Rename,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub chunk_size: Option<u64>,
    pub workers: Option<usize>,
    pub policy: OverwritePolicy,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: None,
            workers: None,
            policy: OverwritePolicy::Overwrite,
        }
    }
}

pub struct Uploader {
    client: XpanClient,
    config: Arc<Config>,
    cache: Arc<HashCache>,
    resume: Arc<ResumeStore>,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl Uploader {
    pub fn new(
        client: XpanClient,
        config: Arc<Config>,
        cache: Arc<HashCache>,
        resume: Arc<ResumeStore>,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            config,
            cache,
            resume,
            progress,
            cancel,
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.max_retries)
    }

    pub async fn upload(
        &self,
        local: &Path,
        remote: &str,
        opts: &UploadOptions,
    ) -> Result<RemoteFile, TransferError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let meta = tokio::fs::metadata(local).await?;
        if !meta.is_file() {
            return Err(TransferError::Protocol(format!(
                "not a regular file: {}",
                local.display()
            )));
        }
        let chunk_size = opts
            .chunk_size
            .unwrap_or_else(|| self.config.chunk_size_for(meta.len()))
            .max(1);
        let workers = opts.workers.unwrap_or(self.config.upload_workers);

        if opts.policy == OverwritePolicy::Skip {
            if let Ok(existing) = self.client.meta(remote).await {
                eprintln!("[xpan] upload skipped, remote exists: {remote}");
                return Ok(existing);
            }
        }
        let policy = opts.policy.write_policy();
        let retry = self.retry_policy();
        let provider = self.client.token_provider();

        let hashes = self.hashes_for(local, chunk_size).await?;
        let size = hashes.digest.size;
        let total_chunks = hashes.block_md5s.len();
        self.progress.set_total(size);

        // Baseline for detecting mutation while slices are in flight. The
        // cache lookup already tied the digests to this (mtime, size).
        let meta = tokio::fs::metadata(local).await?;
        if meta.len() != size {
            return Err(TransferError::FileChanged(local.to_path_buf()));
        }
        let baseline_mtime = mtime_nanos(&meta);

        let key = ResumeStore::upload_key(local, size, chunk_size, remote);

        // Zero bytes move when the provider already holds this content.
        if size >= self.config.rapid_upload_threshold {
            let digest = hashes.digest.clone();
            let probe = with_retries("rapidupload", &retry, &provider, || {
                self.client.rapid_upload(
                    remote,
                    size,
                    &digest.md5,
                    &digest.slice_md5,
                    digest.crc32,
                    policy,
                )
            })
            .await
            .map_err(|err| TransferError::from_api(err, remote))?;
            if let Some(file) = probe {
                eprintln!("[xpan] rapid upload hit: {remote}");
                self.progress.add(size);
                self.resume.clear_upload(&key);
                return Ok(file);
            }
        }

        let session = match self.resume.load_upload(&key) {
            Some(existing)
                if !existing.upload_id.is_empty()
                    && existing.chunk_size == chunk_size
                    && existing.total_chunks == total_chunks
                    && existing.block_md5s == hashes.block_md5s
                    && existing.digest == hashes.digest =>
            {
                eprintln!(
                    "[xpan] resuming upload: {}/{} slices already acknowledged",
                    existing.completed.len(),
                    existing.total_chunks
                );
                existing
            }
            Some(_) => {
                // stale session: the file or the chunking changed
                self.resume.clear_upload(&key);
                self.precreate_session(local, remote, &hashes, chunk_size, policy, &key)
                    .await?
            }
            None => {
                self.precreate_session(local, remote, &hashes, chunk_size, policy, &key)
                    .await?
            }
        };

        let done_bytes: u64 = session
            .completed
            .iter()
            .map(|i| chunk_len(size, chunk_size, *i))
            .sum();
        if done_bytes > 0 {
            self.progress.add(done_bytes);
        }

        let session = Arc::new(Mutex::new(session));
        let mut refreshes = 0u32;
        loop {
            let needed: Vec<usize> = {
                let s = session.lock().expect("upload session mutex poisoned");
                (0..total_chunks).filter(|i| !s.completed.contains(i)).collect()
            };
            if needed.is_empty() {
                break;
            }
            match self
                .upload_slices(
                    local,
                    remote,
                    &key,
                    session.clone(),
                    needed,
                    chunk_size,
                    size,
                    baseline_mtime,
                    workers,
                )
                .await
            {
                Ok(()) => {}
                Err(TransferError::SessionExpired) if refreshes < MAX_SESSION_REFRESHES => {
                    refreshes += 1;
                    eprintln!(
                        "[xpan] upload session expired, requesting a new one ({refreshes}/{MAX_SESSION_REFRESHES})"
                    );
                    let fresh = self
                        .precreate_session(local, remote, &hashes, chunk_size, policy, &key)
                        .await?;
                    *session.lock().expect("upload session mutex poisoned") = fresh;
                }
                Err(err) => {
                    if matches!(err, TransferError::FileChanged(_)) {
                        // the session no longer describes what is on disk
                        self.resume.clear_upload(&key);
                    } else {
                        let snapshot = session
                            .lock()
                            .expect("upload session mutex poisoned")
                            .clone();
                        let _ = self.resume.save_upload(&key, &snapshot);
                    }
                    return Err(err);
                }
            }
        }

        let upload_id = session
            .lock()
            .expect("upload session mutex poisoned")
            .upload_id
            .clone();
        let created = with_retries("create", &retry, &provider, || {
            self.client
                .create(&upload_id, remote, size, &hashes.block_md5s, policy)
        })
        .await
        .map_err(|err| TransferError::from_api(err, remote))?;
        if created.fs_id == 0 {
            // the session file stays behind for inspection
            return Err(TransferError::Protocol(
                "create succeeded but returned no fsid".into(),
            ));
        }
        self.resume.clear_upload(&key);
        eprintln!("[xpan] upload done: {} -> {remote}", local.display());
        Ok(created)
    }

    pub(crate) async fn hashes_for(
        &self,
        local: &Path,
        chunk_size: u64,
    ) -> Result<CachedHashes, TransferError> {
        if let Some(hit) = self.cache.lookup(local, chunk_size).await {
            return Ok(hit);
        }
        let (digest, block_md5s) =
            hasher::digest_file(local, self.config.slice_md5_size, chunk_size).await?;
        if let Err(err) = self
            .cache
            .store(local, chunk_size, digest.clone(), block_md5s.clone())
            .await
        {
            eprintln!("[xpan] hash cache store failed: {err}");
        }
        Ok(CachedHashes { digest, block_md5s })
    }

    async fn precreate_session(
        &self,
        local: &Path,
        remote: &str,
        hashes: &CachedHashes,
        chunk_size: u64,
        policy: WritePolicy,
        key: &str,
    ) -> Result<UploadSession, TransferError> {
        let size = hashes.digest.size;
        let total_chunks = hashes.block_md5s.len();
        let retry = self.retry_policy();
        let provider = self.client.token_provider();
        let pre = with_retries("precreate", &retry, &provider, || {
            self.client
                .precreate(remote, size, &hashes.block_md5s, policy)
        })
        .await
        .map_err(|err| TransferError::from_api(err, remote))?;

        if let Some(bad) = pre.needed.iter().find(|i| **i >= total_chunks) {
            return Err(TransferError::Protocol(format!(
                "precreate wants slice {bad} of {total_chunks}"
            )));
        }
        // An empty needed list on a fresh session means the server wants
        // everything, not nothing.
        let completed: BTreeSet<usize> = if pre.needed.is_empty() {
            BTreeSet::new()
        } else {
            (0..total_chunks)
                .filter(|i| !pre.needed.contains(i))
                .collect()
        };
        let session = UploadSession {
            upload_id: pre.upload_id,
            remote_path: remote.to_string(),
            local_path: local.to_path_buf(),
            chunk_size,
            total_chunks,
            block_md5s: hashes.block_md5s.clone(),
            completed,
            digest: hashes.digest.clone(),
            created_at: now_unix(),
        };
        self.resume.save_upload(key, &session)?;
        Ok(session)
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_slices(
        &self,
        local: &Path,
        remote: &str,
        key: &str,
        session: Arc<Mutex<UploadSession>>,
        needed: Vec<usize>,
        chunk_size: u64,
        size: u64,
        baseline_mtime: Option<u64>,
        workers: usize,
    ) -> Result<(), TransferError> {
        let pool = WorkerPool::new(workers);
        let client = self.client.clone();
        let provider = client.token_provider();
        let progress = self.progress.clone();
        let resume = self.resume.clone();
        let retry = self.retry_policy();
        let local = local.to_path_buf();
        let remote = remote.to_string();
        let key = key.to_string();
        let blocks = Arc::new(
            session
                .lock()
                .expect("upload session mutex poisoned")
                .block_md5s
                .clone(),
        );
        let upload_id = session
            .lock()
            .expect("upload session mutex poisoned")
            .upload_id
            .clone();

        pool.run(needed, &self.cancel, move |_, part| {
            let client = client.clone();
            let provider = provider.clone();
            let progress = progress.clone();
            let resume = resume.clone();
            let session = session.clone();
            let blocks = blocks.clone();
            let local = local.clone();
            let remote = remote.clone();
            let key = key.clone();
            let upload_id = upload_id.clone();
            async move {
                let meta = tokio::fs::metadata(&local).await?;
                if meta.len() != size || mtime_nanos(&meta) != baseline_mtime {
                    return Err(TransferError::FileChanged(local));
                }

                let offset = part as u64 * chunk_size;
                let len = chunk_len(size, chunk_size, part);
                let mut file = tokio::fs::File::open(&local).await?;
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; len as usize];
                file.read_exact(&mut buf).await?;

                let expected = blocks[part].clone();
                if format!("{:x}", md5::compute(&buf)) != expected {
                    return Err(TransferError::FileChanged(local));
                }

                with_retries("upload_slice", &retry, &provider, || {
                    let client = client.clone();
                    let remote = remote.clone();
                    let upload_id = upload_id.clone();
                    let expected = expected.clone();
                    let bytes = buf.clone();
                    async move {
                        match client.upload_slice(&upload_id, &remote, part, bytes).await {
                            Ok(server_md5) if server_md5 == expected => Ok(()),
                            Ok(server_md5) => Err(TransferError::Integrity {
                                expected,
                                actual: server_md5,
                            }),
                            Err(XpanError::Http { status, .. })
                                if status == reqwest::StatusCode::BAD_REQUEST =>
                            {
                                Err(TransferError::SessionExpired)
                            }
                            Err(err) => Err(TransferError::Api(err)),
                        }
                    }
                })
                .await?;

                progress.add(len);
                let snapshot = {
                    let mut s = session.lock().expect("upload session mutex poisoned");
                    s.completed.insert(part);
                    s.clone()
                };
                resume.save_upload(&key, &snapshot)?;
                Ok::<(), TransferError>(())
            }
        })
        .await
        .map(|_| ())
        .map_err(TransferError::from)
    }
}

fn chunk_len(size: u64, chunk_size: u64, index: usize) -> u64 {
    let start = index as u64 * chunk_size;
    (size - start).min(chunk_size)
}

fn mtime_nanos(meta: &std::fs::Metadata) -> Option<u64> {
    meta.modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_nanos() as u64)
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
#[path = "uploader_tests.rs"]
mod tests;
