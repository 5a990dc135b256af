use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use url::Url;
use xpan_core::{ProgressSink, XpanClient, XpanError};

use super::pool::WorkerPool;
use super::resume::{DownloadSession, ResumeStore};
use super::retry::{with_retries, RetryPolicy};
use super::{hasher, TransferError};
use crate::config::Config;

// Below this size segmentation costs more than it buys.
const SMALL_FILE_THRESHOLD: u64 = 1024 * 1024;
// Session flush cadence, in completed segments.
const FLUSH_EVERY: usize = 8;

#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    pub segment_size: Option<u64>,
    pub workers: Option<usize>,
}

pub struct Downloader {
    client: XpanClient,
    config: Arc<Config>,
    resume: Arc<ResumeStore>,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl Downloader {
    pub fn new(
        client: XpanClient,
        config: Arc<Config>,
        resume: Arc<ResumeStore>,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            config,
            resume,
            progress,
            cancel,
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.max_retries)
    }

    pub async fn download(
        &self,
        remote: &str,
        local: &Path,
        opts: &DownloadOptions,
    ) -> Result<PathBuf, TransferError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let retry = self.retry_policy();
        let provider = self.client.token_provider();

        let meta = with_retries("meta", &retry, &provider, || self.client.meta(remote))
            .await
            .map_err(TransferError::Api)?;
        if meta.is_dir() {
            return Err(TransferError::Protocol(format!(
                "remote path is a directory: {remote}"
            )));
        }
        let size = meta.size;
        self.progress.set_total(size);

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = temp_path(local);

        if size < SMALL_FILE_THRESHOLD {
            self.download_small(meta.fs_id, meta.md5.as_deref(), size, local, &temp)
                .await?;
        } else {
            self.download_segmented(
                meta.fs_id,
                remote,
                meta.md5.as_deref(),
                size,
                local,
                &temp,
                opts,
            )
            .await?;
        }
        eprintln!("[xpan] download done: {remote} -> {}", local.display());
        Ok(local.to_path_buf())
    }

    /// One plain GET into the temp file, then rename.
    async fn download_small(
        &self,
        fs_id: u64,
        remote_md5: Option<&str>,
        size: u64,
        local: &Path,
        temp: &Path,
    ) -> Result<(), TransferError> {
        let retry = self.retry_policy();
        let provider = self.client.token_provider();
        let dlink = with_retries("dlink", &retry, &provider, || self.client.dlink(fs_id))
            .await
            .map_err(TransferError::Api)?;

        with_retries("download", &retry, &provider, || {
            let dlink = dlink.clone();
            async move {
                let response = self
                    .client
                    .download_range(&dlink, None)
                    .await
                    .map_err(TransferError::Api)?;
                let mut file = tokio::fs::File::create(temp).await?;
                let mut stream = response.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(XpanError::Request)?;
                    tokio::io::AsyncWriteExt::write_all(&mut file, &chunk).await?;
                    self.progress.add(chunk.len() as u64);
                }
                tokio::io::AsyncWriteExt::flush(&mut file).await?;
                file.sync_all().await?;
                Ok::<(), TransferError>(())
            }
        })
        .await?;

        self.finalize(size, remote_md5, local, temp, None).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn download_segmented(
        &self,
        fs_id: u64,
        remote: &str,
        remote_md5: Option<&str>,
        size: u64,
        local: &Path,
        temp: &Path,
        opts: &DownloadOptions,
    ) -> Result<(), TransferError> {
        let segment_size = opts
            .segment_size
            .unwrap_or(self.config.download_segment_size)
            .max(1);
        let total_segments = size.div_ceil(segment_size) as usize;
        let retry = self.retry_policy();
        let provider = self.client.token_provider();
        let key = ResumeStore::download_key(fs_id, local);

        let session = match self.resume.load_download(&key) {
            Some(existing)
                if existing.fs_id == fs_id
                    && existing.total_size == size
                    && existing.segment_size == segment_size
                    && tokio::fs::metadata(temp).await.is_ok() =>
            {
                eprintln!(
                    "[xpan] resuming download: {}/{} segments already on disk",
                    existing.completed.len(),
                    total_segments
                );
                existing
            }
            other => {
                if other.is_some() {
                    self.resume.clear_download(&key);
                }
                let _ = tokio::fs::remove_file(temp).await;
                DownloadSession {
                    fs_id,
                    remote_path: remote.to_string(),
                    local_path: local.to_path_buf(),
                    total_size: size,
                    segment_size,
                    completed: Default::default(),
                    temp_path: temp.to_path_buf(),
                }
            }
        };

        let needed: Vec<usize> =
            (0..total_segments).filter(|i| !session.completed.contains(i)).collect();
        let done_bytes: u64 = session
            .completed
            .iter()
            .map(|i| segment_len(size, segment_size, *i))
            .sum();
        if done_bytes > 0 {
            self.progress.add(done_bytes);
        }

        // Sparse preallocation; all writes are positional, no shared cursor.
        let file = {
            let temp = temp.to_path_buf();
            tokio::task::spawn_blocking(move || -> io::Result<std::fs::File> {
                let file = std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&temp)?;
                file.set_len(size)?;
                Ok(file)
            })
            .await
            .map_err(|err| io::Error::other(err.to_string()))??
        };
        let file = Arc::new(file);

        self.resume.save_download(&key, &session)?;
        if needed.is_empty() {
            return self.finalize(size, remote_md5, local, temp, Some(&key)).await;
        }

        // One signed link per worker: independent links dodge per-connection
        // throttling. Segment i uses slot i mod links.
        let workers = opts
            .workers
            .unwrap_or(self.config.download_workers)
            .min(needed.len())
            .max(1);
        let links = futures_util::future::try_join_all((0..workers).map(|_| {
            with_retries("dlink", &retry, &provider, || self.client.dlink(fs_id))
        }))
        .await
        .map_err(TransferError::Api)?;
        let links: Arc<Vec<tokio::sync::RwLock<Url>>> =
            Arc::new(links.into_iter().map(tokio::sync::RwLock::new).collect());

        let session = Arc::new(Mutex::new(session));
        let pool = WorkerPool::new(workers);
        let outcome = {
            let client = self.client.clone();
            let provider = provider.clone();
            let progress = self.progress.clone();
            let resume = self.resume.clone();
            let session = session.clone();
            let links = links.clone();
            let file = file.clone();
            let key = key.clone();
            pool.run(needed, &self.cancel, move |_, segment| {
                let client = client.clone();
                let provider = provider.clone();
                let progress = progress.clone();
                let resume = resume.clone();
                let session = session.clone();
                let links = links.clone();
                let file = file.clone();
                let key = key.clone();
                async move {
                    let start = segment as u64 * segment_size;
                    let end = (start + segment_size).min(size) - 1;
                    let slot = segment % links.len();

                    with_retries("segment", &retry, &provider, || {
                        let client = client.clone();
                        let progress = progress.clone();
                        let links = links.clone();
                        let file = file.clone();
                        async move {
                            let url = links[slot].read().await.clone();
                            let response = match client.download_range(&url, Some((start, end))).await
                            {
                                Ok(response) => response,
                                Err(XpanError::Http { status, .. })
                                    if status == reqwest::StatusCode::FORBIDDEN =>
                                {
                                    // signed URLs expire; fetch a fresh one for
                                    // this slot and re-issue the range
                                    let fresh =
                                        client.dlink(fs_id).await.map_err(TransferError::Api)?;
                                    *links[slot].write().await = fresh;
                                    return Err(TransferError::LinkExpired);
                                }
                                Err(err) => return Err(TransferError::Api(err)),
                            };

                            let expected_len = end - start + 1;
                            let mut buf = Vec::with_capacity(expected_len as usize);
                            let mut stream = response.bytes_stream();
                            while let Some(chunk) = stream.next().await {
                                let chunk = chunk.map_err(XpanError::Request)?;
                                progress.add(chunk.len() as u64);
                                buf.extend_from_slice(&chunk);
                            }
                            if buf.len() as u64 != expected_len {
                                return Err(TransferError::Integrity {
                                    expected: format!("{expected_len} bytes"),
                                    actual: format!("{} bytes", buf.len()),
                                });
                            }

                            tokio::task::spawn_blocking(move || file.write_all_at(&buf, start))
                                .await
                                .map_err(|err| io::Error::other(err.to_string()))??;
                            Ok(())
                        }
                    })
                    .await?;

                    let flush_due = {
                        let mut s = session.lock().expect("download session mutex poisoned");
                        s.completed.insert(segment);
                        if s.completed.len() % FLUSH_EVERY == 0 {
                            Some(s.clone())
                        } else {
                            None
                        }
                    };
                    if let Some(snapshot) = flush_due {
                        resume.save_download(&key, &snapshot)?;
                    }
                    Ok::<(), TransferError>(())
                }
            })
            .await
        };

        // Flush the session on every exit path, cancellation included.
        let snapshot = session
            .lock()
            .expect("download session mutex poisoned")
            .clone();
        let _ = self.resume.save_download(&key, &snapshot);
        outcome.map(|_| ()).map_err(TransferError::from)?;

        let sync_handle = file.clone();
        let _ = tokio::task::spawn_blocking(move || sync_handle.sync_all()).await;

        self.finalize(size, remote_md5, local, temp, Some(&key)).await
    }

    /// Mandatory length check, opt-in md5 check, then temp -> final rename.
    async fn finalize(
        &self,
        size: u64,
        remote_md5: Option<&str>,
        local: &Path,
        temp: &Path,
        session_key: Option<&str>,
    ) -> Result<(), TransferError> {
        let actual = tokio::fs::metadata(temp).await?.len();
        if actual != size {
            let _ = tokio::fs::remove_file(temp).await;
            return Err(TransferError::Integrity {
                expected: format!("{size} bytes"),
                actual: format!("{actual} bytes"),
            });
        }

        // The provider's md5 is non-standard for some large files, so this
        // stays opt-in.
        if self.config.verify_download_md5 {
            if let Some(expected) = remote_md5 {
                let (digest, _) = hasher::digest_file(temp, self.config.slice_md5_size, size.max(1))
                    .await?;
                if digest.md5 != expected.to_ascii_lowercase() {
                    let _ = tokio::fs::remove_file(temp).await;
                    return Err(TransferError::Integrity {
                        expected: expected.to_ascii_lowercase(),
                        actual: digest.md5,
                    });
                }
            }
        }

        tokio::fs::rename(temp, local).await?;
        if let Some(key) = session_key {
            self.resume.clear_download(key);
        }
        Ok(())
    }
}

fn temp_path(local: &Path) -> PathBuf {
    let mut name = local.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

fn segment_len(size: u64, segment_size: u64, index: usize) -> u64 {
    let start = index as u64 * segment_size;
    (size - start).min(segment_size)
}

#[cfg(test)]
#[path = "downloader_tests.rs"]
mod tests;
