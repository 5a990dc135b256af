use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;
use xpan_core::{RemoteFile, XpanClient, XpanError};

use crate::config::Config;
use crate::paths::{local_path_for, remote_join, remote_relative};
use crate::transfer::downloader::{DownloadOptions, Downloader};
use crate::transfer::retry::{with_retries, RetryPolicy};
use crate::transfer::uploader::{OverwritePolicy, UploadOptions, Uploader};
use crate::transfer::TransferError;

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub delete_extraneous: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    Upload { local: PathBuf, remote: String },
    Download { remote: String, local: PathBuf },
    DeleteLocal(PathBuf),
    DeleteRemote(String),
    Skip { path: String, reason: &'static str },
}

#[derive(Debug)]
pub struct ActionOutcome {
    pub action: SyncAction,
    pub error: Option<TransferError>,
}

#[derive(Debug, Default)]
pub struct SyncSummary {
    pub outcomes: Vec<ActionOutcome>,
}

impl SyncSummary {
    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_some()).count()
    }

    pub fn transfers(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| {
                matches!(
                    o.action,
                    SyncAction::Upload { .. } | SyncAction::Download { .. }
                ) && o.error.is_none()
            })
            .count()
    }

    pub fn cancelled(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| matches!(o.error, Some(TransferError::Cancelled)))
    }
}

#[derive(Debug, Clone)]
pub struct LocalEntry {
    pub path: PathBuf,
    pub size: u64,
}

/// Two-tree comparison, bucketed by relative path. Prior state enters
/// through the hash cache: unchanged files hit their cached md5.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub local_only: Vec<String>,
    pub remote_only: Vec<String>,
    pub different: Vec<String>,
    pub same: Vec<String>,
    pub local: BTreeMap<String, LocalEntry>,
    pub remote: BTreeMap<String, RemoteFile>,
}

pub struct SyncEngine {
    client: XpanClient,
    config: Arc<Config>,
    uploader: Arc<Uploader>,
    downloader: Arc<Downloader>,
    cancel: CancellationToken,
}

impl SyncEngine {
    pub fn new(
        client: XpanClient,
        config: Arc<Config>,
        uploader: Arc<Uploader>,
        downloader: Arc<Downloader>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            config,
            uploader,
            downloader,
            cancel,
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.max_retries)
    }

    /// Files are equal iff sizes match and the local md5 (cache-backed)
    /// equals the remote md5. Size alone is not enough and mtimes are not
    /// comparable across filesystems.
    pub async fn compare(
        &self,
        local_dir: &Path,
        remote_dir: &str,
    ) -> Result<SyncReport, TransferError> {
        let local = gather_local(local_dir)?;
        let remote = self.gather_remote(remote_dir).await?;

        let mut report = SyncReport {
            local: local.clone(),
            remote: remote.clone(),
            ..Default::default()
        };
        for rel in local.keys() {
            if !remote.contains_key(rel) {
                report.local_only.push(rel.clone());
            }
        }
        for rel in remote.keys() {
            if !local.contains_key(rel) {
                report.remote_only.push(rel.clone());
            }
        }
        for (rel, entry) in &local {
            let Some(remote_entry) = remote.get(rel) else {
                continue;
            };
            if entry.size != remote_entry.size {
                report.different.push(rel.clone());
                continue;
            }
            let local_md5 = self.local_md5(&entry.path, entry.size).await?;
            match remote_entry.md5.as_deref() {
                Some(remote_md5) if remote_md5.eq_ignore_ascii_case(&local_md5) => {
                    report.same.push(rel.clone());
                }
                _ => report.different.push(rel.clone()),
            }
        }
        Ok(report)
    }

    /// Local is the source of truth: upload new and changed files, keep
    /// everything else, optionally delete remote-only entries.
    pub async fn sync_up(
        &self,
        local_dir: &Path,
        remote_dir: &str,
        opts: &SyncOptions,
    ) -> Result<SyncSummary, TransferError> {
        let report = self.compare(local_dir, remote_dir).await?;
        let mut summary = SyncSummary::default();

        // remote root plus any intermediate directories, parents first
        let mut to_upload: Vec<String> = report
            .local_only
            .iter()
            .chain(report.different.iter())
            .cloned()
            .collect();
        to_upload.sort();
        self.ensure_remote_dirs(remote_dir, &to_upload).await?;

        let actions: Vec<SyncAction> = to_upload
            .iter()
            .map(|rel| SyncAction::Upload {
                local: report.local[rel].path.clone(),
                remote: remote_join(remote_dir, rel),
            })
            .collect();
        summary
            .outcomes
            .extend(self.run_transfers(actions).await);

        for rel in &report.same {
            summary.outcomes.push(ActionOutcome {
                action: SyncAction::Skip {
                    path: rel.clone(),
                    reason: "unchanged",
                },
                error: None,
            });
        }

        if opts.delete_extraneous && !report.remote_only.is_empty() {
            // children before their directories
            let mut doomed: Vec<String> = report
                .remote_only
                .iter()
                .map(|rel| remote_join(remote_dir, rel))
                .collect();
            doomed.sort();
            doomed.reverse();
            let retry = self.retry_policy();
            let provider = self.client.token_provider();
            let result = with_retries("delete", &retry, &provider, || self.client.delete(&doomed))
                .await
                .map_err(TransferError::Api);
            for path in doomed {
                summary.outcomes.push(ActionOutcome {
                    action: SyncAction::DeleteRemote(path),
                    error: result.as_ref().err().map(clone_for_report),
                });
            }
        } else {
            for rel in &report.remote_only {
                summary.outcomes.push(ActionOutcome {
                    action: SyncAction::Skip {
                        path: rel.clone(),
                        reason: "remote-only",
                    },
                    error: None,
                });
            }
        }

        eprintln!(
            "[xpan] sync up done: {} transferred, {} unchanged, {} failed",
            summary.transfers(),
            report.same.len(),
            summary.failures()
        );
        Ok(summary)
    }

    /// Remote is the source of truth: mirror of `sync_up`.
    pub async fn sync_down(
        &self,
        remote_dir: &str,
        local_dir: &Path,
        opts: &SyncOptions,
    ) -> Result<SyncSummary, TransferError> {
        let report = self.compare(local_dir, remote_dir).await?;
        let mut summary = SyncSummary::default();

        let mut to_download: Vec<String> = report
            .remote_only
            .iter()
            .chain(report.different.iter())
            .cloned()
            .collect();
        to_download.sort();

        let mut actions = Vec::with_capacity(to_download.len());
        for rel in &to_download {
            actions.push(SyncAction::Download {
                remote: report.remote[rel].path.clone(),
                local: local_path_for(local_dir, rel)?,
            });
        }
        summary
            .outcomes
            .extend(self.run_transfers(actions).await);

        for rel in &report.same {
            summary.outcomes.push(ActionOutcome {
                action: SyncAction::Skip {
                    path: rel.clone(),
                    reason: "unchanged",
                },
                error: None,
            });
        }

        if opts.delete_extraneous && !report.local_only.is_empty() {
            let mut doomed = report.local_only.clone();
            doomed.sort();
            doomed.reverse();
            for rel in doomed {
                let path = report.local[&rel].path.clone();
                let error = tokio::fs::remove_file(&path).await.err().map(TransferError::Io);
                summary.outcomes.push(ActionOutcome {
                    action: SyncAction::DeleteLocal(path),
                    error,
                });
            }
        } else {
            for rel in &report.local_only {
                summary.outcomes.push(ActionOutcome {
                    action: SyncAction::Skip {
                        path: rel.clone(),
                        reason: "local-only",
                    },
                    error: None,
                });
            }
        }

        eprintln!(
            "[xpan] sync down done: {} transferred, {} unchanged, {} failed",
            summary.transfers(),
            report.same.len(),
            summary.failures()
        );
        Ok(summary)
    }

    /// Bounded per-file parallelism, independent of per-file chunk and
    /// segment parallelism. One failed file never aborts the batch.
    async fn run_transfers(&self, actions: Vec<SyncAction>) -> Vec<ActionOutcome> {
        let limit = Arc::new(Semaphore::new(self.config.sync_file_workers.max(1)));
        let mut set: JoinSet<(usize, Option<TransferError>)> = JoinSet::new();
        for (index, action) in actions.iter().cloned().enumerate() {
            let limit = limit.clone();
            let uploader = self.uploader.clone();
            let downloader = self.downloader.clone();
            let cancel = self.cancel.clone();
            set.spawn(async move {
                let Ok(_permit) = limit.acquire_owned().await else {
                    return (index, Some(TransferError::Cancelled));
                };
                if cancel.is_cancelled() {
                    return (index, Some(TransferError::Cancelled));
                }
                let result = match action {
                    SyncAction::Upload { local, remote } => uploader
                        .upload(
                            &local,
                            &remote,
                            &UploadOptions {
                                policy: OverwritePolicy::Overwrite,
                                ..Default::default()
                            },
                        )
                        .await
                        .map(|_| ()),
                    SyncAction::Download { remote, local } => downloader
                        .download(&remote, &local, &DownloadOptions::default())
                        .await
                        .map(|_| ()),
                    _ => Ok(()),
                };
                (index, result.err())
            });
        }

        let mut errors: Vec<Option<TransferError>> =
            actions.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            if let Ok((index, error)) = joined {
                errors[index] = error;
            }
        }
        actions
            .into_iter()
            .zip(errors)
            .map(|(action, error)| {
                if let Some(err) = &error {
                    eprintln!("[xpan] sync action failed: {err}");
                }
                ActionOutcome { action, error }
            })
            .collect()
    }

    async fn ensure_remote_dirs(
        &self,
        remote_dir: &str,
        rels: &[String],
    ) -> Result<(), TransferError> {
        let mut dirs: Vec<String> = vec![remote_dir.trim_end_matches('/').to_string()];
        for rel in rels {
            let parts: Vec<&str> = rel.split('/').collect();
            let mut prefix = String::new();
            for part in &parts[..parts.len().saturating_sub(1)] {
                if !prefix.is_empty() {
                    prefix.push('/');
                }
                prefix.push_str(part);
                let dir = remote_join(remote_dir, &prefix);
                if !dirs.contains(&dir) {
                    dirs.push(dir);
                }
            }
        }
        dirs.sort();
        for dir in dirs {
            match self.client.mkdir(&dir).await {
                Ok(_) => {}
                // already present
                Err(XpanError::Api { errno: -8, .. }) => {}
                Err(err) => return Err(TransferError::Api(err)),
            }
        }
        Ok(())
    }

    async fn local_md5(&self, path: &Path, size: u64) -> Result<String, TransferError> {
        let chunk_size = self.config.chunk_size_for(size);
        let hashes = self.uploader.hashes_for(path, chunk_size).await?;
        Ok(hashes.digest.md5)
    }

    async fn gather_remote(
        &self,
        remote_dir: &str,
    ) -> Result<BTreeMap<String, RemoteFile>, TransferError> {
        let retry = self.retry_policy();
        let provider = self.client.token_provider();
        let entries = match with_retries("listall", &retry, &provider, || {
            self.client.list_recursive(remote_dir)
        })
        .await
        {
            Ok(entries) => entries,
            // A missing remote directory is an empty tree (first sync).
            Err(XpanError::Api { errno, errmsg, .. }) => {
                eprintln!("[xpan] remote dir not listed (errno {errno}: {errmsg}), treating as empty");
                Vec::new()
            }
            Err(err) => return Err(TransferError::Api(err)),
        };
        let mut map = BTreeMap::new();
        for entry in entries {
            if entry.is_dir() {
                continue;
            }
            let Some(rel) = remote_relative(remote_dir, &entry.path) else {
                continue;
            };
            if rel.is_empty() {
                continue;
            }
            map.insert(rel.to_string(), entry);
        }
        Ok(map)
    }
}

fn clone_for_report(err: &TransferError) -> TransferError {
    // TransferError is not Clone (io::Error); a textual stand-in is enough
    // for per-action reporting.
    TransferError::Protocol(err.to_string())
}

/// Regular files only; symlinks are not followed and never enumerated.
fn gather_local(local_dir: &Path) -> Result<BTreeMap<String, LocalEntry>, TransferError> {
    let mut map = BTreeMap::new();
    // a not-yet-created local side is an empty tree (first sync down)
    if !local_dir.exists() {
        return Ok(map);
    }
    for entry in WalkDir::new(local_dir).follow_links(false) {
        let entry = entry.map_err(|err| {
            TransferError::Io(err.into_io_error().unwrap_or_else(|| {
                std::io::Error::other("walkdir loop")
            }))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(local_dir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        map.insert(
            rel,
            LocalEntry {
                path: entry.path().to_path_buf(),
                size,
            },
        );
    }
    Ok(map)
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
