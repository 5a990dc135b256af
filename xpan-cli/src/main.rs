mod config;
mod paths;
mod sync;
mod transfer;

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use xpan_core::{NullProgress, ProgressSink, TokenFile, TokenProvider, XpanClient};

use crate::config::Config;
use crate::paths::remote_join;
use crate::sync::{SyncEngine, SyncOptions};
use crate::transfer::downloader::{DownloadOptions, Downloader};
use crate::transfer::hash_cache::HashCache;
use crate::transfer::resume::ResumeStore;
use crate::transfer::uploader::{UploadOptions, Uploader};
use crate::transfer::TransferError;

const EXIT_OK: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_CANCELLED: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Upload { local: PathBuf, remote: String },
    Download { remote: String, local: PathBuf },
    SyncUp { local: PathBuf, remote: String, delete: bool },
    SyncDown { remote: String, local: PathBuf, delete: bool },
    Compare { local: PathBuf, remote: String },
    Help,
}

fn parse_command<I>(args: I) -> anyhow::Result<Command>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(verb) = args.next() else {
        return Ok(Command::Help);
    };
    let mut rest: Vec<String> = args.collect();
    let delete = if let Some(pos) = rest.iter().position(|a| a == "--delete") {
        rest.remove(pos);
        true
    } else {
        false
    };
    let mut take = {
        let mut iter = rest.into_iter();
        move |what: &str| -> anyhow::Result<String> {
            iter.next()
                .ok_or_else(|| anyhow::anyhow!("missing argument: {what}"))
        }
    };
    match verb.as_str() {
        "upload" => Ok(Command::Upload {
            local: PathBuf::from(take("local path")?),
            remote: take("remote path")?,
        }),
        "download" => Ok(Command::Download {
            remote: take("remote path")?,
            local: PathBuf::from(take("local path")?),
        }),
        "syncup" => Ok(Command::SyncUp {
            local: PathBuf::from(take("local dir")?),
            remote: take("remote dir").unwrap_or_default(),
            delete,
        }),
        "syncdown" => Ok(Command::SyncDown {
            remote: take("remote dir")?,
            local: PathBuf::from(take("local dir")?),
            delete,
        }),
        "compare" => Ok(Command::Compare {
            local: PathBuf::from(take("local dir")?),
            remote: take("remote dir").unwrap_or_default(),
        }),
        "--help" | "-h" | "help" => Ok(Command::Help),
        other => anyhow::bail!("unknown command: {other}"),
    }
}

fn print_usage() {
    println!("Usage: xpan <command> [args]");
    println!("  upload <local> <remote>            upload one file");
    println!("  download <remote> <local>          download one file");
    println!("  syncup <local-dir> [remote-dir] [--delete]");
    println!("  syncdown <remote-dir> <local-dir> [--delete]");
    println!("  compare <local-dir> [remote-dir]");
    println!();
    println!("Remote paths are rooted under the app folder unless absolute.");
}

/// Remote arguments are taken relative to the configured app root unless
/// they already carry it.
fn normalize_remote(config: &Config, remote: &str) -> String {
    if remote.starts_with(&config.remote_root) {
        remote.trim_end_matches('/').to_string()
    } else {
        remote_join(&config.remote_root, remote)
    }
}

fn exit_code_for(err: &TransferError) -> i32 {
    if err.is_cancelled() {
        EXIT_CANCELLED
    } else {
        EXIT_FAILED
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let command = parse_command(std::env::args())?;
    if command == Command::Help {
        print_usage();
        return Ok(());
    }

    let config = Arc::new(Config::from_env()?);
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("[xpan] interrupt received, stopping transfers");
                cancel.cancel();
            }
        });
    }

    let provider: Arc<dyn TokenProvider> = Arc::new(TokenFile::new(config.token_file()));
    let client = XpanClient::new(provider)?;
    let cache = Arc::new(HashCache::open(config.hash_cache_file()));
    let resume = Arc::new(ResumeStore::new(config.uploads_dir(), config.downloads_dir()));
    let progress: Arc<dyn ProgressSink> = Arc::new(NullProgress);

    let uploader = Arc::new(Uploader::new(
        client.clone(),
        config.clone(),
        cache.clone(),
        resume.clone(),
        progress.clone(),
        cancel.clone(),
    ));
    let downloader = Arc::new(Downloader::new(
        client.clone(),
        config.clone(),
        resume.clone(),
        progress.clone(),
        cancel.clone(),
    ));
    let engine = SyncEngine::new(
        client,
        config.clone(),
        uploader.clone(),
        downloader.clone(),
        cancel.clone(),
    );

    let code = run(
        command,
        config.as_ref(),
        &engine,
        uploader.as_ref(),
        downloader.as_ref(),
    )
    .await;
    if let Err(err) = cache.flush() {
        eprintln!("[xpan] hash cache flush failed: {err}");
    }
    std::process::exit(code)
}

async fn run(
    command: Command,
    config: &Config,
    engine: &SyncEngine,
    uploader: &Uploader,
    downloader: &Downloader,
) -> i32 {
    match command {
        Command::Upload { local, remote } => {
            let remote = normalize_remote(config, &remote);
            match uploader
                .upload(&local, &remote, &UploadOptions::default())
                .await
            {
                Ok(file) => {
                    println!("{} fsid={}", file.path, file.fs_id);
                    EXIT_OK
                }
                Err(err) => {
                    eprintln!("[xpan] upload failed: {err}");
                    exit_code_for(&err)
                }
            }
        }
        Command::Download { remote, local } => {
            let remote = normalize_remote(config, &remote);
            match downloader
                .download(&remote, &local, &DownloadOptions::default())
                .await
            {
                Ok(path) => {
                    println!("{}", path.display());
                    EXIT_OK
                }
                Err(err) => {
                    eprintln!("[xpan] download failed: {err}");
                    exit_code_for(&err)
                }
            }
        }
        Command::SyncUp {
            local,
            remote,
            delete,
        } => {
            let remote = normalize_remote(config, &remote);
            let opts = SyncOptions {
                delete_extraneous: delete,
            };
            match engine.sync_up(&local, &remote, &opts).await {
                Ok(summary) if summary.cancelled() => EXIT_CANCELLED,
                Ok(summary) if summary.failures() > 0 => EXIT_FAILED,
                Ok(_) => EXIT_OK,
                Err(err) => {
                    eprintln!("[xpan] sync up failed: {err}");
                    exit_code_for(&err)
                }
            }
        }
        Command::SyncDown {
            remote,
            local,
            delete,
        } => {
            let remote = normalize_remote(config, &remote);
            let opts = SyncOptions {
                delete_extraneous: delete,
            };
            match engine.sync_down(&remote, &local, &opts).await {
                Ok(summary) if summary.cancelled() => EXIT_CANCELLED,
                Ok(summary) if summary.failures() > 0 => EXIT_FAILED,
                Ok(_) => EXIT_OK,
                Err(err) => {
                    eprintln!("[xpan] sync down failed: {err}");
                    exit_code_for(&err)
                }
            }
        }
        Command::Compare { local, remote } => {
            let remote = normalize_remote(config, &remote);
            match engine.compare(&local, &remote).await {
                Ok(report) => {
                    for rel in &report.local_only {
                        println!("local-only   {rel}");
                    }
                    for rel in &report.remote_only {
                        println!("remote-only  {rel}");
                    }
                    for rel in &report.different {
                        println!("different    {rel}");
                    }
                    println!(
                        "{} local-only, {} remote-only, {} different, {} same",
                        report.local_only.len(),
                        report.remote_only.len(),
                        report.different.len(),
                        report.same.len()
                    );
                    EXIT_OK
                }
                Err(err) => {
                    eprintln!("[xpan] compare failed: {err}");
                    exit_code_for(&err)
                }
            }
        }
        Command::Help => {
            print_usage();
            EXIT_OK
        }
    }
}
