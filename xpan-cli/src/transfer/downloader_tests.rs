use super::*;
use tempfile::tempdir;
use wiremock::matchers::{header, method, path as url_path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};
use xpan_core::{CountingProgress, StaticToken, TokenProvider};

const SEG: u64 = 512 * 1024;

fn make_downloader(server: &MockServer, config: Arc<Config>) -> (Downloader, Arc<CountingProgress>) {
    let provider: Arc<dyn TokenProvider> = Arc::new(StaticToken::new("test-token"));
    let client = XpanClient::with_base_urls(&server.uri(), &server.uri(), provider).unwrap();
    let resume = Arc::new(ResumeStore::new(config.uploads_dir(), config.downloads_dir()));
    let progress = Arc::new(CountingProgress::new());
    let downloader = Downloader::new(
        client,
        config,
        resume,
        progress.clone(),
        CancellationToken::new(),
    );
    (downloader, progress)
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn mount_meta(server: &MockServer, fs_id: u64, path: &str, size: u64, md5: &str) {
    let parent = path.rsplit_once('/').map(|(p, _)| p).unwrap_or("/");
    Mock::given(method("GET"))
        .and(url_path("/rest/2.0/xpan/file"))
        .and(query_param("method", "list"))
        .and(query_param("dir", parent))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errno": 0,
            "list": [
                {"fs_id": fs_id, "path": path, "isdir": 0, "size": size, "md5": md5}
            ]
        })))
        .mount(server)
        .await;
}

fn mount_dlink(server: &MockServer, fs_id: u64) -> Mock {
    Mock::given(method("GET"))
        .and(url_path("/rest/2.0/xpan/multimedia"))
        .and(query_param("method", "filemetas"))
        .and(query_param("fsids", format!("[{fs_id}]")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errno": 0,
            "list": [
                {"fs_id": fs_id, "path": "/x", "isdir": 0,
                 "dlink": format!("{}/signed/{fs_id}", server.uri())}
            ]
        })))
}

fn download_sessions(config: &Config) -> usize {
    std::fs::read_dir(config.downloads_dir())
        .map(|dir| dir.count())
        .unwrap_or(0)
}

#[tokio::test]
async fn small_file_downloads_with_single_get() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let config = Arc::new(Config::with_state_dir(dir.path().join("state")));
    let (downloader, progress) = make_downloader(&server, config);

    mount_meta(&server, 5, "/apps/bypy/a.txt", 5, "ignored").await;
    mount_dlink(&server, 5).mount(&server).await;
    Mock::given(method("GET"))
        .and(url_path("/signed/5"))
        .and(query_param("access_token", "test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
        .mount(&server)
        .await;

    let target = dir.path().join("out/a.txt");
    let path = downloader
        .download("/apps/bypy/a.txt", &target, &DownloadOptions::default())
        .await
        .unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    assert!(!temp_path(&target).exists());
    assert_eq!(progress.transferred(), 5);
}

#[tokio::test]
async fn large_file_downloads_in_parallel_segments() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let config = Arc::new(Config::with_state_dir(dir.path().join("state")));
    let (downloader, progress) = make_downloader(&server, config.clone());

    let size = (2 * SEG + 10) as usize;
    let data = payload(size);
    mount_meta(&server, 7, "/apps/bypy/big.bin", size as u64, "ignored").await;
    mount_dlink(&server, 7).mount(&server).await;
    for (seg, range) in [
        (0u64, format!("bytes=0-{}", SEG - 1)),
        (1, format!("bytes={}-{}", SEG, 2 * SEG - 1)),
        (2, format!("bytes={}-{}", 2 * SEG, size as u64 - 1)),
    ] {
        let start = (seg * SEG) as usize;
        let end = ((seg + 1) * SEG).min(size as u64) as usize;
        Mock::given(method("GET"))
            .and(url_path("/signed/7"))
            .and(header("range", range.as_str()))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(data[start..end].to_vec()))
            .mount(&server)
            .await;
    }

    let target = dir.path().join("out/big.bin");
    downloader
        .download(
            "/apps/bypy/big.bin",
            &target,
            &DownloadOptions {
                segment_size: Some(SEG),
                workers: Some(2),
            },
        )
        .await
        .unwrap();

    assert_eq!(std::fs::read(&target).unwrap(), data);
    assert!(!temp_path(&target).exists());
    assert_eq!(progress.transferred(), size as u64);
    assert_eq!(download_sessions(&config), 0);
}

#[tokio::test]
async fn forbidden_segment_refreshes_that_workers_link() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let config = Arc::new(Config::with_state_dir(dir.path().join("state")));
    let (downloader, _progress) = make_downloader(&server, config);

    let size = (2 * SEG + 10) as usize;
    let data = payload(size);
    mount_meta(&server, 9, "/apps/bypy/big.bin", size as u64, "ignored").await;
    // two initial links plus exactly one refresh after the 403
    mount_dlink(&server, 9).expect(3).mount(&server).await;

    // worker hits a stale link once on the first segment
    Mock::given(method("GET"))
        .and(url_path("/signed/9"))
        .and(header("range", format!("bytes=0-{}", SEG - 1).as_str()))
        .respond_with(ResponseTemplate::new(403))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    for (seg, range) in [
        (0u64, format!("bytes=0-{}", SEG - 1)),
        (1, format!("bytes={}-{}", SEG, 2 * SEG - 1)),
        (2, format!("bytes={}-{}", 2 * SEG, size as u64 - 1)),
    ] {
        let start = (seg * SEG) as usize;
        let end = ((seg + 1) * SEG).min(size as u64) as usize;
        Mock::given(method("GET"))
            .and(url_path("/signed/9"))
            .and(header("range", range.as_str()))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(data[start..end].to_vec()))
            .mount(&server)
            .await;
    }

    let target = dir.path().join("out/big.bin");
    downloader
        .download(
            "/apps/bypy/big.bin",
            &target,
            &DownloadOptions {
                segment_size: Some(SEG),
                workers: Some(2),
            },
        )
        .await
        .unwrap();

    assert_eq!(std::fs::read(&target).unwrap(), data);
}

#[tokio::test]
async fn resume_fetches_only_missing_segments() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let config = Arc::new(Config::with_state_dir(dir.path().join("state")));
    let (downloader, _progress) = make_downloader(&server, config.clone());

    let size = (2 * SEG + 10) as usize;
    let data = payload(size);
    let target = dir.path().join("out/big.bin");
    let temp = temp_path(&target);

    // a prior run already wrote segment 0 into the preallocated temp file
    std::fs::create_dir_all(temp.parent().unwrap()).unwrap();
    let mut prior = vec![0u8; size];
    prior[..SEG as usize].copy_from_slice(&data[..SEG as usize]);
    std::fs::write(&temp, &prior).unwrap();
    let resume = ResumeStore::new(config.uploads_dir(), config.downloads_dir());
    let key = ResumeStore::download_key(11, &target);
    resume
        .save_download(
            &key,
            &DownloadSession {
                fs_id: 11,
                remote_path: "/apps/bypy/big.bin".into(),
                local_path: target.clone(),
                total_size: size as u64,
                segment_size: SEG,
                completed: [0usize].into_iter().collect(),
                temp_path: temp.clone(),
            },
        )
        .unwrap();

    mount_meta(&server, 11, "/apps/bypy/big.bin", size as u64, "ignored").await;
    mount_dlink(&server, 11).mount(&server).await;
    // segment 0 is not mocked: requesting it again would fail the test
    for (seg, range) in [
        (1u64, format!("bytes={}-{}", SEG, 2 * SEG - 1)),
        (2, format!("bytes={}-{}", 2 * SEG, size as u64 - 1)),
    ] {
        let start = (seg * SEG) as usize;
        let end = ((seg + 1) * SEG).min(size as u64) as usize;
        Mock::given(method("GET"))
            .and(url_path("/signed/11"))
            .and(header("range", range.as_str()))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(data[start..end].to_vec()))
            .mount(&server)
            .await;
    }

    downloader
        .download(
            "/apps/bypy/big.bin",
            &target,
            &DownloadOptions {
                segment_size: Some(SEG),
                workers: Some(2),
            },
        )
        .await
        .unwrap();

    assert_eq!(std::fs::read(&target).unwrap(), data);
    assert_eq!(download_sessions(&config), 0);
}

#[tokio::test]
async fn md5_verification_rejects_corrupt_download() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let mut config = Config::with_state_dir(dir.path().join("state"));
    config.verify_download_md5 = true;
    let (downloader, _progress) = make_downloader(&server, Arc::new(config));

    mount_meta(
        &server,
        13,
        "/apps/bypy/a.txt",
        5,
        "00000000000000000000000000000000",
    )
    .await;
    mount_dlink(&server, 13).mount(&server).await;
    Mock::given(method("GET"))
        .and(url_path("/signed/13"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
        .mount(&server)
        .await;

    let target = dir.path().join("out/a.txt");
    let err = downloader
        .download("/apps/bypy/a.txt", &target, &DownloadOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::Integrity { .. }));
    assert!(!target.exists());
    assert!(!temp_path(&target).exists());
}
