use super::*;
use tempfile::tempdir;
use wiremock::matchers::{body_string_contains, method, path as url_path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};
use xpan_core::{CountingProgress, StaticToken, TokenProvider};

fn make_uploader(server: &MockServer, config: Arc<Config>) -> (Uploader, Arc<CountingProgress>) {
    let provider: Arc<dyn TokenProvider> = Arc::new(StaticToken::new("test-token"));
    let client = XpanClient::with_base_urls(&server.uri(), &server.uri(), provider).unwrap();
    let cache = Arc::new(HashCache::open(config.hash_cache_file()));
    let resume = Arc::new(ResumeStore::new(config.uploads_dir(), config.downloads_dir()));
    let progress = Arc::new(CountingProgress::new());
    let uploader = Uploader::new(
        client,
        config,
        cache,
        resume,
        progress.clone(),
        CancellationToken::new(),
    );
    (uploader, progress)
}

fn opts(chunk_size: u64) -> UploadOptions {
    UploadOptions {
        chunk_size: Some(chunk_size),
        workers: Some(4),
        policy: OverwritePolicy::Overwrite,
    }
}

fn hex_md5(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

fn session_files(config: &Config) -> usize {
    std::fs::read_dir(config.uploads_dir())
        .map(|dir| dir.count())
        .unwrap_or(0)
}

#[tokio::test]
async fn rapid_upload_hit_moves_no_bytes() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let local = dir.path().join("a.bin");
    std::fs::write(&local, b"0123456789ab").unwrap();

    let mut config = Config::with_state_dir(dir.path().join("state"));
    config.rapid_upload_threshold = 8;
    let (uploader, progress) = make_uploader(&server, Arc::new(config));

    // only the probe is mocked: any precreate or slice request would 404
    Mock::given(method("POST"))
        .and(url_path("/rest/2.0/pcs/file"))
        .and(query_param("method", "rapidupload"))
        .and(body_string_contains(format!(
            "content-md5={}",
            hex_md5(b"0123456789ab")
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errno": 0,
            "fs_id": 99u64,
            "path": "/apps/bypy/a.bin",
            "size": 12,
            "md5": hex_md5(b"0123456789ab")
        })))
        .mount(&server)
        .await;

    let file = uploader
        .upload(&local, "/apps/bypy/a.bin", &opts(4))
        .await
        .unwrap();

    assert_eq!(file.fs_id, 99);
    assert_eq!(progress.transferred(), 12);
}

#[tokio::test]
async fn chunked_upload_runs_precreate_slices_create() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let local = dir.path().join("a.bin");
    std::fs::write(&local, b"abcdefghij").unwrap();

    let config = Arc::new(Config::with_state_dir(dir.path().join("state")));
    let (uploader, progress) = make_uploader(&server, config.clone());

    let blocks = [hex_md5(b"abcd"), hex_md5(b"efgh"), hex_md5(b"ij")];
    Mock::given(method("POST"))
        .and(url_path("/rest/2.0/xpan/file"))
        .and(query_param("method", "precreate"))
        .and(body_string_contains(blocks[0].as_str()))
        .and(body_string_contains(blocks[2].as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errno": 0,
            "uploadid": "sess-1",
            "return_type": 1,
            "block_list": [0, 1, 2]
        })))
        .mount(&server)
        .await;
    for (seq, block_md5) in blocks.iter().enumerate() {
        Mock::given(method("POST"))
            .and(url_path("/rest/2.0/pcs/superfile2"))
            .and(query_param("uploadid", "sess-1"))
            .and(query_param("partseq", seq.to_string()))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "md5": block_md5 })),
            )
            .mount(&server)
            .await;
    }
    Mock::given(method("POST"))
        .and(url_path("/rest/2.0/xpan/file"))
        .and(query_param("method", "create"))
        .and(body_string_contains("uploadid=sess-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errno": 0,
            "fs_id": 7u64,
            "path": "/apps/bypy/a.bin",
            "size": 10,
            "md5": hex_md5(b"abcdefghij")
        })))
        .mount(&server)
        .await;

    let file = uploader
        .upload(&local, "/apps/bypy/a.bin", &opts(4))
        .await
        .unwrap();

    assert_eq!(file.fs_id, 7);
    assert_eq!(progress.transferred(), 10);
    assert_eq!(session_files(&config), 0);
}

#[tokio::test]
async fn resume_uploads_only_missing_slices() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let local = dir.path().join("a.bin");
    std::fs::write(&local, b"abcdefghij").unwrap();

    let config = Arc::new(Config::with_state_dir(dir.path().join("state")));
    let (uploader, progress) = make_uploader(&server, config.clone());

    // a prior run left slice 0 acknowledged under sess-1
    let (digest, blocks) = hasher::digest_file(&local, config.slice_md5_size, 4)
        .await
        .unwrap();
    let key = ResumeStore::upload_key(&local, 10, 4, "/apps/bypy/a.bin");
    let resume = ResumeStore::new(config.uploads_dir(), config.downloads_dir());
    resume
        .save_upload(
            &key,
            &UploadSession {
                upload_id: "sess-1".into(),
                remote_path: "/apps/bypy/a.bin".into(),
                local_path: local.clone(),
                chunk_size: 4,
                total_chunks: 3,
                block_md5s: blocks.clone(),
                completed: BTreeSet::from([0]),
                digest,
                created_at: 1_700_000_000,
            },
        )
        .unwrap();

    // precreate is not mocked: resuming must not re-declare the session
    for seq in [1usize, 2] {
        Mock::given(method("POST"))
            .and(url_path("/rest/2.0/pcs/superfile2"))
            .and(query_param("uploadid", "sess-1"))
            .and(query_param("partseq", seq.to_string()))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "md5": blocks[seq] })),
            )
            .mount(&server)
            .await;
    }
    Mock::given(method("POST"))
        .and(url_path("/rest/2.0/xpan/file"))
        .and(query_param("method", "create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errno": 0,
            "fs_id": 7u64,
            "path": "/apps/bypy/a.bin",
            "size": 10
        })))
        .mount(&server)
        .await;

    let file = uploader
        .upload(&local, "/apps/bypy/a.bin", &opts(4))
        .await
        .unwrap();

    assert_eq!(file.fs_id, 7);
    // 4 resumed bytes + 6 freshly uploaded
    assert_eq!(progress.transferred(), 10);
    assert_eq!(session_files(&config), 0);
}

#[tokio::test]
async fn expired_session_is_recreated_and_upload_finishes() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let local = dir.path().join("a.bin");
    std::fs::write(&local, b"abcdefgh").unwrap();

    let config = Arc::new(Config::with_state_dir(dir.path().join("state")));
    let (uploader, _progress) = make_uploader(&server, config.clone());

    let (digest, blocks) = hasher::digest_file(&local, config.slice_md5_size, 4)
        .await
        .unwrap();
    let key = ResumeStore::upload_key(&local, 8, 4, "/apps/bypy/a.bin");
    let resume = ResumeStore::new(config.uploads_dir(), config.downloads_dir());
    resume
        .save_upload(
            &key,
            &UploadSession {
                upload_id: "stale".into(),
                remote_path: "/apps/bypy/a.bin".into(),
                local_path: local.clone(),
                chunk_size: 4,
                total_chunks: 2,
                block_md5s: blocks.clone(),
                completed: BTreeSet::new(),
                digest,
                created_at: 1_700_000_000,
            },
        )
        .unwrap();

    // the server no longer knows "stale"
    Mock::given(method("POST"))
        .and(url_path("/rest/2.0/pcs/superfile2"))
        .and(query_param("uploadid", "stale"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(url_path("/rest/2.0/xpan/file"))
        .and(query_param("method", "precreate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errno": 0,
            "uploadid": "sess-2",
            "return_type": 1,
            "block_list": [0, 1]
        })))
        .mount(&server)
        .await;
    for (seq, block_md5) in blocks.iter().enumerate() {
        Mock::given(method("POST"))
            .and(url_path("/rest/2.0/pcs/superfile2"))
            .and(query_param("uploadid", "sess-2"))
            .and(query_param("partseq", seq.to_string()))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "md5": block_md5 })),
            )
            .mount(&server)
            .await;
    }
    Mock::given(method("POST"))
        .and(url_path("/rest/2.0/xpan/file"))
        .and(query_param("method", "create"))
        .and(body_string_contains("uploadid=sess-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errno": 0,
            "fs_id": 11u64,
            "path": "/apps/bypy/a.bin",
            "size": 8
        })))
        .mount(&server)
        .await;

    let file = uploader
        .upload(&local, "/apps/bypy/a.bin", &opts(4))
        .await
        .unwrap();
    assert_eq!(file.fs_id, 11);
}

#[tokio::test]
async fn corrupted_slice_is_retried_until_server_md5_matches() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let local = dir.path().join("a.bin");
    std::fs::write(&local, b"abcd").unwrap();

    let config = Arc::new(Config::with_state_dir(dir.path().join("state")));
    let (uploader, _progress) = make_uploader(&server, config);

    Mock::given(method("POST"))
        .and(url_path("/rest/2.0/xpan/file"))
        .and(query_param("method", "precreate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errno": 0,
            "uploadid": "sess-1",
            "return_type": 1,
            "block_list": [0]
        })))
        .mount(&server)
        .await;
    // first attempt arrives corrupted; the next one is clean
    Mock::given(method("POST"))
        .and(url_path("/rest/2.0/pcs/superfile2"))
        .and(query_param("partseq", "0"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "md5": "0000deadbeef0000" })),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(url_path("/rest/2.0/pcs/superfile2"))
        .and(query_param("partseq", "0"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "md5": hex_md5(b"abcd") })),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(url_path("/rest/2.0/xpan/file"))
        .and(query_param("method", "create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errno": 0,
            "fs_id": 13u64,
            "path": "/apps/bypy/a.bin",
            "size": 4
        })))
        .mount(&server)
        .await;

    let file = uploader
        .upload(&local, "/apps/bypy/a.bin", &opts(4))
        .await
        .unwrap();
    assert_eq!(file.fs_id, 13);
}

#[tokio::test]
async fn empty_file_uploads_zero_slices() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let local = dir.path().join("empty.bin");
    std::fs::write(&local, b"").unwrap();

    let config = Arc::new(Config::with_state_dir(dir.path().join("state")));
    let (uploader, _progress) = make_uploader(&server, config);

    Mock::given(method("POST"))
        .and(url_path("/rest/2.0/xpan/file"))
        .and(query_param("method", "precreate"))
        .and(body_string_contains("block_list=%5B%5D"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errno": 0,
            "uploadid": "sess-1",
            "return_type": 1,
            "block_list": []
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(url_path("/rest/2.0/xpan/file"))
        .and(query_param("method", "create"))
        .and(body_string_contains("size=0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errno": 0,
            "fs_id": 21u64,
            "path": "/apps/bypy/empty.bin",
            "size": 0
        })))
        .mount(&server)
        .await;

    let file = uploader
        .upload(&local, "/apps/bypy/empty.bin", &opts(4))
        .await
        .unwrap();
    assert_eq!(file.fs_id, 21);
}

#[tokio::test]
async fn fail_if_exists_reports_conflict() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let local = dir.path().join("a.bin");
    std::fs::write(&local, b"abcd").unwrap();

    let config = Arc::new(Config::with_state_dir(dir.path().join("state")));
    let (uploader, _progress) = make_uploader(&server, config);

    Mock::given(method("POST"))
        .and(url_path("/rest/2.0/xpan/file"))
        .and(query_param("method", "precreate"))
        .and(body_string_contains("rtype=0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errno": -8,
            "errmsg": "file already exists"
        })))
        .mount(&server)
        .await;

    let err = uploader
        .upload(
            &local,
            "/apps/bypy/a.bin",
            &UploadOptions {
                chunk_size: Some(4),
                workers: Some(2),
                policy: OverwritePolicy::FailIfExists,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Conflict(_)));
}

#[tokio::test]
async fn skip_policy_returns_existing_remote_file() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let local = dir.path().join("a.bin");
    std::fs::write(&local, b"abcd").unwrap();

    let config = Arc::new(Config::with_state_dir(dir.path().join("state")));
    let (uploader, progress) = make_uploader(&server, config);

    Mock::given(method("GET"))
        .and(url_path("/rest/2.0/xpan/file"))
        .and(query_param("method", "list"))
        .and(query_param("dir", "/apps/bypy"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "errno": 0,
            "list": [
                {"fs_id": 31u64, "path": "/apps/bypy/a.bin", "isdir": 0, "size": 4}
            ]
        })))
        .mount(&server)
        .await;

    let file = uploader
        .upload(
            &local,
            "/apps/bypy/a.bin",
            &UploadOptions {
                chunk_size: Some(4),
                workers: Some(2),
                policy: OverwritePolicy::Skip,
            },
        )
        .await
        .unwrap();
    assert_eq!(file.fs_id, 31);
    assert_eq!(progress.transferred(), 0);
}
