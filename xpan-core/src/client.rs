use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::token::{TokenError, TokenProvider};

const DEFAULT_API_BASE: &str = "https://pan.baidu.com";
const DEFAULT_PCS_BASE: &str = "https://d.pcs.baidu.com";
const USER_AGENT: &str = "pan.baidu.com";

const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);
const TRANSFER_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

// Provider error codes that matter to classification.
const ERRNO_TOKEN_INVALID: i64 = -6;
const ERRNO_ACCESS_TOKEN_INVALID: i64 = 110;
const ERRNO_ACCESS_TOKEN_EXPIRED: i64 = 111;
const ERRNO_RATE_LIMIT: i64 = 31034;
const ERRNO_NO_RAPID_MATCH: i64 = 31079;

#[derive(Debug, Error)]
pub enum XpanError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("malformed api response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("api errno {errno}: {errmsg} (request_id {request_id})")]
    Api {
        errno: i64,
        errmsg: String,
        request_id: String,
    },
    #[error("api returned {status}: {body}")]
    Http { status: StatusCode, body: String },
    #[error("token error: {0}")]
    Token(#[from] TokenError),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Auth,
    RateLimit,
    Transient,
    Fatal,
}

impl XpanError {
    pub fn classification(&self) -> ErrorClass {
        match self {
            XpanError::Api { errno, .. } => match *errno {
                ERRNO_TOKEN_INVALID | ERRNO_ACCESS_TOKEN_INVALID | ERRNO_ACCESS_TOKEN_EXPIRED => {
                    ErrorClass::Auth
                }
                ERRNO_RATE_LIMIT => ErrorClass::RateLimit,
                _ => ErrorClass::Fatal,
            },
            XpanError::Http { status, .. } => classify_status(*status),
            // Transport failures (resets, timeouts) are worth another attempt.
            XpanError::Request(_) => ErrorClass::Transient,
            XpanError::Token(_) => ErrorClass::Auth,
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            ErrorClass::RateLimit | ErrorClass::Transient
        )
    }
}

fn classify_status(status: StatusCode) -> ErrorClass {
    if status == StatusCode::UNAUTHORIZED {
        ErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

/// Server-side behavior when the target path already exists.
/// `Skip` has no wire representation; callers resolve it before the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    Fail,
    Rename,
    Overwrite,
}

impl WritePolicy {
    fn rtype(self) -> u32 {
        match self {
            WritePolicy::Fail => 0,
            WritePolicy::Rename => 1,
            WritePolicy::Overwrite => 3,
        }
    }

    fn ondup(self) -> &'static str {
        match self {
            WritePolicy::Fail => "fail",
            WritePolicy::Rename => "newcopy",
            WritePolicy::Overwrite => "overwrite",
        }
    }
}

#[derive(Clone)]
pub struct XpanClient {
    http: Client,
    data: Client,
    api_base: Url,
    pcs_base: Url,
    token: Arc<dyn TokenProvider>,
}

impl XpanClient {
    pub fn new(token: Arc<dyn TokenProvider>) -> Result<Self, XpanError> {
        Self::with_base_urls(DEFAULT_API_BASE, DEFAULT_PCS_BASE, token)
    }

    pub fn with_base_urls(
        api_base: &str,
        pcs_base: &str,
        token: Arc<dyn TokenProvider>,
    ) -> Result<Self, XpanError> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(CONTROL_TIMEOUT)
            .build()?;
        // Transfers carry multi-megabyte bodies: no total deadline, only an
        // idle watchdog that trips when no byte moves for a while.
        let data = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONTROL_TIMEOUT)
            .read_timeout(TRANSFER_IDLE_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            data,
            api_base: Url::parse(api_base)?,
            pcs_base: Url::parse(pcs_base)?,
            token,
        })
    }

    pub fn token_provider(&self) -> Arc<dyn TokenProvider> {
        self.token.clone()
    }

    // ── Upload protocol ───────────────────────────────────────────

    /// Content-addressed dedup probe. `Ok(None)` means the server holds no
    /// copy with these digests and a byte upload is required.
    pub async fn rapid_upload(
        &self,
        remote_path: &str,
        size: u64,
        md5: &str,
        slice_md5: &str,
        crc32: u32,
        policy: WritePolicy,
    ) -> Result<Option<RemoteFile>, XpanError> {
        let url = self.endpoint(&self.pcs_base, "/rest/2.0/pcs/file", "rapidupload")?;
        let form = [
            ("path", remote_path.to_string()),
            ("content-length", size.to_string()),
            ("content-md5", md5.to_string()),
            ("slice-md5", slice_md5.to_string()),
            ("content-crc32", crc32.to_string()),
            ("ondup", policy.ondup().to_string()),
        ];
        let response = self.http.post(url).form(&form).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        match Self::check::<RemoteFile>(response).await {
            Ok(file) => Ok(Some(file)),
            Err(XpanError::Api { errno, .. }) if errno == ERRNO_NO_RAPID_MATCH => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Declares an upload: path, size, and the ordered per-chunk md5 list.
    /// The response names the chunk indices the server still wants.
    pub async fn precreate(
        &self,
        remote_path: &str,
        size: u64,
        block_md5s: &[String],
        policy: WritePolicy,
    ) -> Result<Precreated, XpanError> {
        let url = self.endpoint(&self.api_base, "/rest/2.0/xpan/file", "precreate")?;
        let form = [
            ("path", remote_path.to_string()),
            ("size", size.to_string()),
            ("isdir", "0".to_string()),
            ("autoinit", "1".to_string()),
            ("rtype", policy.rtype().to_string()),
            ("block_list", serde_json::to_string(block_md5s)?),
        ];
        let response = self.http.post(url).form(&form).send().await?;
        let parsed: PrecreateResponse = Self::check(response).await?;
        Ok(Precreated {
            upload_id: parsed.uploadid,
            needed: parsed.block_list,
        })
    }

    /// Uploads one chunk under an open session. Returns the md5 the server
    /// computed for the received bytes.
    pub async fn upload_slice(
        &self,
        upload_id: &str,
        remote_path: &str,
        partseq: usize,
        bytes: Vec<u8>,
    ) -> Result<String, XpanError> {
        let mut url = self.endpoint(&self.pcs_base, "/rest/2.0/pcs/superfile2", "upload")?;
        url.query_pairs_mut()
            .append_pair("type", "tmpfile")
            .append_pair("path", remote_path)
            .append_pair("uploadid", upload_id)
            .append_pair("partseq", &partseq.to_string());
        let part = reqwest::multipart::Part::bytes(bytes).file_name("chunk");
        let form = reqwest::multipart::Form::new().part("file", part);
        let response = self.data.post(url).multipart(form).send().await?;
        let parsed: SliceResponse = Self::check(response).await?;
        Ok(parsed.md5)
    }

    /// Commits an upload session. All chunks must have been received.
    pub async fn create(
        &self,
        upload_id: &str,
        remote_path: &str,
        size: u64,
        block_md5s: &[String],
        policy: WritePolicy,
    ) -> Result<RemoteFile, XpanError> {
        let url = self.endpoint(&self.api_base, "/rest/2.0/xpan/file", "create")?;
        let form = [
            ("path", remote_path.to_string()),
            ("size", size.to_string()),
            ("isdir", "0".to_string()),
            ("rtype", policy.rtype().to_string()),
            ("uploadid", upload_id.to_string()),
            ("block_list", serde_json::to_string(block_md5s)?),
        ];
        let response = self.http.post(url).form(&form).send().await?;
        Self::check(response).await
    }

    pub async fn mkdir(&self, remote_path: &str) -> Result<RemoteFile, XpanError> {
        let url = self.endpoint(&self.api_base, "/rest/2.0/xpan/file", "create")?;
        let response = self
            .http
            .post(url)
            .form(&[
                ("path", remote_path),
                ("size", "0"),
                ("isdir", "1"),
                ("rtype", "0"),
                ("block_list", "[]"),
            ])
            .send()
            .await?;
        Self::check(response).await
    }

    // ── Listing / metadata ────────────────────────────────────────

    pub async fn list(
        &self,
        dir: &str,
        start: u32,
        limit: u32,
    ) -> Result<Vec<RemoteFile>, XpanError> {
        let mut url = self.endpoint(&self.api_base, "/rest/2.0/xpan/file", "list")?;
        url.query_pairs_mut()
            .append_pair("dir", dir)
            .append_pair("start", &start.to_string())
            .append_pair("limit", &limit.to_string());
        let response = self.http.get(url).send().await?;
        let parsed: ListResponse = Self::check(response).await?;
        Ok(parsed.list)
    }

    pub async fn list_recursive_page(
        &self,
        dir: &str,
        start: u64,
        limit: u32,
    ) -> Result<FileListPage, XpanError> {
        let mut url = self.endpoint(&self.api_base, "/rest/2.0/xpan/multimedia", "listall")?;
        url.query_pairs_mut()
            .append_pair("path", dir)
            .append_pair("recursion", "1")
            .append_pair("start", &start.to_string())
            .append_pair("limit", &limit.to_string());
        let response = self.http.get(url).send().await?;
        let parsed: ListAllResponse = Self::check(response).await?;
        Ok(FileListPage {
            entries: parsed.list,
            has_more: parsed.has_more != 0,
            cursor: parsed.cursor,
        })
    }

    /// Exhausts listall pagination for a directory subtree.
    pub async fn list_recursive(&self, dir: &str) -> Result<Vec<RemoteFile>, XpanError> {
        let mut entries = Vec::new();
        let mut start = 0u64;
        loop {
            let page = self.list_recursive_page(dir, start, 1000).await?;
            let empty = page.entries.is_empty();
            entries.extend(page.entries);
            if !page.has_more {
                break;
            }
            // A paginating server that advances nowhere would loop forever.
            if page.cursor <= start && empty {
                return Err(XpanError::Protocol(format!(
                    "listall cursor did not advance past {start}"
                )));
            }
            start = page.cursor.max(start + 1);
        }
        Ok(entries)
    }

    /// Metadata for a single path, resolved through its parent listing.
    pub async fn meta(&self, remote_path: &str) -> Result<RemoteFile, XpanError> {
        let (parent, _name) = split_remote_path(remote_path)
            .ok_or_else(|| XpanError::Protocol(format!("cannot stat root path {remote_path}")))?;
        let mut start = 0u32;
        loop {
            let page = self.list(&parent, start, 1000).await?;
            if page.is_empty() {
                break;
            }
            let count = page.len();
            if let Some(found) = page.into_iter().find(|entry| entry.path == remote_path) {
                return Ok(found);
            }
            if count < 1000 {
                break;
            }
            start += count as u32;
        }
        Err(XpanError::Api {
            errno: -9,
            errmsg: format!("file does not exist: {remote_path}"),
            request_id: String::new(),
        })
    }

    /// Short-lived signed download URL for a file id.
    pub async fn dlink(&self, fs_id: u64) -> Result<Url, XpanError> {
        let mut url = self.endpoint(&self.api_base, "/rest/2.0/xpan/multimedia", "filemetas")?;
        url.query_pairs_mut()
            .append_pair("fsids", &format!("[{fs_id}]"))
            .append_pair("dlink", "1");
        let response = self.http.get(url).send().await?;
        let parsed: ListResponse = Self::check(response).await?;
        let entry = parsed
            .list
            .into_iter()
            .next()
            .ok_or_else(|| XpanError::Protocol(format!("no metadata for fs_id {fs_id}")))?;
        let dlink = entry
            .dlink
            .ok_or_else(|| XpanError::Protocol(format!("no dlink for fs_id {fs_id}")))?;
        Ok(Url::parse(&dlink)?)
    }

    pub async fn delete(&self, remote_paths: &[String]) -> Result<(), XpanError> {
        let mut url = self.endpoint(&self.api_base, "/rest/2.0/xpan/file", "filemanager")?;
        url.query_pairs_mut().append_pair("opera", "delete");
        let filelist = serde_json::to_string(remote_paths)?;
        let response = self
            .http
            .post(url)
            .form(&[("async", "0"), ("filelist", filelist.as_str()), ("ondup", "fail")])
            .send()
            .await?;
        let _: serde_json::Value = Self::check(response).await?;
        Ok(())
    }

    pub async fn quota(&self) -> Result<Quota, XpanError> {
        let mut url = self.api_base.join("/api/quota")?;
        url.query_pairs_mut()
            .append_pair("access_token", &self.token.current_token()?)
            .append_pair("checkfree", "1")
            .append_pair("checkexpire", "1");
        let response = self.http.get(url).send().await?;
        Self::check(response).await
    }

    pub async fn uinfo(&self) -> Result<UserInfo, XpanError> {
        let url = self.endpoint(&self.api_base, "/rest/2.0/xpan/nas", "uinfo")?;
        let response = self.http.get(url).send().await?;
        Self::check(response).await
    }

    // ── Data plane ────────────────────────────────────────────────

    /// Opens a streaming GET against a signed download URL, optionally for a
    /// byte range. The caller consumes the body chunk stream.
    pub async fn download_range(
        &self,
        dlink: &Url,
        range: Option<(u64, u64)>,
    ) -> Result<reqwest::Response, XpanError> {
        let mut url = dlink.clone();
        url.query_pairs_mut()
            .append_pair("access_token", &self.token.current_token()?);
        let mut request = self.data.get(url);
        if let Some((start, end)) = range {
            request = request.header("Range", format!("bytes={start}-{end}"));
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(XpanError::Http {
                status,
                body: String::new(),
            });
        }
        Ok(response)
    }

    // ── Internals ─────────────────────────────────────────────────

    fn endpoint(&self, base: &Url, path: &str, method: &str) -> Result<Url, XpanError> {
        let mut url = base.join(path)?;
        url.query_pairs_mut()
            .append_pair("method", method)
            .append_pair("access_token", &self.token.current_token()?);
        Ok(url)
    }

    async fn check<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, XpanError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(XpanError::Http { status, body });
        }
        let value: serde_json::Value = response.json().await?;
        let errno = value.get("errno").and_then(|v| v.as_i64()).unwrap_or(0);
        if errno != 0 {
            return Err(XpanError::Api {
                errno,
                errmsg: value
                    .get("errmsg")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                request_id: value
                    .get("request_id")
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            });
        }
        Ok(serde_json::from_value(value)?)
    }
}

fn split_remote_path(path: &str) -> Option<(String, String)> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    let name = &trimmed[idx + 1..];
    if name.is_empty() {
        return None;
    }
    let parent = if idx == 0 { "/" } else { &trimmed[..idx] };
    Some((parent.to_string(), name.to_string()))
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteFile {
    pub fs_id: u64,
    pub path: String,
    #[serde(default)]
    pub server_filename: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub server_mtime: i64,
    #[serde(default)]
    pub isdir: u32,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub dlink: Option<String>,
}

impl RemoteFile {
    pub fn is_dir(&self) -> bool {
        self.isdir != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Precreated {
    pub upload_id: String,
    pub needed: Vec<usize>,
}

#[derive(Debug, Deserialize)]
struct PrecreateResponse {
    uploadid: String,
    #[serde(default)]
    block_list: Vec<usize>,
}

#[derive(Debug, Deserialize)]
struct SliceResponse {
    md5: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    list: Vec<RemoteFile>,
}

#[derive(Debug, Deserialize)]
struct ListAllResponse {
    #[serde(default)]
    list: Vec<RemoteFile>,
    #[serde(default)]
    has_more: u32,
    #[serde(default)]
    cursor: u64,
}

#[derive(Debug, Clone)]
pub struct FileListPage {
    pub entries: Vec<RemoteFile>,
    pub has_more: bool,
    pub cursor: u64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Quota {
    pub total: u64,
    pub used: u64,
    #[serde(default)]
    pub free: u64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct UserInfo {
    #[serde(default)]
    pub baidu_name: String,
    #[serde(default)]
    pub netdisk_name: String,
    pub uk: u64,
    #[serde(default)]
    pub vip_type: u32,
}
