//! HTTP fetches for server archives, checksum lists and mod metadata.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use sha1::Digest;
use tokio::io::AsyncWriteExt;

use fsm_core::{ProgressStage, ResourceKey};

use crate::config::Config;
use crate::progress::{ProgressReporter, percent_of};

const DEFAULT_FACTORIO_BASE: &str = "https://www.factorio.com";
const DEFAULT_MODS_BASE: &str = "https://mods.factorio.com";

/// Origins for server archives and the mod portal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub factorio_base: String,
    pub mods_base: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            factorio_base: DEFAULT_FACTORIO_BASE.to_string(),
            mods_base: DEFAULT_MODS_BASE.to_string(),
        }
    }
}

impl Endpoints {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let trim = |v: String| v.trim_end_matches('/').to_string();
        Self {
            factorio_base: crate::support::env_string("FSM_FACTORIO_BASE_URL")
                .map(trim)
                .unwrap_or(defaults.factorio_base),
            mods_base: crate::support::env_string("FSM_MODS_BASE_URL")
                .map(trim)
                .unwrap_or(defaults.mods_base),
        }
    }

    pub fn server_archive(&self, version: &str) -> String {
        format!("{}/get-download/{version}/headless/linux64", self.factorio_base)
    }

    pub fn latest_releases(&self) -> String {
        format!("{}/api/latest-releases", self.factorio_base)
    }

    pub fn server_checksums(&self) -> String {
        format!("{}/download/sha256sums/", self.factorio_base)
    }

    pub fn mod_details(&self, name: &str) -> String {
        format!("{}/api/mods/{name}", self.mods_base)
    }

    pub fn mod_download(&self, download_url: &str) -> String {
        format!(
            "{}/{}",
            self.mods_base,
            download_url.trim_start_matches('/')
        )
    }
}

pub fn require_credentials(cfg: &Config) -> anyhow::Result<()> {
    if cfg.can_download() {
        return Ok(());
    }
    Err(crate::error_payload::anyhow(
        "missing_credentials",
        "unable to download without username and token",
        None,
        Some("set username and token in the [factorio] section".to_string()),
    ))
}

/// Appends the account credentials the download origins require.
pub fn authenticated(url: &str, cfg: &Config) -> anyhow::Result<String> {
    require_credentials(cfg)?;
    let mut parsed =
        reqwest::Url::parse(url).with_context(|| format!("invalid download url {url}"))?;
    parsed
        .query_pairs_mut()
        .append_pair("username", &cfg.factorio.username)
        .append_pair("token", &cfg.factorio.token);
    Ok(parsed.to_string())
}

/// Keys with an install currently running; a second request for the same
/// key is refused instead of racing the first on disk.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    keys: Arc<Mutex<HashSet<ResourceKey>>>,
}

#[derive(Debug)]
pub struct InFlightGuard {
    keys: Arc<Mutex<HashSet<ResourceKey>>>,
    key: ResourceKey,
}

impl InFlight {
    pub fn claim(&self, key: &ResourceKey) -> Option<InFlightGuard> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if !keys.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            keys: self.keys.clone(),
            key: key.clone(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checksum {
    Sha1(String),
    Sha256(String),
}

impl Checksum {
    pub fn expected(&self) -> &str {
        match self {
            Self::Sha1(v) | Self::Sha256(v) => v,
        }
    }

    pub fn algorithm(&self) -> &'static str {
        match self {
            Self::Sha1(_) => "sha1",
            Self::Sha256(_) => "sha256",
        }
    }

    fn hasher(&self) -> StreamHasher {
        match self {
            Self::Sha1(_) => StreamHasher::Sha1(sha1::Sha1::new()),
            Self::Sha256(_) => StreamHasher::Sha256(sha2::Sha256::new()),
        }
    }

    fn matches(&self, actual_hex: &str) -> bool {
        self.expected().trim().eq_ignore_ascii_case(actual_hex)
    }
}

enum StreamHasher {
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
}

impl StreamHasher {
    fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(bytes),
            Self::Sha256(h) => h.update(bytes),
        }
    }

    fn finish(self) -> String {
        match self {
            Self::Sha1(h) => hex::encode(h.finalize()),
            Self::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request {url}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} responded with HTTP {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("decode response from {url}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("write {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{algorithm} mismatch for {}: expected {expected}, got {actual}", .path.display())]
    Integrity {
        path: PathBuf,
        algorithm: &'static str,
        expected: String,
        actual: String,
    },
}

impl FetchError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Request { .. } | Self::Decode { .. } => "fetch_failed",
            Self::Status { .. } => "upstream_status",
            Self::Io { .. } => "io_error",
            Self::Integrity { .. } => "integrity_mismatch",
        }
    }
}

/// Drops the query string so credentials never reach logs or errors.
pub fn redact(url: &str) -> String {
    url.split('?').next().unwrap_or(url).to_string()
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> FetchError + '_ {
    move |source| FetchError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("fsm-agent/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: redact(url),
                source: source.without_url(),
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: redact(url),
                status,
            });
        }
        Ok(resp)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        self.get(url)
            .await?
            .json::<T>()
            .await
            .map_err(|source| FetchError::Decode {
                url: redact(url),
                source: source.without_url(),
            })
    }

    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        self.get(url)
            .await?
            .text()
            .await
            .map_err(|source| FetchError::Decode {
                url: redact(url),
                source: source.without_url(),
            })
    }

    /// Streams `url` into `dest`, reporting Download progress, then checks
    /// the digest. A mismatching file is left at `dest`.
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        expected: &Checksum,
        reporter: &mut ProgressReporter,
    ) -> Result<u64, FetchError> {
        let resp = self.get(url).await?;
        let total = resp.content_length().unwrap_or(0);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_err(parent))?;
        }
        let part = part_path(dest);
        let mut file = tokio::fs::File::create(&part)
            .await
            .map_err(io_err(&part))?;

        tracing::info!(url = %redact(url), dest = %dest.display(), total, "download started");
        reporter.begin(ProgressStage::Download);

        let mut hasher = expected.hasher();
        let mut written = 0u64;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| FetchError::Request {
                url: redact(url),
                source: source.without_url(),
            })?;
            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(io_err(&part))?;
            written = written.saturating_add(chunk.len() as u64);
            if let Some(pct) = percent_of(written, total) {
                reporter.advance(ProgressStage::Download, pct);
            }
        }
        file.flush().await.map_err(io_err(&part))?;
        file.sync_all().await.map_err(io_err(&part))?;
        drop(file);

        tokio::fs::rename(&part, dest)
            .await
            .map_err(io_err(dest))?;

        let actual = hasher.finish();
        if !expected.matches(&actual) {
            tracing::error!(
                dest = %dest.display(),
                algorithm = expected.algorithm(),
                expected = expected.expected(),
                actual = %actual,
                "checksum mismatch"
            );
            return Err(FetchError::Integrity {
                path: dest.to_path_buf(),
                algorithm: expected.algorithm(),
                expected: expected.expected().to_string(),
                actual,
            });
        }

        tracing::info!(dest = %dest.display(), bytes = written, "download finished");
        Ok(written)
    }
}


#[cfg(test)]
mod tests {
    use axum::{Router, routing::get};
    use fsm_core::{ProgressEvent, ResourceKey};

    use super::test_server::{TestServer, chunked_body};
    use super::*;
    use crate::progress::{ProgressRegistry, ProgressSubscription};

    fn payload() -> Vec<u8> {
        (0..1000u32).map(|i| (i % 251) as u8).collect()
    }

    fn drain(sub: &mut ProgressSubscription) -> Vec<ProgressEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = sub.try_recv() {
            out.push(ev);
        }
        out
    }

    fn reporter(key: &ResourceKey) -> (ProgressReporter, ProgressSubscription) {
        let registry = ProgressRegistry::with_capacity(256);
        let sub = registry.subscribe(key.clone());
        (ProgressReporter::new(registry, key.clone()), sub)
    }

    #[test]
    fn redact_strips_credentials() {
        assert_eq!(
            redact("https://example.test/get?username=a&token=b"),
            "https://example.test/get"
        );
        assert_eq!(redact("https://example.test/x"), "https://example.test/x");
    }

    #[test]
    fn endpoints_build_origin_urls() {
        let ep = Endpoints {
            factorio_base: "http://127.0.0.1:1".to_string(),
            mods_base: "http://127.0.0.1:2".to_string(),
        };
        assert_eq!(
            ep.server_archive("2.0.7"),
            "http://127.0.0.1:1/get-download/2.0.7/headless/linux64"
        );
        assert_eq!(
            ep.mod_download("/download/Foo/abc"),
            "http://127.0.0.1:2/download/Foo/abc"
        );
        assert_eq!(ep.mod_details("Foo"), "http://127.0.0.1:2/api/mods/Foo");
        assert_eq!(ep.latest_releases(), "http://127.0.0.1:1/api/latest-releases");
    }

    #[test]
    fn in_flight_claim_is_exclusive_per_key() {
        let inflight = InFlight::default();
        let a = ResourceKey::new("stable", "1.1.110");
        let b = ResourceKey::new("stable", "2.0.7");

        let guard = inflight.claim(&a).unwrap();
        assert!(inflight.claim(&a).is_none());
        assert!(inflight.claim(&b).is_some());
        drop(guard);
        assert!(inflight.claim(&a).is_some());
    }

    #[tokio::test]
    async fn download_reports_increasing_percent_up_to_100() {
        let server = TestServer::spawn(
            Router::new().route("/file", get(|| async { chunked_body(payload()) })),
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested/file.bin");
        let key = ResourceKey::new("stable", "1.1.110");
        let (mut rep, mut sub) = reporter(&key);

        let digest = hex::encode(sha2::Sha256::digest(payload()));
        let written = Fetcher::new()
            .unwrap()
            .download(
                &format!("{}/file", server.base),
                &dest,
                &Checksum::Sha256(digest.to_uppercase()),
                &mut rep,
            )
            .await
            .unwrap();

        assert_eq!(written, 1000);
        assert_eq!(std::fs::read(&dest).unwrap(), payload());
        assert!(!part_path(&dest).exists());

        let pcts: Vec<u8> = drain(&mut sub)
            .into_iter()
            .map(|e| {
                assert_eq!(e.stage, ProgressStage::Download);
                e.percent
            })
            .collect();
        assert_eq!(pcts.first(), Some(&0));
        assert_eq!(pcts.last(), Some(&100));
        assert!(pcts.windows(2).all(|w| w[0] < w[1]));
        assert!(pcts.iter().all(|p| *p <= 100));
    }

    #[tokio::test]
    async fn checksum_mismatch_is_hard_error() {
        let server = TestServer::spawn(
            Router::new().route("/mod.zip", get(|| async { chunked_body(payload()) })),
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("mod.zip");
        let key = ResourceKey::new("SomeMod", "0.1.0");
        let (mut rep, mut sub) = reporter(&key);

        let err = Fetcher::new()
            .unwrap()
            .download(
                &format!("{}/mod.zip", server.base),
                &dest,
                &Checksum::Sha1("0000000000000000000000000000000000000000".to_string()),
                &mut rep,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Integrity { algorithm: "sha1", .. }));
        assert_eq!(err.code(), "integrity_mismatch");
        assert!(dest.exists());
        assert!(
            drain(&mut sub)
                .iter()
                .all(|e| e.stage != ProgressStage::Done)
        );
    }

    #[tokio::test]
    async fn http_error_status_is_reported_without_credentials() {
        let server = TestServer::spawn(Router::new()).await;
        let err = Fetcher::new()
            .unwrap()
            .get_text(&format!("{}/missing?username=u&token=secret", server.base))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status { status, .. } if status.as_u16() == 404));
        assert!(!err.to_string().contains("secret"));
    }
}
