use std::{
    collections::BTreeMap,
    fs,
    io::{BufReader, Read, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use fsm_core::{ProgressStage, ResourceKey};

use crate::{
    config::{Config, ConfigStore},
    error_payload,
    fetch::{self, Checksum, Endpoints, Fetcher, InFlight},
    progress::{ProgressRegistry, ProgressReporter, percent_of},
    support::validate_segment,
};

const XZ_BUFFER_BYTES: usize = 32 * 1024;

pub fn archive_name(version: &str) -> String {
    format!("factorio-headless_linux_{version}.tar.xz")
}

/// `<downloads>/<branch>/factorio-headless_linux_<version>.tar.xz`
pub fn archive_path(cfg: &Config, branch: &str, version: &str) -> PathBuf {
    cfg.downloads_dir().join(branch).join(archive_name(version))
}

/// Finds the digest for `file_name` in a `sha256sums` listing.
pub fn find_sha256(listing: &str, file_name: &str) -> Option<String> {
    listing.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let digest = parts.next()?;
        let name = parts.next()?.trim_start_matches('*');
        (name == file_name).then(|| digest.to_string())
    })
}

/// Uncompressed size from `xz --robot --list` output.
pub fn parse_xz_robot_list(out: &str) -> Option<u64> {
    let field = |kind: &str| {
        out.lines().find_map(|line| {
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.first() != Some(&kind) {
                return None;
            }
            cols.get(4)?.trim().parse::<u64>().ok()
        })
    };
    field("totals").or_else(|| field("file")).filter(|v| *v > 0)
}

async fn probe_uncompressed_size(archive: &Path) -> Option<u64> {
    let out = tokio::process::Command::new("xz")
        .arg("--robot")
        .arg("--list")
        .arg(archive)
        .stdin(std::process::Stdio::null())
        .output()
        .await;
    match out {
        Ok(o) if o.status.success() => parse_xz_robot_list(&String::from_utf8_lossy(&o.stdout)),
        Ok(o) => {
            tracing::warn!(archive = %archive.display(), code = ?o.status.code(), "xz --list failed");
            None
        }
        Err(err) => {
            tracing::warn!(archive = %archive.display(), error = %err, "xz --list unavailable");
            None
        }
    }
}

/// Decompresses to an intermediate `.tar` next to the archive, then extracts
/// it entry by entry.
///
/// Phase A maps decompressed bytes to 0..=50 when the size is known. Phase B
/// reports `50 + index % 50` per entry; the reporter suppresses anything that
/// would move backwards.
fn unpack_blocking(
    archive: &Path,
    target: &Path,
    expected_tar_bytes: Option<u64>,
    reporter: &mut ProgressReporter,
) -> anyhow::Result<()> {
    let tar_path = archive.with_extension("");
    let res = unpack_via(archive, &tar_path, target, expected_tar_bytes, reporter);
    match fs::remove_file(&tar_path) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %tar_path.display(), error = %err, "remove intermediate tar failed");
        }
        _ => {}
    }
    res
}

fn unpack_via(
    archive: &Path,
    tar_path: &Path,
    target: &Path,
    expected_tar_bytes: Option<u64>,
    reporter: &mut ProgressReporter,
) -> anyhow::Result<()> {
    {
        let src = fs::File::open(archive)
            .with_context(|| format!("open archive {}", archive.display()))?;
        let mut decoder = xz2::read::XzDecoder::new_multi_decoder(BufReader::new(src));
        let mut out = fs::File::create(tar_path)
            .with_context(|| format!("create {}", tar_path.display()))?;

        let mut buf = vec![0u8; XZ_BUFFER_BYTES];
        let mut written = 0u64;
        loop {
            let n = decoder
                .read(&mut buf)
                .with_context(|| format!("decompress {}", archive.display()))?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])
                .with_context(|| format!("write {}", tar_path.display()))?;
            written = written.saturating_add(n as u64);
            if let Some(pct) = expected_tar_bytes.and_then(|t| percent_of(written, t)) {
                reporter.advance(ProgressStage::Unpack, pct / 2);
            }
        }
        out.sync_all()
            .with_context(|| format!("sync {}", tar_path.display()))?;
    }

    let file = fs::File::open(tar_path).with_context(|| format!("open {}", tar_path.display()))?;
    let mut tar = tar::Archive::new(BufReader::new(file));
    tar.set_preserve_permissions(true);
    let entries = tar
        .entries()
        .with_context(|| format!("read {}", tar_path.display()))?;
    for (i, entry) in entries.enumerate() {
        let mut entry = entry.with_context(|| format!("read entry in {}", tar_path.display()))?;
        let unpacked = entry
            .unpack_in(target)
            .with_context(|| format!("extract into {}", target.display()))?;
        if !unpacked {
            tracing::warn!(entry = i, "skipped archive entry outside the install dir");
        }
        reporter.advance(ProgressStage::Unpack, 50 + (i % 50) as u8);
    }
    Ok(())
}

/// Downloads and unpacks headless server builds under
/// `<server_versions>/<branch>/<version>`.
#[derive(Debug, Clone)]
pub struct ServerInstaller {
    config: ConfigStore,
    fetcher: Fetcher,
    endpoints: Endpoints,
    progress: ProgressRegistry,
    in_flight: InFlight,
}

impl ServerInstaller {
    pub fn new(
        config: ConfigStore,
        fetcher: Fetcher,
        endpoints: Endpoints,
        progress: ProgressRegistry,
    ) -> Self {
        Self {
            config,
            fetcher,
            endpoints,
            progress,
            in_flight: InFlight::default(),
        }
    }

    pub async fn install(&self, branch: &str, version: &str) -> anyhow::Result<PathBuf> {
        validate_segment("branch", branch)?;
        validate_segment("version", version)?;

        let key = ResourceKey::new(branch, version);
        let Some(_claim) = self.in_flight.claim(&key) else {
            return Err(error_payload::anyhow(
                "install_in_progress",
                format!("{key} is already being installed"),
                None,
                None,
            ));
        };

        let cfg = self.config.current();
        let mut reporter = ProgressReporter::new(self.progress.clone(), key);
        let archive = archive_path(&cfg, branch, version);

        if archive.exists() {
            tracing::info!(archive = %archive.display(), "using cached server archive");
        } else {
            self.download(&cfg, version, &archive, &mut reporter).await?;
        }

        let target = cfg.install_dir_for(branch, version);
        tokio::fs::create_dir_all(&target)
            .await
            .with_context(|| format!("create {}", target.display()))?;

        tracing::info!(branch, version, target = %target.display(), "extracting server");
        reporter.begin(ProgressStage::Unpack);
        let expected = probe_uncompressed_size(&archive).await;
        let mut reporter = {
            let archive = archive.clone();
            let target = target.clone();
            tokio::task::spawn_blocking(move || -> anyhow::Result<ProgressReporter> {
                unpack_blocking(&archive, &target, expected, &mut reporter)?;
                Ok(reporter)
            })
            .await
            .context("unpack task panicked")??
        };

        reporter.done();
        tracing::info!(branch, version, "installed server");
        Ok(target)
    }

    /// Upstream `latest-releases` document, passed through as-is.
    pub async fn latest_releases(&self) -> anyhow::Result<serde_json::Value> {
        let releases = self
            .fetcher
            .get_json::<serde_json::Value>(&self.endpoints.latest_releases())
            .await
            .context("fetch latest releases")?;
        Ok(releases)
    }

    async fn download(
        &self,
        cfg: &Config,
        version: &str,
        archive: &Path,
        reporter: &mut ProgressReporter,
    ) -> anyhow::Result<()> {
        let url = fetch::authenticated(&self.endpoints.server_archive(version), cfg)?;
        let listing = self
            .fetcher
            .get_text(&self.endpoints.server_checksums())
            .await
            .context("fetch published sha256sums")?;
        let name = archive_name(version);
        let Some(sha256) = find_sha256(&listing, &name) else {
            return Err(error_payload::anyhow(
                "checksum_unavailable",
                format!("no published sha256 for {name}"),
                None,
                None,
            ));
        };

        tracing::info!(version, "downloading server");
        self.fetcher
            .download(&url, archive, &Checksum::Sha256(sha256), reporter)
            .await?;
        Ok(())
    }
}

/// `branch -> [version]` for every install dir under `root`.
pub fn installed_versions(root: &Path) -> anyhow::Result<BTreeMap<String, Vec<String>>> {
    let mut out = BTreeMap::new();
    let entries = fs::read_dir(root).with_context(|| format!("read {}", root.display()))?;
    for branch in entries.flatten() {
        if !branch.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let Ok(versions) = fs::read_dir(branch.path()) else {
            continue;
        };
        let mut found: Vec<String> = versions
            .flatten()
            .filter(|v| v.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|v| v.file_name().to_string_lossy().into_owned())
            .collect();
        found.sort();
        if !found.is_empty() {
            out.insert(branch.file_name().to_string_lossy().into_owned(), found);
        }
    }
    Ok(out)
}

/// Persists the selection and makes it active right away; the watcher's
/// reload of the same write is harmless.
pub fn select_version(store: &ConfigStore, branch: &str, version: &str) -> anyhow::Result<()> {
    validate_segment("branch", branch)?;
    validate_segment("version", version)?;
    let cfg = store.current();
    let dir = cfg.install_dir_for(branch, version);
    if !dir.is_dir() {
        return Err(error_payload::anyhow(
            "version_not_installed",
            format!("version directory does not exist: {}", dir.display()),
            None,
            None,
        ));
    }
    let next = cfg.with_selected_version(branch, version);
    next.save()?;
    store.replace(next);
    tracing::info!(branch, version, "selected server version");
    Ok(())
}

pub fn uninstall_version(cfg: &Config, branch: &str, version: &str) -> anyhow::Result<()> {
    validate_segment("branch", branch)?;
    validate_segment("version", version)?;
    let dir = cfg.install_dir_for(branch, version);
    if !dir.is_dir() {
        return Err(error_payload::anyhow(
            "version_not_installed",
            format!("version directory does not exist: {}", dir.display()),
            None,
            None,
        ));
    }
    fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
    tracing::info!(branch, version, dir = %dir.display(), "uninstalled server version");
    Ok(())
}
