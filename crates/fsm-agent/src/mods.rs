use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use fsm_core::ResourceKey;

use crate::{
    config::{Config, ConfigStore},
    error_payload,
    fetch::{self, Checksum, Endpoints, Fetcher, InFlight},
    progress::{ProgressRegistry, ProgressReporter},
    support::validate_segment,
};

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ModDetails {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub releases: Vec<ModRelease>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ModRelease {
    pub download_url: String,
    pub file_name: String,
    pub sha1: String,
    pub version: String,
    #[serde(default)]
    pub released_at: String,
    #[serde(default)]
    pub info_json: ReleaseInfo,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ReleaseInfo {
    #[serde(default)]
    pub factorio_version: String,
}

impl ModDetails {
    pub fn release(&self, version: &str) -> Option<&ModRelease> {
        self.releases.iter().find(|r| r.version == version)
    }
}

pub fn zip_name(name: &str, version: &str) -> String {
    format!("{name}_{version}.zip")
}

/// Splits `name_version.zip` on the last underscore.
pub fn parse_zip_name(file_name: &str) -> Option<(String, String)> {
    let stem = file_name.strip_suffix(".zip")?;
    let (name, version) = stem.rsplit_once('_')?;
    if name.is_empty() || version.is_empty() {
        return None;
    }
    Some((name.to_string(), version.to_string()))
}

pub fn cache_dir(cfg: &Config) -> PathBuf {
    cfg.downloads_dir().join("mods")
}

fn list_zips(dir: &Path) -> anyhow::Result<BTreeMap<String, Vec<String>>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(err) => return Err(err).with_context(|| format!("read {}", dir.display())),
    };
    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let file_name = entry.file_name();
        let Some((name, version)) = parse_zip_name(&file_name.to_string_lossy()) else {
            continue;
        };
        out.entry(name).or_default().push(version);
    }
    for versions in out.values_mut() {
        versions.sort();
    }
    Ok(out)
}

/// Downloaded zips waiting in the cache, `name -> [version]`.
pub fn available_mods(cfg: &Config) -> anyhow::Result<BTreeMap<String, Vec<String>>> {
    list_zips(&cache_dir(cfg))
}

pub fn installed_mods(cfg: &Config) -> anyhow::Result<BTreeMap<String, Vec<String>>> {
    list_zips(&cfg.factorio.mods_dir)
}

fn not_found(what: &str, path: &Path) -> anyhow::Error {
    error_payload::anyhow(
        "mod_not_found",
        format!("{what} does not exist: {}", path.display()),
        None,
        None,
    )
}

/// Copies a cached zip into the mods dir. Only one version of a mod may be
/// installed at a time.
pub fn install_mod(cfg: &Config, name: &str, version: &str) -> anyhow::Result<PathBuf> {
    validate_segment("mod", name)?;
    validate_segment("version", version)?;
    let src = cache_dir(cfg).join(zip_name(name, version));
    if !src.is_file() {
        return Err(not_found("mod", &src));
    }
    if let Some(existing) = installed_mods(cfg)?.get(name) {
        return Err(error_payload::anyhow(
            "mod_already_installed",
            format!("mod {name} is already installed ({})", existing.join(", ")),
            None,
            Some("uninstall the current version first".to_string()),
        ));
    }

    let dst = cfg.factorio.mods_dir.join(zip_name(name, version));
    fs::create_dir_all(&cfg.factorio.mods_dir)
        .with_context(|| format!("create {}", cfg.factorio.mods_dir.display()))?;
    fs::copy(&src, &dst)
        .with_context(|| format!("copy {} to {}", src.display(), dst.display()))?;
    tracing::info!(name, version, "installed mod");
    Ok(dst)
}

pub fn uninstall_mod(cfg: &Config, name: &str, version: &str) -> anyhow::Result<()> {
    validate_segment("mod", name)?;
    validate_segment("version", version)?;
    let path = cfg.factorio.mods_dir.join(zip_name(name, version));
    if !path.is_file() {
        return Err(not_found("mod", &path));
    }
    fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
    tracing::info!(name, version, "uninstalled mod");
    Ok(())
}

/// Removes a zip from the download cache.
pub fn delete_mod(cfg: &Config, name: &str, version: &str) -> anyhow::Result<()> {
    validate_segment("mod", name)?;
    validate_segment("version", version)?;
    let path = cache_dir(cfg).join(zip_name(name, version));
    if !path.is_file() {
        return Err(not_found("mod", &path));
    }
    fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
    tracing::info!(name, version, "deleted cached mod");
    Ok(())
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct ModList {
    #[serde(default)]
    mods: Vec<ModListEntry>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct ModListEntry {
    name: String,
    enabled: bool,
}

/// Flips a mod in `mod-list.json`, adding the entry when it is missing.
pub fn set_mod_enabled(mods_dir: &Path, name: &str, enabled: bool) -> anyhow::Result<()> {
    validate_segment("mod", name)?;
    let path = mods_dir.join("mod-list.json");
    let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let mut list: ModList =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;

    match list.mods.iter_mut().find(|m| m.name == name) {
        Some(entry) => entry.enabled = enabled,
        None => list.mods.push(ModListEntry {
            name: name.to_string(),
            enabled,
        }),
    }

    let out = serde_json::to_string_pretty(&list).context("encode mod list")?;
    fs::write(&path, out).with_context(|| format!("write {}", path.display()))?;
    tracing::info!(name, enabled, "updated mod list");
    Ok(())
}

/// Fetches mod zips from the portal into the download cache.
#[derive(Debug, Clone)]
pub struct ModDownloader {
    config: ConfigStore,
    fetcher: Fetcher,
    endpoints: Endpoints,
    progress: ProgressRegistry,
    in_flight: InFlight,
}

impl ModDownloader {
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

    pub async fn details(&self, name: &str) -> anyhow::Result<ModDetails> {
        validate_segment("mod", name)?;
        let details = self
            .fetcher
            .get_json::<ModDetails>(&self.endpoints.mod_details(name))
            .await
            .with_context(|| format!("fetch mod details for {name}"))?;
        Ok(details)
    }

    /// Progress goes out under `(name, version)`: Download, then Done. A zip
    /// already in the cache goes straight to Done without any request.
    pub async fn download(&self, name: &str, version: &str) -> anyhow::Result<PathBuf> {
        validate_segment("mod", name)?;
        validate_segment("version", version)?;

        let key = ResourceKey::new(name, version);
        let Some(_claim) = self.in_flight.claim(&key) else {
            return Err(error_payload::anyhow(
                "install_in_progress",
                format!("{key} is already being downloaded"),
                None,
                None,
            ));
        };

        let cfg = self.config.current();
        let mut reporter = ProgressReporter::new(self.progress.clone(), key);
        let dest = cache_dir(&cfg).join(zip_name(name, version));

        if dest.exists() {
            tracing::info!(path = %dest.display(), "using cached mod");
        } else {
            fetch::require_credentials(&cfg)?;
            let details = self.details(name).await?;
            let Some(release) = details.release(version) else {
                return Err(error_payload::anyhow(
                    "mod_version_not_found",
                    format!("version {version} not found for mod {name}"),
                    None,
                    None,
                ));
            };
            let url = fetch::authenticated(&self.endpoints.mod_download(&release.download_url), &cfg)?;
            tracing::info!(name, version, file = %release.file_name, "downloading mod");
            self.fetcher
                .download(&url, &dest, &Checksum::Sha1(release.sha1.clone()), &mut reporter)
                .await?;
        }

        reporter.done();
        tracing::info!(name, version, "mod ready");
        Ok(dest)
    }
}
