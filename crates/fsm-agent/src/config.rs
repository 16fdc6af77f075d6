use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use anyhow::Context;
use ini::Ini;

const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
const DEFAULT_RCON_BIND: &str = "127.0.0.1:27015";

/// Files the server refuses to start without; seeded from `<name>.example.json`.
pub const REQUIRED_CONFIG_FILES: [&str; 3] = ["map-gen-settings", "map-settings", "server-settings"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactorioConfig {
    pub auto_start: bool,
    pub bind: String,
    pub config_dir: PathBuf,
    pub downloads: PathBuf,
    pub logs_dir: PathBuf,
    pub mods_dir: PathBuf,
    pub saves_dir: PathBuf,
    pub save: String,
    pub branch: String,
    pub version: String,
    pub server_versions: PathBuf,
    pub token: String,
    pub username: String,
}

/// Paths derived from `config_dir`; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactorioFiles {
    pub admin_list: PathBuf,
    pub ban_list: PathBuf,
    pub server_id: PathBuf,
    pub server_settings: PathBuf,
    pub white_list: PathBuf,
}

impl FactorioFiles {
    fn derive(config_dir: &Path) -> Self {
        Self {
            admin_list: config_dir.join("server-adminlist.json"),
            ban_list: config_dir.join("server-banlist.json"),
            server_id: config_dir.join("server-id.json"),
            server_settings: config_dir.join("server-settings.json"),
            white_list: config_dir.join("server-whitelist.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RconConfig {
    /// True when the file carries an `[rcon]` section.
    pub enabled: bool,
    pub bind: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    pub listen: String,
}

/// Immutable view of the INI file. Reloads build a new value; nothing mutates
/// a published snapshot.
#[derive(Debug, Clone)]
pub struct Config {
    pub path: PathBuf,
    pub factorio: FactorioConfig,
    pub files: FactorioFiles,
    pub rcon: RconConfig,
    pub server: HttpConfig,
    pub admins: BTreeMap<String, String>,
    raw: Ini,
}

fn get_str(ini: &Ini, section: &str, key: &str) -> String {
    ini.get_from(Some(section), key)
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

fn get_path(ini: &Ini, section: &str, key: &str, default: &str) -> PathBuf {
    let v = get_str(ini, section, key);
    if v.is_empty() {
        PathBuf::from(default)
    } else {
        PathBuf::from(v)
    }
}

fn parse_bool(section: &str, key: &str, raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "false" | "0" | "no" | "off" => Ok(false),
        "true" | "1" | "yes" | "on" => Ok(true),
        other => anyhow::bail!("[{section}] {key}: expected a boolean, got {other:?}"),
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = Ini::load_from_file(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_ini(path.to_path_buf(), raw)
    }

    fn from_ini(path: PathBuf, raw: Ini) -> anyhow::Result<Self> {
        let config_dir = get_path(&raw, "factorio", "config", "./config");
        let factorio = FactorioConfig {
            auto_start: parse_bool(
                "factorio",
                "auto_start",
                &get_str(&raw, "factorio", "auto_start"),
            )?,
            bind: get_str(&raw, "factorio", "bind"),
            config_dir,
            downloads: PathBuf::from(get_str(&raw, "factorio", "downloads")),
            logs_dir: get_path(&raw, "factorio", "logs", "./logs"),
            mods_dir: get_path(&raw, "factorio", "mods", "./mods"),
            saves_dir: get_path(&raw, "factorio", "saves", "./saves"),
            save: get_str(&raw, "factorio", "save"),
            branch: get_str(&raw, "factorio", "branch"),
            version: get_str(&raw, "factorio", "version"),
            server_versions: get_path(&raw, "factorio", "server_versions", "./servers"),
            token: get_str(&raw, "factorio", "token"),
            username: get_str(&raw, "factorio", "username"),
        };

        let rcon = match raw.section(Some("rcon")) {
            Some(section) => RconConfig {
                enabled: true,
                bind: section
                    .get("bind")
                    .map(|v| v.trim())
                    .filter(|v| !v.is_empty())
                    .unwrap_or(DEFAULT_RCON_BIND)
                    .to_string(),
                password: section.get("password").unwrap_or_default().trim().to_string(),
            },
            None => RconConfig {
                enabled: false,
                bind: DEFAULT_RCON_BIND.to_string(),
                password: String::new(),
            },
        };

        let listen = get_str(&raw, "server", "listen");
        let server = HttpConfig {
            listen: if listen.is_empty() {
                DEFAULT_LISTEN.to_string()
            } else if listen.starts_with(':') {
                format!("0.0.0.0{listen}")
            } else {
                listen
            },
        };

        let admins = raw
            .section(Some("admins"))
            .map(|s| {
                s.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            path,
            files: FactorioFiles::derive(&factorio.config_dir),
            factorio,
            rcon,
            server,
            admins,
            raw,
        })
    }

    /// Writes the structured sections back over the loaded file, keeping any
    /// keys this type does not model.
    pub fn save(&self) -> anyhow::Result<()> {
        let mut ini = self.raw.clone();
        let f = &self.factorio;
        let pairs: [(&str, String); 13] = [
            ("auto_start", f.auto_start.to_string()),
            ("bind", f.bind.clone()),
            ("config", f.config_dir.display().to_string()),
            ("downloads", f.downloads.display().to_string()),
            ("logs", f.logs_dir.display().to_string()),
            ("mods", f.mods_dir.display().to_string()),
            ("saves", f.saves_dir.display().to_string()),
            ("save", f.save.clone()),
            ("branch", f.branch.clone()),
            ("version", f.version.clone()),
            ("server_versions", f.server_versions.display().to_string()),
            ("token", f.token.clone()),
            ("username", f.username.clone()),
        ];
        for (k, v) in pairs {
            ini.set_to(Some("factorio"), k.to_string(), v);
        }
        if self.rcon.enabled {
            ini.set_to(Some("rcon"), "bind".to_string(), self.rcon.bind.clone());
            ini.set_to(Some("rcon"), "password".to_string(), self.rcon.password.clone());
        }
        ini.set_to(Some("server"), "listen".to_string(), self.server.listen.clone());

        ini.delete(Some("admins"));
        for (user, hash) in &self.admins {
            ini.set_to(Some("admins"), user.clone(), hash.clone());
        }

        ini.write_to_file(&self.path)
            .with_context(|| format!("write config {}", self.path.display()))
    }

    pub fn with_selected_version(&self, branch: &str, version: &str) -> Self {
        let mut next = self.clone();
        next.factorio.branch = branch.to_string();
        next.factorio.version = version.to_string();
        next
    }

    pub fn can_download(&self) -> bool {
        !self.factorio.username.is_empty() && !self.factorio.token.is_empty()
    }

    pub fn has_selection(&self) -> bool {
        !self.factorio.branch.is_empty() && !self.factorio.version.is_empty()
    }

    pub fn install_dir_for(&self, branch: &str, version: &str) -> PathBuf {
        self.factorio.server_versions.join(branch).join(version)
    }

    /// Root of the selected install (`<server_versions>/<branch>/<version>`).
    pub fn install_dir(&self) -> PathBuf {
        self.install_dir_for(&self.factorio.branch, &self.factorio.version)
    }

    pub fn binary_path(&self) -> PathBuf {
        self.install_dir()
            .join("factorio")
            .join("bin")
            .join("x64")
            .join("factorio")
    }

    /// Where archives and mod zips are cached; falls back to the OS temp dir.
    pub fn downloads_dir(&self) -> PathBuf {
        if self.factorio.downloads.as_os_str().is_empty() {
            std::env::temp_dir()
        } else {
            self.factorio.downloads.clone()
        }
    }

    pub fn required_config_paths(&self) -> Vec<PathBuf> {
        REQUIRED_CONFIG_FILES
            .iter()
            .map(|name| self.factorio.config_dir.join(format!("{name}.json")))
            .collect()
    }

    pub fn is_configured(&self) -> bool {
        self.required_config_paths().iter().all(|p| p.exists())
    }
}

/// First existing path out of the CLI override and the well-known locations.
pub fn find_config_path(cli: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = cli {
        return Some(p.to_path_buf());
    }
    let mut candidates = vec![PathBuf::from("./fsm.ini")];
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(PathBuf::from(home).join(".config/fsm/fsm.ini"));
    }
    candidates.push(PathBuf::from("/etc/fsm/fsm.ini"));
    candidates.into_iter().find(|p| p.exists())
}

fn create_dir_if_missing(path: &Path) -> anyhow::Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))?;
    tracing::info!(path = %path.display(), "created directory");
    Ok(())
}

fn create_file_if_missing(path: &Path, content: &str) -> anyhow::Result<()> {
    if path.exists() {
        return Ok(());
    }
    fs::write(path, format!("{content}\n"))
        .with_context(|| format!("create {}", path.display()))?;
    tracing::info!(path = %path.display(), "created file");
    Ok(())
}

/// Creates the working directories and seeds the list files the server
/// expects to find.
pub fn prepare_layout(cfg: &Config) -> anyhow::Result<()> {
    let f = &cfg.factorio;
    for dir in [
        &f.config_dir,
        &cfg.downloads_dir(),
        &f.logs_dir,
        &f.mods_dir,
        &f.saves_dir,
        &f.server_versions,
    ] {
        create_dir_if_missing(dir)?;
    }

    create_file_if_missing(&f.mods_dir.join("mod-list.json"), "{}")?;
    create_file_if_missing(&cfg.files.admin_list, "[]")?;
    create_file_if_missing(&cfg.files.ban_list, "[]")?;
    create_file_if_missing(&cfg.files.white_list, "[]")?;
    Ok(())
}

/// Holds the active snapshot. Readers clone the `Arc`; reloads swap it whole.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    current: Arc<RwLock<Arc<Config>>>,
}

impl ConfigStore {
    pub fn new(config: Config) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn current(&self) -> Arc<Config> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn replace(&self, config: Config) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(config);
    }

    /// Re-reads the file behind the active snapshot. On failure the previous
    /// snapshot stays active.
    pub fn reload(&self) -> anyhow::Result<Arc<Config>> {
        let path = self.current().path.clone();
        let next = Arc::new(Config::load(&path)?);
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = next.clone();
        tracing::info!(path = %path.display(), "config reloaded");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
[factorio]
auto_start = true
bind = 0.0.0.0:34197
config = /srv/fsm/config
downloads = /srv/fsm/downloads
branch = stable
version = 1.1.110
server_versions = /srv/fsm/servers
username = engineer
token = abc123

[rcon]
password = hunter2

[server]
listen = :9090

[admins]
admin = $argon2id$hash
";

    fn write_sample(dir: &Path) -> PathBuf {
        let path = dir.join("fsm.ini");
        fs::write(&path, SAMPLE).unwrap();
        path
    }

    #[test]
    fn load_maps_sections_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&write_sample(dir.path())).unwrap();

        assert!(cfg.factorio.auto_start);
        assert_eq!(cfg.factorio.bind, "0.0.0.0:34197");
        assert_eq!(cfg.factorio.mods_dir, PathBuf::from("./mods"));
        assert_eq!(cfg.factorio.logs_dir, PathBuf::from("./logs"));
        assert_eq!(
            cfg.files.server_settings,
            PathBuf::from("/srv/fsm/config/server-settings.json")
        );
        assert!(cfg.rcon.enabled);
        assert_eq!(cfg.rcon.bind, DEFAULT_RCON_BIND);
        assert_eq!(cfg.rcon.password, "hunter2");
        assert_eq!(cfg.server.listen, "0.0.0.0:9090");
        assert_eq!(cfg.admins.get("admin").map(String::as_str), Some("$argon2id$hash"));
        assert!(cfg.can_download());
        assert_eq!(
            cfg.binary_path(),
            PathBuf::from("/srv/fsm/servers/stable/1.1.110/factorio/bin/x64/factorio")
        );
    }

    #[test]
    fn missing_rcon_section_disables_rcon() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fsm.ini");
        fs::write(&path, "[factorio]\nbranch = stable\n").unwrap();
        let cfg = Config::load(&path).unwrap();
        assert!(!cfg.rcon.enabled);
        assert!(!cfg.can_download());
        assert!(!cfg.has_selection());
        assert_eq!(cfg.server.listen, DEFAULT_LISTEN);
    }

    #[test]
    fn invalid_bool_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fsm.ini");
        fs::write(&path, "[factorio]\nauto_start = perhaps\n").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("auto_start"));
    }

    #[test]
    fn save_round_trips_selection_and_keeps_admins() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(dir.path());
        let cfg = Config::load(&path).unwrap();

        cfg.with_selected_version("experimental", "2.0.8").save().unwrap();

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.factorio.branch, "experimental");
        assert_eq!(reloaded.factorio.version, "2.0.8");
        assert_eq!(reloaded.admins, cfg.admins);
        assert_eq!(reloaded.rcon, cfg.rcon);
    }

    #[test]
    fn failed_reload_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(dir.path());
        let store = ConfigStore::new(Config::load(&path).unwrap());
        let before = store.current();

        fs::write(&path, "[factorio]\nauto_start = nonsense\n").unwrap();
        assert!(store.reload().is_err());
        assert!(Arc::ptr_eq(&before, &store.current()));

        fs::write(&path, "[factorio]\nbranch = experimental\nversion = 2.0.8\n").unwrap();
        let next = store.reload().unwrap();
        assert_eq!(next.factorio.branch, "experimental");
        assert_eq!(before.factorio.branch, "stable");
    }

    #[test]
    fn prepare_layout_creates_dirs_and_seed_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let path = root.join("fsm.ini");
        fs::write(
            &path,
            format!(
                "[factorio]\nconfig = {0}/config\ndownloads = {0}/dl\nlogs = {0}/logs\nmods = {0}/mods\nsaves = {0}/saves\nserver_versions = {0}/servers\n",
                root.display()
            ),
        )
        .unwrap();
        let cfg = Config::load(&path).unwrap();
        prepare_layout(&cfg).unwrap();

        assert!(root.join("servers").is_dir());
        assert!(root.join("dl").is_dir());
        assert_eq!(
            fs::read_to_string(root.join("mods/mod-list.json")).unwrap(),
            "{}\n"
        );
        assert_eq!(fs::read_to_string(&cfg.files.ban_list).unwrap(), "[]\n");

        // Existing content is never overwritten.
        fs::write(&cfg.files.admin_list, "[\"someone\"]").unwrap();
        prepare_layout(&cfg).unwrap();
        assert_eq!(
            fs::read_to_string(&cfg.files.admin_list).unwrap(),
            "[\"someone\"]"
        );
    }
}
