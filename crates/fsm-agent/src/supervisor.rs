use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use chrono::NaiveDateTime;
use fsm_core::{ServerStatus, ServerVersion};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::Mutex,
};

use crate::config::{Config, ConfigStore, REQUIRED_CONFIG_FILES};
use crate::log_broadcast::{LogBroadcaster, LogSubscription};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("server binary not found: {}", .0.display())]
    BinaryNotFound(PathBuf),
    #[error("unable to start server until configured (missing {})", display_paths(.missing))]
    NotConfigured { missing: Vec<PathBuf> },
    #[error("spawn server process {}", .binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to signal server process (pid {pid})")]
    SignalFailed {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

impl SupervisorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::BinaryNotFound(_) => "binary_not_found",
            Self::NotConfigured { .. } => "not_configured",
            Self::Spawn { .. } => "spawn_failed",
            Self::SignalFailed { .. } => "signal_failed",
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    Running,
}

#[derive(Debug)]
struct ProcessHandle {
    pid: u32,
    generation: u64,
    stop_requested: bool,
}

#[derive(Debug)]
struct ProcessState {
    phase: Phase,
    // Released only by the exit-waiter of the same generation.
    handle: Option<ProcessHandle>,
    cached_version: ServerVersion,
    generation: u64,
}

/// Owns the one managed server process of this service instance.
///
/// Start/stop and the exit-waiter serialize on one lock; the version probe
/// runs outside of it so status polling never waits on a spawn.
#[derive(Debug, Clone)]
pub struct Supervisor {
    config: ConfigStore,
    logs: LogBroadcaster,
    state: Arc<Mutex<ProcessState>>,
    probe_lock: Arc<Mutex<()>>,
}

impl Supervisor {
    pub fn new(config: ConfigStore, logs: LogBroadcaster) -> Self {
        Self {
            config,
            logs,
            state: Arc::new(Mutex::new(ProcessState {
                phase: Phase::Stopped,
                handle: None,
                cached_version: ServerVersion::default(),
                generation: 0,
            })),
            probe_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn subscribe_logs(&self) -> LogSubscription {
        self.logs.subscribe()
    }

    pub fn logs(&self) -> &LogBroadcaster {
        &self.logs
    }

    pub async fn phase(&self) -> Phase {
        self.state.lock().await.phase
    }

    pub async fn is_running(&self) -> bool {
        self.phase().await == Phase::Running
    }

    pub async fn start(&self) -> Result<(), SupervisorError> {
        if self.is_running().await {
            return Ok(());
        }

        let cfg = self.config.current();
        let binary = cfg.binary_path();
        if !binary.is_file() {
            return Err(SupervisorError::BinaryNotFound(binary));
        }

        if !cfg.is_configured() {
            initialise_configuration(&cfg, false);
            let missing: Vec<PathBuf> = cfg
                .required_config_paths()
                .into_iter()
                .filter(|p| !p.exists())
                .collect();
            if !missing.is_empty() {
                return Err(SupervisorError::NotConfigured { missing });
            }
        }

        // A new start may run a different binary than the cached one.
        let version = self.probe(&cfg).await;

        let mut state = self.state.lock().await;
        if state.phase == Phase::Running {
            return Ok(());
        }
        state.cached_version = version;

        let args = build_args(&cfg, chrono::Local::now().naive_local());
        let mut cmd = Command::new(&binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| set_parent_death_signal());
            }
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            binary: binary.clone(),
            source,
        })?;
        let Some(pid) = child.id() else {
            return Err(SupervisorError::Spawn {
                binary,
                source: std::io::Error::other("server exited before its pid was read"),
            });
        };

        if let Some(out) = child.stdout.take() {
            spawn_line_reader(out, self.logs.clone());
        }
        if let Some(err) = child.stderr.take() {
            spawn_line_reader(err, self.logs.clone());
        }

        state.generation = state.generation.saturating_add(1);
        let generation = state.generation;
        state.phase = Phase::Running;
        state.handle = Some(ProcessHandle {
            pid,
            generation,
            stop_requested: false,
        });
        tracing::info!(
            pid,
            binary = %binary.display(),
            version = %state.cached_version.full,
            "server started"
        );

        let shared = self.state.clone();
        tokio::spawn(async move {
            let res = child.wait().await;
            let mut state = shared.lock().await;
            if state
                .handle
                .as_ref()
                .is_some_and(|h| h.generation == generation)
            {
                state.handle = None;
                state.phase = Phase::Stopped;
            }
            match res {
                Ok(status) => tracing::info!(pid, code = ?status.code(), "server exited"),
                Err(err) => tracing::warn!(pid, error = %err, "server wait failed"),
            }
        });

        Ok(())
    }

    /// Requests a graceful shutdown. Does not wait; the exit-waiter flips
    /// the phase once the process is gone. Every call while running sends
    /// another SIGTERM.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().await;
        if state.phase != Phase::Running {
            tracing::info!("server not running");
            return Ok(());
        }
        let Some(handle) = state.handle.as_mut() else {
            return Ok(());
        };

        send_sigterm(handle.pid).map_err(|source| SupervisorError::SignalFailed {
            pid: handle.pid,
            source,
        })?;
        tracing::info!(pid = handle.pid, repeated = handle.stop_requested, "server stop requested");
        handle.stop_requested = true;
        Ok(())
    }

    pub async fn status(&self) -> ServerStatus {
        let cfg = self.config.current();
        let (running, version) = self.version_for(&cfg).await;
        ServerStatus {
            can_download: cfg.can_download(),
            is_configured: cfg.is_configured(),
            running,
            version,
        }
    }

    /// Cached while running, probed from the binary otherwise. Any probe
    /// failure yields an empty (unknown) version.
    pub async fn version(&self) -> ServerVersion {
        let cfg = self.config.current();
        self.version_for(&cfg).await.1
    }

    async fn version_for(&self, cfg: &Config) -> (bool, ServerVersion) {
        let (running, cached) = {
            let state = self.state.lock().await;
            (state.phase == Phase::Running, state.cached_version.clone())
        };
        if running {
            (true, cached)
        } else {
            (false, self.probe(cfg).await)
        }
    }

    async fn probe(&self, cfg: &Config) -> ServerVersion {
        let _guard = self.probe_lock.lock().await;
        probe_version(cfg).await
    }

    /// Copies `<name>.example.json` templates from the selected install into
    /// the config dir.
    pub fn initialise_configuration(&self, overwrite: bool) -> usize {
        initialise_configuration(&self.config.current(), overwrite)
    }
}

fn spawn_line_reader<R>(stream: R, logs: LogBroadcaster)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            logs.publish(line);
        }
    });
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> std::io::Result<()> {
    // 0 and negative values address process groups, never a single server.
    let pid = i32::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        // Already reaped; the exit-waiter is about to flip the phase.
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "graceful termination requires a unix host",
    ))
}

#[cfg(target_os = "linux")]
fn set_parent_death_signal() -> std::io::Result<()> {
    // Take the server down with us if the manager dies.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

pub(crate) fn initialise_configuration(cfg: &Config, overwrite: bool) -> usize {
    let data_dir = cfg.install_dir().join("factorio").join("data");
    let mut copied = 0;
    for name in REQUIRED_CONFIG_FILES {
        let src = data_dir.join(format!("{name}.example.json"));
        let dst = cfg.factorio.config_dir.join(format!("{name}.json"));
        if !src.exists() {
            tracing::warn!(src = %src.display(), "config template not found, skipping");
            continue;
        }
        if !overwrite && dst.exists() {
            continue;
        }
        if let Err(err) = std::fs::create_dir_all(&cfg.factorio.config_dir) {
            tracing::warn!(dir = %cfg.factorio.config_dir.display(), error = %err, "create config dir failed");
            continue;
        }
        match std::fs::copy(&src, &dst) {
            Ok(_) => {
                copied += 1;
                tracing::info!(src = %src.display(), dst = %dst.display(), "seeded config file");
            }
            Err(err) => {
                tracing::warn!(src = %src.display(), dst = %dst.display(), error = %err, "copy config template failed")
            }
        }
    }
    copied
}

fn path_arg(p: &Path) -> String {
    p.display().to_string()
}

/// Launch arguments for the selected install; deterministic for a given
/// snapshot and timestamp.
pub fn build_args(cfg: &Config, now: NaiveDateTime) -> Vec<String> {
    let f = &cfg.factorio;
    let mut args = vec![
        "--server-settings".to_string(),
        path_arg(&cfg.files.server_settings),
        "--server-adminlist".to_string(),
        path_arg(&cfg.files.admin_list),
        "--server-banlist".to_string(),
        path_arg(&cfg.files.ban_list),
        "--server-whitelist".to_string(),
        path_arg(&cfg.files.white_list),
        "--use-server-whitelist".to_string(),
        "--mod-directory".to_string(),
        path_arg(&f.mods_dir),
        "--server-id".to_string(),
        path_arg(&cfg.files.server_id),
    ];

    if !f.bind.is_empty() {
        args.push("--bind".to_string());
        args.push(f.bind.clone());
    }

    if !f.logs_dir.as_os_str().is_empty() {
        let name = format!("{}.log", now.format("%Y%m%d%H%M"));
        args.push("--console-log".to_string());
        args.push(path_arg(&f.logs_dir.join(name)));
    }

    if f.save.is_empty() {
        args.push("--start-server-load-latest".to_string());
    } else {
        args.push("--start-server".to_string());
        args.push(path_arg(&f.saves_dir.join(&f.save)));
    }

    if cfg.rcon.enabled {
        if !cfg.rcon.bind.is_empty() {
            args.push("--rcon-bind".to_string());
            args.push(cfg.rcon.bind.clone());
        }
        if !cfg.rcon.password.is_empty() {
            args.push("--rcon-password".to_string());
            args.push(cfg.rcon.password.clone());
        }
    }

    args
}

/// Full version string from `factorio --version` output.
pub fn parse_version_output(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find_map(|line| line.strip_prefix("Version: "))
        .map(|v| v.trim().to_string())
}

async fn probe_version(cfg: &Config) -> ServerVersion {
    if !cfg.has_selection() {
        return ServerVersion::default();
    }
    let binary = cfg.binary_path();
    if !binary.is_file() {
        return ServerVersion::default();
    }

    let output = match Command::new(&binary)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .await
    {
        Ok(o) => o,
        Err(err) => {
            tracing::warn!(binary = %binary.display(), error = %err, "version probe failed");
            return ServerVersion::default();
        }
    };

    match parse_version_output(&String::from_utf8_lossy(&output.stdout)) {
        Some(full) => ServerVersion {
            full,
            branch: cfg.factorio.branch.clone(),
            version: cfg.factorio.version.clone(),
        },
        None => {
            tracing::debug!(binary = %binary.display(), "version probe: no version line");
            ServerVersion::default()
        }
    }
}
