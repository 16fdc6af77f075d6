use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

mod config;
mod config_watch;
mod error_payload;
mod fanout;
mod fetch;
mod http;
mod log_broadcast;
mod mods;
mod progress;
mod server_versions;
mod supervisor;
mod support;

use config::{Config, ConfigStore};
use fetch::{Endpoints, Fetcher};
use log_broadcast::LogBroadcaster;
use mods::ModDownloader;
use progress::ProgressRegistry;
use server_versions::ServerInstaller;
use supervisor::Supervisor;
use support::format_error_chain;

#[derive(Debug, Parser)]
#[command(name = "fsm-agent", version, about = "Factorio dedicated server manager")]
struct Cli {
    /// Path to fsm.ini; defaults to ./fsm.ini, ~/.config/fsm/fsm.ini, /etc/fsm/fsm.ini
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// `RUST_LOG` when set, otherwise INFO so server output reaches the console.
fn env_filter(directives: Option<&str>) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .parse_lossy(directives.unwrap_or_default())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

async fn stop_server(supervisor: &Supervisor) {
    if let Err(err) = supervisor.stop().await {
        tracing::warn!(error = %err, "stop on shutdown failed");
        return;
    }
    for _ in 0..100 {
        if !supervisor.is_running().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tracing::warn!("server still running after shutdown grace period");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(std::env::var("RUST_LOG").ok().as_deref()))
        .init();

    let cli = Cli::parse();
    let path = config::find_config_path(cli.config.as_deref())
        .context("no fsm.ini found; pass --config or create ./fsm.ini")?;
    let cfg = Config::load(&path)?;
    config::prepare_layout(&cfg)?;

    let listen: SocketAddr = cfg
        .server
        .listen
        .parse()
        .with_context(|| format!("invalid [server] listen address {:?}", cfg.server.listen))?;
    let auto_start = cfg.factorio.auto_start;
    tracing::info!(config = %path.display(), "loaded config");

    let store = ConfigStore::new(cfg);
    let progress = ProgressRegistry::new();
    let supervisor = Supervisor::new(store.clone(), LogBroadcaster::new());
    let fetcher = Fetcher::new()?;
    let endpoints = Endpoints::from_env();

    let _watcher = {
        let store = store.clone();
        config_watch::watch(&path, move || {
            if let Err(err) = store.reload() {
                tracing::warn!(error = %format_error_chain(&err), "config reload failed; keeping previous");
            }
        })?
    };

    if auto_start {
        if let Err(err) = supervisor.start().await {
            tracing::warn!(error = %err, "auto start failed");
        }
    }

    let state = http::AppState {
        config: store.clone(),
        supervisor: supervisor.clone(),
        progress: progress.clone(),
        servers: ServerInstaller::new(
            store.clone(),
            fetcher.clone(),
            endpoints.clone(),
            progress.clone(),
        ),
        mods: ModDownloader::new(store, fetcher, endpoints, progress),
    };

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("bind {listen}"))?;
    tracing::info!(%listen, "fsm-agent HTTP listening");

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    stop_server(&supervisor).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_filter_defaults_to_info() {
        assert_eq!(env_filter(None).max_level_hint(), Some(LevelFilter::INFO));
        assert_eq!(env_filter(Some("")).max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn log_filter_honours_directives() {
        assert_eq!(
            env_filter(Some("fsm_agent=debug")).max_level_hint(),
            Some(LevelFilter::DEBUG)
        );
    }
}
