use std::{path::Path, time::Duration};

use anyhow::Context;
use notify::{
    EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{AccessKind, AccessMode, ModifyKind},
};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};

/// Keeps a file watch alive. Dropping it stops the watch and discards any
/// pending reload.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn is_write(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

/// Watches `path` and calls `on_change` once per quiet burst of writes.
///
/// Must be called from inside a tokio runtime. A setup error is meant to be
/// fatal for the caller.
pub fn watch<F>(path: &Path, on_change: F) -> anyhow::Result<ConfigWatcher>
where
    F: Fn() + Send + Sync + 'static,
{
    watch_with_debounce(path, crate::support::config_debounce(), on_change)
}

pub fn watch_with_debounce<F>(
    path: &Path,
    debounce: Duration,
    on_change: F,
) -> anyhow::Result<ConfigWatcher>
where
    F: Fn() + Send + Sync + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let _ = tx.send(res);
    })
    .context("create file watcher")?;
    watcher
        .watch(path, RecursiveMode::NonRecursive)
        .with_context(|| format!("watch {}", path.display()))?;

    tracing::info!(path = %path.display(), debounce_ms = debounce.as_millis() as u64, "watching config");

    let task = tokio::spawn(async move {
        let mut deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                res = rx.recv() => match res {
                    // Re-arm: a write inside the window pushes the reload out.
                    Some(Ok(event)) if is_write(&event.kind) => {
                        deadline = Some(Instant::now() + debounce);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => tracing::warn!(error = %err, "config watch error"),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    on_change();
                }
            }
        }
    });

    Ok(ConfigWatcher {
        _watcher: watcher,
        task,
    })
}
