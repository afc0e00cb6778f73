use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use notify::event::{ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::config::WatchConfig;

/// Give up waiting for a stable size after this many polls
const MAX_STABILITY_POLLS: u32 = 60;

/// How long a freshly created file is left alone before processing
#[derive(Debug, Clone)]
pub struct SettlePolicy {
    pub delay: Duration,
    pub poll: Duration,
    /// Consecutive unchanged size readings required
    pub stable_checks: u32,
}

impl From<&WatchConfig> for SettlePolicy {
    fn from(config: &WatchConfig) -> Self {
        Self {
            delay: config.settle_delay(),
            poll: config.stability_poll(),
            stable_checks: config.stability_checks,
        }
    }
}

/// Case-insensitive match against extensions such as ".xlsx"
pub fn has_recognized_extension(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    extensions
        .iter()
        .any(|wanted| wanted.trim_start_matches('.').eq_ignore_ascii_case(ext))
}

/// Files already waiting in the watch directory (non-recursive), sorted by name
pub fn scan_backlog(dir: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .flatten()
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| has_recognized_extension(path, extensions))
        .collect();
    files.sort();
    files
}

/// Wait out the settle delay, then until the file size stops changing.
///
/// Returns false if the file disappeared in the meantime.
pub async fn wait_until_settled(path: &Path, policy: &SettlePolicy) -> bool {
    tokio::time::sleep(policy.delay).await;

    let mut last_size = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(_) => return false,
    };
    let mut stable = 0;

    for _ in 0..MAX_STABILITY_POLLS {
        if stable >= policy.stable_checks {
            return true;
        }
        tokio::time::sleep(policy.poll).await;
        let size = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(_) => return false,
        };
        if size == last_size {
            stable += 1;
        } else {
            stable = 0;
            last_size = size;
        }
    }

    tracing::warn!(path = %path.display(), "File size still changing, submitting anyway");
    true
}

/// Hand `path` to the processing side. Returns false once it is time to stop:
/// shutdown was requested while waiting for queue space, or the receiver is gone.
async fn submit(task_tx: &mpsc::Sender<PathBuf>, path: PathBuf, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = task_tx.send(path) => {
            if sent.is_err() {
                tracing::warn!("Processing channel closed");
            }
            sent.is_ok()
        }
    }
}

/// Paths that newly appeared in the directory
fn appeared_paths(event: Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths,
        _ => Vec::new(),
    }
}

/// Submit the backlog, then every newly created file, until cancelled.
///
/// The subscription is registered before the backlog scan so files created
/// during startup are seen by at least one of the two.
pub async fn start_watcher(
    watch_dir: PathBuf,
    extensions: Vec<String>,
    policy: SettlePolicy,
    task_tx: mpsc::Sender<PathBuf>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<PathBuf>();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for path in appeared_paths(event) {
                    // Receiver gone means the watch loop is shutting down
                    let _ = event_tx.send(path);
                }
            }
            Err(err) => tracing::error!(error = %err, "File watcher error"),
        },
        NotifyConfig::default(),
    )
    .context("failed to create file watcher")?;

    watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", watch_dir.display()))?;

    tracing::info!(dir = %watch_dir.display(), "File watcher started");

    let backlog = scan_backlog(&watch_dir, &extensions);
    tracing::info!(files = backlog.len(), "Submitting backlog");
    for path in backlog {
        tracing::info!(path = %path.display(), "Existing file found");
        if !submit(&task_tx, path, &cancel).await {
            tracing::info!(dir = %watch_dir.display(), "File watcher stopped during backlog");
            return Ok(());
        }
    }

    let mut settling: HashSet<PathBuf> = HashSet::new();
    let mut settle_tasks: JoinSet<(PathBuf, bool)> = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(path) = event_rx.recv() => {
                if path.is_dir() || !has_recognized_extension(&path, &extensions) {
                    continue;
                }
                if !settling.insert(path.clone()) {
                    tracing::debug!(path = %path.display(), "Duplicate creation event while settling");
                    continue;
                }
                tracing::debug!(path = %path.display(), "File created, waiting for it to settle");
                let policy = policy.clone();
                settle_tasks.spawn(async move {
                    let ready = wait_until_settled(&path, &policy).await;
                    (path, ready)
                });
            }
            Some(joined) = settle_tasks.join_next() => {
                let (path, ready) = match joined {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::error!(error = %e, "Settle task failed");
                        continue;
                    }
                };
                settling.remove(&path);
                if !ready {
                    tracing::debug!(path = %path.display(), "File vanished while settling");
                    continue;
                }
                tracing::info!(path = %path.display(), "New file detected");
                if !submit(&task_tx, path, &cancel).await {
                    break;
                }
            }
        }
    }

    settle_tasks.abort_all();
    drop(watcher);
    tracing::info!(dir = %watch_dir.display(), "File watcher stopped");
    Ok(())
}
