//! Rules file loading and hot reload

use super::rules::{parse_rules, Rule, RuleError, RuleRegistry};
use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Read and validate a JSON rules file
pub fn load_rules_file(path: &Path) -> Result<Vec<Rule>, RuleError> {
    let contents = std::fs::read_to_string(path).map_err(|e| RuleError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_rules(&contents)
}

/// Replace the registry contents from `path`; on error the current rules stay active
pub fn reload_rules(path: &Path, registry: &RuleRegistry) -> Result<usize, RuleError> {
    let rules = load_rules_file(path)?;
    let count = rules.len();
    registry.replace_all(rules)?;
    Ok(count)
}

/// Watches a rules file and reloads the registry when it changes
pub struct RulesWatcher {
    path: PathBuf,
    registry: Arc<RuleRegistry>,
}

/// Handle to a running watcher; stops watching when dropped
pub struct RulesWatcherHandle {
    _watcher: RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl RulesWatcherHandle {
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

impl RulesWatcher {
    pub fn new(path: impl Into<PathBuf>, registry: Arc<RuleRegistry>) -> Self {
        Self {
            path: path.into(),
            registry,
        }
    }

    pub fn start(self, cancel: CancellationToken) -> Result<RulesWatcherHandle> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .context("Failed to create rules file watcher")?;

        // Editors often replace the file, so watch the directory
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", dir.display()))?;
        info!(path = %self.path.display(), "Watching rules file");

        let file_name = self.path.file_name().map(|n| n.to_os_string());
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => {
                        let Some(event) = event else {
                            debug!("Rules watcher channel closed");
                            break;
                        };
                        let relevant = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                            && event.paths.iter().any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                        if !relevant {
                            continue;
                        }
                        match reload_rules(&self.path, &self.registry) {
                            Ok(count) => info!(path = %self.path.display(), rules = count, "Rules reloaded"),
                            Err(e) => warn!(path = %self.path.display(), error = %e, "Rules reload rejected, keeping current rules"),
                        }
                    }
                }
            }
        });

        Ok(RulesWatcherHandle {
            _watcher: watcher,
            task,
        })
    }
}
