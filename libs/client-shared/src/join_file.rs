//! Filesystem watch on the egress join file.
//!
//! The producer replaces the file atomically (create / write / move-into),
//! so we watch the parent directory and re-parse on any event that lands on
//! our file name. Parsed join sets are handed to the client loop through a
//! channel; parsing happens on the notify thread.

use anyhow::{Context as _, Result};
use mnat_model::{Sg, sg_file};
use notify::{Event, EventKind, RecursiveMode, Watcher as _};
use std::path::Path;
use tokio::sync::mpsc;

pub struct JoinFileWatcher {
    // Watching stops when this is dropped.
    _watcher: notify::RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<Vec<Sg>>,
}

impl JoinFileWatcher {
    pub fn watch(path: &Path) -> Result<Self> {
        let dir = match path.parent() {
            Some(parent) if parent != Path::new("") => parent.to_owned(),
            Some(_) | None => Path::new(".").to_owned(),
        };
        let file_name = path
            .file_name()
            .with_context(|| format!("`{}` has no file name", path.display()))?
            .to_owned();

        let (tx, rx) = mpsc::unbounded_channel();

        let watched = path.to_owned();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!("Join-file watch error: {e}");
                    return;
                }
            };

            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                return;
            }

            if !event
                .paths
                .iter()
                .any(|p| p.file_name() == Some(file_name.as_os_str()))
            {
                return;
            }

            if let Some(sgs) = read_join_file(&watched) {
                let _ = tx.send(sgs);
            }
        })
        .context("Failed to create filesystem watcher")?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch `{}`", dir.display()))?;

        tracing::info!(path = %path.display(), "Watching join file");

        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    pub async fn changed(&mut self) -> Option<Vec<Sg>> {
        self.rx.recv().await
    }
}

/// Reads and parses the join file, logging (not failing) on a missing or
/// half-replaced file.
pub fn read_join_file(path: &Path) -> Option<Vec<Sg>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Some(sg_file::parse(&contents)),
        Err(e) => {
            tracing::warn!(path = %path.display(), "Failed to read join file: {e}");
            None
        }
    }
}
