//! Watches the mounted configuration directory for atomic symlink swaps
//! (the Kubernetes `ConfigMap`/`Secret` volume `..data` rename idiom) and
//! drives reconcile + notify on every genuine content change. Grounded in
//! `watcher/watcher.go`, rebuilt on the `notify` crate instead of
//! `fsnotify` since no example repo bundles its own filesystem watcher.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{EventKind, RecursiveMode, Watcher as _};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Reconciler;
use crate::notifier::Notify;

#[cfg(test)]
mod tests;

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("unable to create filesystem watcher: {0}")]
    Create(#[source] notify::Error),
    #[error("unable to watch directory {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
    #[error("unable to read watched file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Watches `dir` for changes to `file_name`, reconciling and notifying on
/// every content change that survives the checksum gate.
pub struct Watcher {
    dir: PathBuf,
    file_name: String,
    reconciler: Arc<Reconciler>,
    notifier: Arc<dyn Notify>,
    last_digest: Vec<u8>,
    events: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    // Kept alive for the lifetime of the watch: dropping it tears down the
    // OS-level subscription and the `events` channel would start yielding
    // `None`.
    _backend: notify::RecommendedWatcher,
}

impl Watcher {
    pub fn new(
        dir: impl Into<PathBuf>,
        file_name: impl Into<String>,
        reconciler: Arc<Reconciler>,
        notifier: Arc<dyn Notify>,
    ) -> Result<Self, WatcherError> {
        let dir = dir.into();
        let file_name = file_name.into();

        let (tx, rx) = mpsc::unbounded_channel();
        let mut backend = notify::recommended_watcher(move |res| {
            // The callback runs on notify's own backend thread; a closed
            // receiver (watcher dropped) just means the send is dropped.
            let _ = tx.send(res);
        })
        .map_err(WatcherError::Create)?;

        backend
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|source| WatcherError::Watch {
                path: dir.clone(),
                source,
            })?;

        tracing::info!(path = %dir.display(), "watching config directory");

        let last_digest = digest_file(&dir.join(&file_name)).unwrap_or_default();

        Ok(Self {
            dir,
            file_name,
            reconciler,
            notifier,
            last_digest,
            events: rx,
            _backend: backend,
        })
    }

    /// Consumes filesystem events until `cancel` fires or the backend
    /// channel closes. A single malfunctioning tick never ends the loop:
    /// reconcile/notify errors are logged and the watch continues.
    #[tracing::instrument(skip(self, cancel), fields(path = %self.dir.join(&self.file_name).display()))]
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), WatcherError> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = self.events.recv() => {
                    let Some(event) = event else { return Ok(()) };
                    match event {
                        Ok(event) => self.handle_event(event, &cancel).await,
                        Err(err) => tracing::error!(error = %err, "watcher backend reported an error"),
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: notify::Event, cancel: &CancellationToken) {
        if !self.touches_watched_file(&event) {
            return;
        }

        // The `..data` swap is a rename within the watched directory
        // (`..data_tmp` -> `..data`); on the `notify` crate's inotify
        // backend that surfaces as a `Modify(Name(_))` event on the
        // destination path, not a `Create` — unlike the Go `fsnotify`
        // library the original watcher was written against, which folds a
        // same-directory rename's destination into a `Create` op. `Chmod`
        // permission fix-ups after a completed swap still land as
        // `Modify(Metadata(_))`.
        if !matches!(
            event.kind,
            EventKind::Create(_)
                | EventKind::Modify(notify::event::ModifyKind::Metadata(_))
                | EventKind::Modify(notify::event::ModifyKind::Name(_))
        ) {
            return;
        }

        let path = self.dir.join(&self.file_name);
        let digest = match digest_file(&path) {
            Ok(digest) => digest,
            Err(err) => {
                tracing::error!(error = %err, path = %path.display(), "unable to hash watched file");
                return;
            }
        };

        if digest == self.last_digest {
            return;
        }

        // Recorded before reconcile/notify run: a persistently failing
        // notify must not keep retrying forever on the same content.
        self.last_digest = digest;

        tracing::info!("configuration changed, reconciling");

        if let Err(err) = self.reconciler.reconcile() {
            tracing::error!(error = %err, "reconciler reported an error");
            return;
        }

        if let Err(err) = self.notifier.notify(cancel).await {
            tracing::error!(error = %err, "unable to notify prometheus");
        }
    }

    /// Matches either the watched file's own name or the `..data` marker
    /// a Kubernetes `ConfigMap`/`Secret` projected volume re-points on every
    /// atomic swap (`watcher/watcher.go:53`): the swap itself only ever
    /// fires inotify events on `..data`, never on the watched file's name.
    fn touches_watched_file(&self, event: &notify::Event) -> bool {
        event.paths.iter().any(|p| {
            matches!(
                p.file_name().and_then(|n| n.to_str()),
                Some(name) if name == self.file_name || name == DATA_DIR_MARKER
            )
        })
    }
}

/// Base name of the hidden directory a Kubernetes projected volume
/// re-points via symlink rename on every atomic config update.
const DATA_DIR_MARKER: &str = "..data";

fn digest_file(path: &Path) -> Result<Vec<u8>, WatcherError> {
    let bytes = std::fs::read(path).map_err(|source| WatcherError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Sha256::digest(&bytes).to_vec())
}
