//! Loads the two-section scraper configuration and materializes the
//! effective configuration for the current leadership state.
//!
//! Mirrors `config/config.go` and `config/reconcile.go` in the original
//! `prometheus-elector`, minus the dependency on Prometheus's own config
//! schema: `follower`/`leader` are treated as opaque YAML mappings.

mod merge;

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::Deserialize;
use thiserror::Error;

use crate::election::LeaderStatus;

pub use merge::merge_yaml;


/// The on-disk document: `{ follower: {...}, leader: {...}? }`.
///
/// Unknown top-level keys are rejected, matching the strict
/// `yaml.UnmarshalStrict` parse in the original Go implementation.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigDocument {
    follower: serde_yaml::Mapping,
    leader: Option<serde_yaml::Mapping>,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to read configuration source {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse configuration source {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("configuration document is missing a required `follower` section")]
    MissingFollower,

    #[error("failed to serialize effective configuration: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error("failed to write effective configuration to {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Materializes `output_path` from `source_path`, merging in the `leader`
/// section when the attached [`LeaderStatus`] (if any) reports leadership.
///
/// Two-phase init (see `DESIGN.md`): a `Reconciler` can be constructed
/// before the election supervisor exists; [`Reconciler::attach_status`] is
/// called once the supervisor is available. Before attachment the
/// reconciler behaves as if it were never leader. The handle is stored in
/// a `OnceLock` rather than behind `&mut self` so the same `Arc<Reconciler>`
/// can already be shared with the supervisor's callbacks and the file
/// watcher by the time the status becomes known.
pub struct Reconciler {
    source_path: PathBuf,
    output_path: PathBuf,
    status: OnceLock<LeaderStatus>,
}

impl Reconciler {
    pub fn new(source_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            output_path: output_path.into(),
            status: OnceLock::new(),
        }
    }

    /// Attaches the supervisor's status handle. Only the first call has
    /// any effect; later calls are silently ignored.
    pub fn attach_status(&self, status: LeaderStatus) {
        let _ = self.status.set(status);
    }

    fn is_leader(&self) -> bool {
        self.status.get().map(LeaderStatus::is_leader).unwrap_or(false)
    }

    #[tracing::instrument(skip(self))]
    pub fn reconcile(&self) -> Result<(), ReconcileError> {
        let doc = self.load()?;

        let effective = match doc.leader {
            Some(leader) if self.is_leader() => merge_yaml(&doc.follower, &leader),
            _ => doc.follower,
        };

        self.write(&effective)
    }

    fn load(&self) -> Result<ConfigDocument, ReconcileError> {
        let bytes = fs::read(&self.source_path).map_err(|source| ReconcileError::Read {
            path: self.source_path.clone(),
            source,
        })?;

        let doc: RawDocument =
            serde_yaml::from_slice(&bytes).map_err(|source| ReconcileError::Parse {
                path: self.source_path.clone(),
                source,
            })?;

        doc.follower
            .map(|follower| ConfigDocument {
                follower,
                leader: doc.leader,
            })
            .ok_or(ReconcileError::MissingFollower)
    }

    fn write(&self, effective: &serde_yaml::Mapping) -> Result<(), ReconcileError> {
        let serialized = serde_yaml::to_string(effective)?;
        write_atomically(&self.output_path, serialized.as_bytes()).map_err(|source| {
            ReconcileError::Write {
                path: self.output_path.clone(),
                source,
            }
        })
    }
}

/// Same shape as [`ConfigDocument`] but with `follower` optional, so a
/// missing section can be turned into [`ReconcileError::MissingFollower`]
/// rather than a generic parse error.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDocument {
    follower: Option<serde_yaml::Mapping>,
    leader: Option<serde_yaml::Mapping>,
}

/// Writes `contents` to `path` by first writing a sibling temp file with
/// mode `0600` and then renaming it into place, so neither the scraper nor
/// the file watcher ever observes a partial write.
fn write_atomically(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("effective-config")
    ));

    fs::write(&tmp_path, contents)?;
    fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
