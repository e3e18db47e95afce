use std::fmt::Write as _;
use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use derive_more::{Display, Error};

use crate::sites::SiteName;
use crate::util::artifact::{ArtifactKind, BackupLayout};

const DEFAULT_MAX_FILE_BACKUPS: NonZeroUsize = match NonZeroUsize::new(5) {
    Some(n) => n,
    None => unreachable!(),
};
const DEFAULT_MAX_DB_BACKUPS: NonZeroUsize = match NonZeroUsize::new(20) {
    Some(n) => n,
    None => unreachable!(),
};

/// Configure how many artifacts of every kind are kept per site.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct RetentionPolicy {
    /// Defines how many file archives to keep.
    #[serde(default = "default_max_file_backups")]
    pub max_file_backups: NonZeroUsize,

    /// Defines how many database dumps to keep.
    ///
    /// Dumps are a lot smaller than file archives, so more of them are kept by default.
    #[serde(default = "default_max_db_backups")]
    pub max_db_backups: NonZeroUsize,
}

fn default_max_file_backups() -> NonZeroUsize {
    DEFAULT_MAX_FILE_BACKUPS
}

fn default_max_db_backups() -> NonZeroUsize {
    DEFAULT_MAX_DB_BACKUPS
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_file_backups: DEFAULT_MAX_FILE_BACKUPS,
            max_db_backups: DEFAULT_MAX_DB_BACKUPS,
        }
    }
}

impl RetentionPolicy {
    /// Maximum number of artifacts of `kind` to keep.
    pub fn max_kept(&self, kind: ArtifactKind) -> usize {
        match kind {
            ArtifactKind::Files => self.max_file_backups.get(),
            ArtifactKind::Database => self.max_db_backups.get(),
        }
    }
}

/// Errors on rotation of old artifacts.
#[derive(Debug, Display, Error)]
pub enum RetentionError {
    /// The artifacts of a site couldn't be listed.
    #[display("Listing backups in {} failed: {source}", dir.display())]
    List { dir: PathBuf, source: io::Error },

    /// Some of the surplus artifacts couldn't be removed.
    ///
    /// Every removal is attempted, even if an earlier one failed.
    #[display("Removing {} of {attempted} old backup(s) failed:{}", failures.len(), render_failures(failures))]
    Remove {
        failures: Vec<(PathBuf, io::Error)>,
        attempted: usize,
    },
}

fn render_failures(failures: &[(PathBuf, io::Error)]) -> String {
    failures.iter().fold(String::new(), |mut out, (path, e)| {
        let _ = write!(out, " {}: {e};", path.display());
        out
    })
}

/// Result of a successful rotation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rotation {
    /// Number of artifacts left behind.
    pub kept: usize,
    /// Removed artifacts, oldest last.
    pub removed: Vec<PathBuf>,
}

/// Enforces a [RetentionPolicy] on the artifacts below a [BackupLayout].
#[derive(Clone, Debug)]
pub struct RetentionManager {
    layout: BackupLayout,
    policy: RetentionPolicy,
}

impl RetentionManager {
    pub fn new(layout: BackupLayout, policy: RetentionPolicy) -> Self {
        Self { layout, policy }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Deletes every artifact of `kind` of the `site` except the newest ones.
    ///
    /// Artifacts are ordered by modification time, ties are broken by name.
    pub fn rotate(&self, site: &SiteName, kind: ArtifactKind) -> Result<Rotation, RetentionError> {
        self.rotate_with(site, kind, |path| fs::remove_file(path))
    }

    fn rotate_with(
        &self,
        site: &SiteName,
        kind: ArtifactKind,
        mut remove: impl FnMut(&Path) -> io::Result<()>,
    ) -> Result<Rotation, RetentionError> {
        let dir = self.layout.artifact_dir(site, kind);
        let max_kept = self.policy.max_kept(kind);

        let mut artifacts = list_by_age(&dir, kind)
            .map_err(|source| RetentionError::List { dir: dir.clone(), source })?;
        if artifacts.len() <= max_kept {
            log::trace!(target: "backup::retention", "{site}: {} {kind} backup(s), nothing to rotate", artifacts.len());
            return Ok(Rotation {
                kept: artifacts.len(),
                removed: Vec::new(),
            });
        }

        // newest first
        artifacts.sort_by(|(a_path, a_time), (b_path, b_time)| {
            b_time.cmp(a_time).then_with(|| b_path.cmp(a_path))
        });
        let surplus = artifacts.split_off(max_kept);
        let attempted = surplus.len();

        let mut removed = Vec::with_capacity(attempted);
        let mut failures = Vec::new();
        for (path, _) in surplus {
            match remove(&path) {
                Ok(()) => {
                    log::debug!(target: "backup::retention", "{site}: removed old {kind} backup {}", path.display());
                    removed.push(path);
                }
                Err(e) => failures.push((path, e)),
            }
        }

        if failures.is_empty() {
            log::info!(target: "backup::retention", "{site}: rotated {} old {kind} backup(s)", removed.len());
            Ok(Rotation {
                kept: artifacts.len(),
                removed,
            })
        } else {
            Err(RetentionError::Remove {
                failures,
                attempted,
            })
        }
    }
}

fn list_by_age(dir: &Path, kind: ArtifactKind) -> io::Result<Vec<(PathBuf, SystemTime)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut artifacts = Vec::new();
    for entry in entries {
        let entry = entry?;
        let matches = entry.file_name().to_str().is_some_and(|name| kind.matches(name));
        if !matches {
            continue;
        }
        // vanished in between, e.g. removed by a concurrent run
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        artifacts.push((entry.path(), metadata.modified()?));
    }

    Ok(artifacts)
}
