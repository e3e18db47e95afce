//! Backend modules creating the artifacts of a single site.
//!
//! Currently the following backends are implemented:
//!
//! - [LocalFiles]: Compressed archive of a local document root, skipped if
//!   nothing changed since the last archive.
//! - [LocalDatabase]: Compressed dump of a site's database.
//! - [RemoteFiles] and [RemoteDatabase]: The same for a site on a remote
//!   host, created there and transferred to the local backup root.

pub mod database;
pub mod files;
pub mod remote;

pub use database::{DatabaseDumper, DumpError, LocalDatabase, DEFAULT_DUMP_PROGRAM};
pub use files::LocalFiles;
pub use remote::{RemoteDatabase, RemoteFiles, TransferMethod};

use std::path::PathBuf;

use derive_more::{Display, Error, From};

use crate::archive::ArchiveError;
use crate::change::ChangeError;
use crate::remote::RemoteError;
use crate::sites::Site;
use crate::util::artifact::ArtifactKind;

/// Step of a backup unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    #[display("change-check")]
    ChangeCheck,
    #[display("archive")]
    Archive,
    #[display("dump")]
    Dump,
    #[display("transfer")]
    Transfer,
}

/// Result of a successful backup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// A new artifact was created at the given path.
    Created(PathBuf),
    /// Nothing changed since the last backup, no artifact was created.
    Unchanged,
}

#[derive(Debug, Display, Error, From)]
/// Failure of a backup, tagged by the [Stage] it happened in.
pub enum BackupError {
    #[display("{_0}")]
    #[from]
    ChangeCheck(ChangeError),
    #[display("{_0}")]
    #[from]
    Archive(ArchiveError),
    #[display("{_0}")]
    #[from]
    Dump(DumpError),
    /// A step executed on the remote host failed.
    #[display("{source}")]
    Remote { stage: Stage, source: RemoteError },
}

impl BackupError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::ChangeCheck(_) => Stage::ChangeCheck,
            Self::Archive(_) => Stage::Archive,
            Self::Dump(_) => Stage::Dump,
            Self::Remote { stage, .. } => *stage,
        }
    }

    pub(crate) fn remote(stage: Stage) -> impl FnOnce(RemoteError) -> Self {
        move |source| Self::Remote { stage, source }
    }
}

/// Creates one kind of artifact for a site.
pub trait Backup {
    /// Kind of the artifacts created.
    fn kind(&self) -> ArtifactKind;

    /// Returns if the backend has anything to backup for `site`.
    fn applies_to(&self, _site: &Site) -> bool {
        true
    }

    /// Creates a new artifact for `site` in the backup root.
    ///
    /// On failure no artifact is left behind.
    fn backup(&self, site: &Site) -> Result<Outcome, BackupError>;
}
