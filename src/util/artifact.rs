//! Naming, layout and atomic creation of backup artifacts.
//!
//! Every artifact carries its creation time in the file name, formatted with
//! [TIMESTAMP_FORMAT], so lexical and chronological order coincide:
//!
//! ```text
//! <backup_root>/<site>/files_2024-05-01_031500.tar.gz
//! <backup_root>/<site>/database/db_2024-05-01_031502.sql.gz
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use derive_more::Display;
use tempfile::NamedTempFile;

use crate::sites::SiteName;

/// Timestamp embedded into artifact file names.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H%M%S";

/// Sub directory of a site holding its database dumps.
pub const DATABASE_DIR: &str = "database";

const STAGING_PREFIX: &str = ".partial-";

/// The two kinds of artifacts created per site.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Compressed archive of the document root.
    #[display("file")]
    Files,
    /// Compressed dump of the site's database.
    #[display("database")]
    Database,
}

impl ArtifactKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Files => "files_",
            Self::Database => "db_",
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Self::Files => ".tar.gz",
            Self::Database => ".sql.gz",
        }
    }

    /// File name of an artifact created at `created`.
    pub fn file_name<Tz: TimeZone>(self, created: &DateTime<Tz>) -> String
    where
        Tz::Offset: std::fmt::Display,
    {
        format!(
            "{}{}{}",
            self.prefix(),
            created.format(TIMESTAMP_FORMAT),
            self.suffix()
        )
    }

    /// Returns if `file_name` matches the artifact pattern, e.g. `files_*.tar.gz`.
    pub fn matches(self, file_name: &str) -> bool {
        file_name.len() >= self.prefix().len() + self.suffix().len()
            && file_name.starts_with(self.prefix())
            && file_name.ends_with(self.suffix())
    }

    /// Parses the creation time out of an artifact file name.
    pub fn timestamp_of(self, file_name: &str) -> Option<NaiveDateTime> {
        let timestamp = file_name
            .strip_prefix(self.prefix())?
            .strip_suffix(self.suffix())?;
        NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()
    }
}

/// An artifact found on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub created: NaiveDateTime,
}

impl Artifact {
    /// Creation time as unix timestamp, interpreting the name in local time.
    pub fn created_unix(&self) -> i64 {
        Local
            .from_local_datetime(&self.created)
            .earliest()
            .map(|created| created.timestamp())
            .unwrap_or_else(|| self.created.and_utc().timestamp())
    }
}

/// Directory layout below a backup root.
#[derive(Clone, Debug)]
pub struct BackupLayout {
    root: PathBuf,
}

impl BackupLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        if root.is_relative() {
            log::warn!(target: "backup::archive", "Backup root is relative: {}", root.display());
        }

        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the file archives of `site`.
    pub fn site_dir(&self, site: &SiteName) -> PathBuf {
        self.root.join(site.as_str())
    }

    /// Directory holding the artifacts of `kind` for `site`.
    pub fn artifact_dir(&self, site: &SiteName, kind: ArtifactKind) -> PathBuf {
        match kind {
            ArtifactKind::Files => self.site_dir(site),
            ArtifactKind::Database => self.site_dir(site).join(DATABASE_DIR),
        }
    }

    /// Path of a new artifact of `kind` for `site`, stamped with the current time.
    pub fn new_artifact_path(&self, site: &SiteName, kind: ArtifactKind) -> PathBuf {
        self.artifact_dir(site, kind)
            .join(kind.file_name(&Local::now()))
    }
}

/// Lists all artifacts of `kind` with a parseable timestamp in `dir`.
///
/// A missing directory holds no artifacts.
pub fn list(dir: &Path, kind: ArtifactKind) -> io::Result<Vec<Artifact>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut artifacts = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(created) = name.to_str().and_then(|name| kind.timestamp_of(name)) else {
            continue;
        };
        artifacts.push(Artifact {
            path: entry.path(),
            created,
        });
    }

    Ok(artifacts)
}

/// Most recent artifact of `kind` in `dir` by the timestamp in its name.
pub fn latest(dir: &Path, kind: ArtifactKind) -> io::Result<Option<Artifact>> {
    Ok(list(dir, kind)?
        .into_iter()
        .max_by(|a, b| a.created.cmp(&b.created).then_with(|| a.path.cmp(&b.path))))
}

/// Creates a hidden temporary file in `dir` to stage an artifact.
///
/// The file is removed when dropped unless it is [committed](commit).
/// Its name never matches an [ArtifactKind] pattern.
pub fn staging_file(dir: &Path) -> io::Result<NamedTempFile> {
    tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .suffix(".tmp")
        .tempfile_in(dir)
}

/// Moves a completely written staging file to its final artifact path.
pub fn commit(staging: NamedTempFile, dest: &Path) -> io::Result<()> {
    staging.as_file().sync_all()?;
    staging.persist(dest).map_err(|e| e.error)?;
    log::trace!(target: "backup::archive", "Committed artifact {}", dest.display());
    Ok(())
}
