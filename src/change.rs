//! Detection of sites whose files changed since their last archive.

use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Local, Utc};
use derive_more::{Display, Error, From};

use crate::archive::{ArchiveEngine, ArchiveError};
use crate::remote::{RemoteCommand, RemoteError, Session, Transport};
use crate::sites::SiteName;
use crate::util::artifact::{self, ArtifactKind, BackupLayout};
use crate::util::shell;

#[derive(Debug, Display, Error, From)]
/// Errors while deciding if a site changed.
pub enum ChangeError {
    #[display("Inspecting the previous backup failed: {_0}")]
    #[from]
    Io(io::Error),
    #[display("Unpacking the previous backup failed: {_0}")]
    #[from]
    Archive(ArchiveError),
    #[display("Walking the site failed: {_0}")]
    #[from]
    Walk(walkdir::Error),
    #[display("Checking the remote site failed: {_0}")]
    #[from]
    Remote(RemoteError),
    #[display("Unexpected output of the remote change check: {_0:?}")]
    UnexpectedOutput(#[error(ignore)] String),
}

/// Decides whether the files of a site need to be archived again.
pub trait ChangeDetector {
    fn has_changed(&self, site: &SiteName, source_tree: &Path) -> Result<bool, ChangeError>;
}

/// Compares a local tree against the snapshot of its most recent archive.
pub struct SnapshotDetector {
    layout: BackupLayout,
    engine: ArchiveEngine,
}

impl SnapshotDetector {
    /// The `engine` must be the one that created the archives, so both apply
    /// the same exclusions.
    pub fn new(layout: BackupLayout, engine: ArchiveEngine) -> Self {
        Self { layout, engine }
    }

    /// Returns the first difference between `source` and `snapshot`.
    fn difference(&self, source: &Path, snapshot: &Path, archived_at: i64) -> Result<Option<String>, ChangeError> {
        let mut compared = 0usize;

        for entry in self.engine.walk(source) {
            let entry = entry?;
            let file_type = entry.file_type();
            if !(file_type.is_dir() || file_type.is_file()) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(source) else {
                continue;
            };
            compared += 1;

            let archived = match fs::symlink_metadata(snapshot.join(relative)) {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Ok(Some(format!("{} is new", relative.display())));
                }
                Err(e) => return Err(e.into()),
            };
            if archived.is_dir() != file_type.is_dir() {
                return Ok(Some(format!("{} changed its type", relative.display())));
            }
            if file_type.is_dir() {
                continue;
            }

            let current = entry.metadata()?;
            if current.len() != archived.len() {
                return Ok(Some(format!("{} changed its size", relative.display())));
            }
            let modified = DateTime::<Utc>::from(current.modified()?).timestamp();
            if modified > archived_at {
                return Ok(Some(format!("{} was modified", relative.display())));
            }
        }

        let archived_entries = self.engine.walk(snapshot).count();
        if archived_entries > compared {
            return Ok(Some(format!("{} entries were removed", archived_entries - compared)));
        }
        Ok(None)
    }
}

impl ChangeDetector for SnapshotDetector {
    fn has_changed(&self, site: &SiteName, source_tree: &Path) -> Result<bool, ChangeError> {
        let site_dir = self.layout.site_dir(site);
        let Some(latest) = artifact::latest(&site_dir, ArtifactKind::Files)? else {
            log::debug!(target: "backup::change", "{site}: no previous file backup");
            return Ok(true);
        };

        // removed on drop, also on early returns
        let scratch = tempfile::Builder::new()
            .prefix(".scratch-")
            .tempdir_in(&site_dir)?;
        self.engine.extract(&latest.path, scratch.path())?;

        let difference = self.difference(source_tree, scratch.path(), latest.created_unix())?;
        if let Err(e) = scratch.close() {
            log::warn!(target: "backup::change", "{site}: removing the snapshot scratch directory failed: {e}");
        }

        match difference {
            Some(reason) => {
                log::debug!(target: "backup::change", "{site}: changed since {}, {reason}", latest.path.display());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Coarse check of a remote tree: any file modified within the last day.
///
/// A site that already got a file backup today counts as unchanged.
pub struct RecentChangesDetector<'s, T: Transport> {
    session: &'s Session<T>,
    layout: BackupLayout,
    excluded_dir: String,
}

impl<'s, T: Transport> RecentChangesDetector<'s, T> {
    /// `layout` is where the local copies of the remote backups are stored.
    pub fn new(session: &'s Session<T>, layout: BackupLayout, excluded_dir: impl Into<String>) -> Self {
        Self {
            session,
            layout,
            excluded_dir: excluded_dir.into(),
        }
    }

    fn command(&self, source_tree: &Path) -> RemoteCommand {
        RemoteCommand::new(format!(
            "cd {} && find . -type f -mtime -1 -not -path '*/.*' -not -path {} | wc -l",
            shell::quote(&source_tree.to_string_lossy()),
            shell::quote(&format!("*/{}/*", self.excluded_dir)),
        ))
    }
}

impl<T: Transport> ChangeDetector for RecentChangesDetector<'_, T> {
    fn has_changed(&self, site: &SiteName, source_tree: &Path) -> Result<bool, ChangeError> {
        let site_dir = self.layout.site_dir(site);
        if let Some(latest) = artifact::latest(&site_dir, ArtifactKind::Files)? {
            if latest.created.date() == Local::now().date_naive() {
                log::debug!(target: "backup::change", "{site}: already backed up today");
                return Ok(false);
            }
        }

        let output = self.session.run(&self.command(source_tree))?;
        let recent: u64 = output
            .stdout
            .trim()
            .parse()
            .map_err(|_| ChangeError::UnexpectedOutput(output.stdout.clone()))?;

        log::debug!(target: "backup::change", "{site}: {recent} file(s) modified within the last day");
        Ok(recent > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use chrono::Duration;
    use filetime::FileTime;
    use tempfile::TempDir;

    use crate::remote::mock::MockTransport;

    struct Fixture {
        _dir: TempDir,
        tree: PathBuf,
        layout: BackupLayout,
        site: SiteName,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let tree = dir.path().join("srv/app");
            fs::create_dir_all(tree.join("public/css")).unwrap();
            fs::create_dir_all(tree.join("node_modules/pkg")).unwrap();
            fs::write(tree.join("public/index.php"), "<?php require 'app.php';").unwrap();
            fs::write(tree.join("public/css/app.css"), "body {}").unwrap();
            fs::write(tree.join("composer.json"), "{}").unwrap();

            let layout = BackupLayout::new(dir.path().join("backups"));
            let site = SiteName::parse("app.example.com").unwrap();
            fs::create_dir_all(layout.site_dir(&site)).unwrap();
            Self {
                _dir: dir,
                tree,
                layout,
                site,
            }
        }

        fn archive(&self) -> PathBuf {
            let dest = self.layout.new_artifact_path(&self.site, ArtifactKind::Files);
            ArchiveEngine::default().create(&self.tree, &dest).unwrap();
            dest
        }

        fn detector(&self) -> SnapshotDetector {
            SnapshotDetector::new(self.layout.clone(), ArchiveEngine::default())
        }

        fn changed(&self) -> bool {
            self.detector().has_changed(&self.site, &self.tree).unwrap()
        }
    }

    #[test]
    fn without_archive_the_site_changed() {
        let fixture = Fixture::new();
        assert!(fixture.changed());
    }

    #[test]
    fn unmodified_tree_is_unchanged() {
        let fixture = Fixture::new();
        fixture.archive();
        assert!(!fixture.changed());

        // the scratch directory is gone
        let leftovers: Vec<_> = fs::read_dir(fixture.layout.site_dir(&fixture.site))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1, "{leftovers:?}");
    }

    #[test]
    fn size_change_is_detected() {
        let fixture = Fixture::new();
        fixture.archive();
        fs::write(fixture.tree.join("composer.json"), "{\"name\": \"app\"}").unwrap();
        assert!(fixture.changed());
    }

    #[test]
    fn later_modification_is_detected() {
        let fixture = Fixture::new();
        fixture.archive();
        let css = fixture.tree.join("public/css/app.css");
        let later = Local::now() + Duration::hours(1);
        filetime::set_file_mtime(&css, FileTime::from_unix_time(later.timestamp(), 0)).unwrap();
        assert!(fixture.changed());
    }

    #[test]
    fn new_and_removed_entries_are_detected() {
        let fixture = Fixture::new();
        fixture.archive();
        fs::write(fixture.tree.join("public/robots.txt"), "").unwrap();
        assert!(fixture.changed());

        let fixture = Fixture::new();
        fixture.archive();
        fs::remove_file(fixture.tree.join("composer.json")).unwrap();
        assert!(fixture.changed());
    }

    #[test]
    fn excluded_directory_is_ignored() {
        let fixture = Fixture::new();
        fixture.archive();
        fs::write(fixture.tree.join("node_modules/pkg/index.js"), "changed").unwrap();
        assert!(!fixture.changed());
    }

    fn remote_session(transport: MockTransport) -> Session<MockTransport> {
        Session::with_transport(transport, 2, "~/.site-backup-tmp").unwrap()
    }

    #[test]
    fn remote_count_decides() {
        let dir = TempDir::new().unwrap();
        let layout = BackupLayout::new(dir.path());
        let site = SiteName::parse("shop").unwrap();

        let transport = MockTransport::unlimited();
        transport.respond("cd /srv/quiet ", 0, "0\n", "");
        transport.respond("cd /srv/busy ", 0, "  12\n", "");
        transport.respond("cd /srv/odd ", 0, "find: oops\n", "");
        let session = remote_session(transport);
        let detector = RecentChangesDetector::new(&session, layout, "node_modules");

        assert!(!detector.has_changed(&site, Path::new("/srv/quiet")).unwrap());
        assert!(detector.has_changed(&site, Path::new("/srv/busy")).unwrap());
        assert!(matches!(
            detector.has_changed(&site, Path::new("/srv/odd")),
            Err(ChangeError::UnexpectedOutput(_))
        ));

        let command = session.pool().transport().commands().pop().unwrap();
        assert_eq!(
            command,
            "cd /srv/odd && find . -type f -mtime -1 -not -path '*/.*' -not -path '*/node_modules/*' | wc -l"
        );
    }

    #[test]
    fn remote_site_backed_up_today_is_unchanged() {
        let dir = TempDir::new().unwrap();
        let layout = BackupLayout::new(dir.path());
        let site = SiteName::parse("shop").unwrap();
        fs::create_dir_all(layout.site_dir(&site)).unwrap();
        fs::write(layout.new_artifact_path(&site, ArtifactKind::Files), b"").unwrap();

        let transport = MockTransport::unlimited();
        transport.respond("cd /srv/shop ", 0, "5\n", "");
        let session = remote_session(transport);
        let detector = RecentChangesDetector::new(&session, layout, "node_modules");

        assert!(!detector.has_changed(&site, Path::new("/srv/shop")).unwrap());
        assert!(!session
            .pool()
            .transport()
            .commands()
            .iter()
            .any(|c| c.contains("/srv/shop")));
    }
}
