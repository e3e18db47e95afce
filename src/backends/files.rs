use std::fs;

use crate::archive::{ArchiveEngine, ArchiveError};
use crate::backends::{Backup, BackupError, Outcome};
use crate::change::{ChangeDetector, SnapshotDetector};
use crate::sites::Site;
use crate::util::artifact::{ArtifactKind, BackupLayout};

/// Archives of local document roots.
pub struct LocalFiles {
    layout: BackupLayout,
    engine: ArchiveEngine,
    detector: SnapshotDetector,
}

impl LocalFiles {
    pub fn new(layout: BackupLayout, engine: ArchiveEngine) -> Self {
        let detector = SnapshotDetector::new(layout.clone(), engine.clone());
        Self {
            layout,
            engine,
            detector,
        }
    }
}

impl Backup for LocalFiles {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::Files
    }

    fn backup(&self, site: &Site) -> Result<Outcome, BackupError> {
        let name = site.name();
        if !self.detector.has_changed(name, site.document_root())? {
            log::info!(target: "backup::archive", "{name}: files unchanged since the last backup");
            return Ok(Outcome::Unchanged);
        }

        fs::create_dir_all(self.layout.artifact_dir(name, ArtifactKind::Files)).map_err(ArchiveError::from)?;
        let dest = self.layout.new_artifact_path(name, ArtifactKind::Files);
        let stats = self.engine.create(site.document_root(), &dest)?;

        log::info!(
            target: "backup::archive",
            "{name}: archived {} file(s) ({} bytes) into {}",
            stats.files,
            stats.bytes,
            dest.display()
        );
        Ok(Outcome::Created(dest))
    }
}
