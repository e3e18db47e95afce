use super::{log_sites, run_unit, BackupMode, BackupResult};
use crate::archive::ArchiveEngine;
use crate::backends::{Backup, RemoteDatabase, RemoteFiles, TransferMethod};
use crate::remote::{RemoteConfigSource, Session, Transport};
use crate::sites::{self, DiscoveryError, Site};
use crate::util::artifact::BackupLayout;
use crate::util::retention::{RetentionManager, RetentionPolicy};

/// Backup of the sites of a remote host into the local backup root.
///
/// Sites are processed one after another, all channel I/O of one connection
/// is serialized anyway.
pub struct RemoteBackup<'s, T: Transport> {
    session: &'s Session<T>,
    files: RemoteFiles<'s, T>,
    database: RemoteDatabase<'s, T>,
    retention: RetentionManager,
}

impl<'s, T: Transport> RemoteBackup<'s, T> {
    /// The exclusions and compression of `engine` are applied remotely.
    pub fn new(
        session: &'s Session<T>,
        layout: BackupLayout,
        engine: &ArchiveEngine,
        transfer: TransferMethod,
        policy: RetentionPolicy,
    ) -> Self {
        Self {
            session,
            files: RemoteFiles::new(session, layout.clone(), engine.excluded_dir(), transfer),
            database: RemoteDatabase::new(session, layout.clone(), engine.compression(), transfer),
            retention: RetentionManager::new(layout, policy),
        }
    }

    /// Discovers the sites below `config_dirs` on the remote host.
    pub fn discover(&self, config_dirs: Vec<String>) -> Result<Vec<Site>, DiscoveryError> {
        let sites = sites::discover(&RemoteConfigSource::new(self.session, config_dirs))?;
        log_sites(BackupMode::Remote, &sites);
        Ok(sites)
    }

    /// Backs up all `sites` sequentially and returns one result per unit.
    pub fn run(&self, sites: &[Site]) -> Vec<BackupResult> {
        let backends: [&dyn Backup; 2] = [&self.files, &self.database];

        let mut results = Vec::new();
        for site in sites {
            for backend in backends {
                if backend.applies_to(site) {
                    results.push(run_unit(backend, &self.retention, site));
                }
            }
        }
        results
    }
}
