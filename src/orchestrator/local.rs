use std::sync::mpsc;
use std::thread;

use super::{main_stage, run_unit, BackupResult, UnitStatus};
use crate::archive::ArchiveEngine;
use crate::backends::{Backup, DatabaseDumper, LocalDatabase, LocalFiles};
use crate::sites::Site;
use crate::util::artifact::BackupLayout;
use crate::util::retention::{RetentionManager, RetentionPolicy};

/// Backup of the sites of the local host.
///
/// Every unit runs on its own thread; results are collected over a channel.
pub struct LocalBackup {
    files: LocalFiles,
    database: LocalDatabase,
    retention: RetentionManager,
}

impl LocalBackup {
    pub fn new(layout: BackupLayout, engine: ArchiveEngine, dumper: DatabaseDumper, policy: RetentionPolicy) -> Self {
        Self {
            files: LocalFiles::new(layout.clone(), engine),
            database: LocalDatabase::new(layout.clone(), dumper),
            retention: RetentionManager::new(layout, policy),
        }
    }

    /// Backs up all `sites` concurrently and returns one result per unit.
    pub fn run(&self, sites: &[Site]) -> Vec<BackupResult> {
        let backends: [&(dyn Backup + Sync); 2] = [&self.files, &self.database];
        run_concurrently(&backends, &self.retention, sites)
    }
}

/// Spawns one thread per applicable (site, backend) pair, files first.
fn run_concurrently(backends: &[&(dyn Backup + Sync)], retention: &RetentionManager, sites: &[Site]) -> Vec<BackupResult> {
    let (tx, rx) = mpsc::channel();

    thread::scope(|scope| {
        let mut results = Vec::new();

        for site in sites {
            for &backend in backends {
                if !backend.applies_to(site) {
                    continue;
                }

                let kind = backend.kind();
                let tx = tx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("{}-{kind}", site.name()))
                    .spawn_scoped(scope, move || {
                        // the receiver lives until every sender is gone
                        let _ = tx.send(run_unit(backend, retention, site));
                    });

                if let Err(e) = spawned {
                    log::error!(target: "backup::orchestrator", "{}: starting the {kind} backup failed: {e}", site.name());
                    results.push(BackupResult {
                        site: site.name().clone(),
                        kind,
                        status: UnitStatus::Failed {
                            stage: main_stage(kind),
                            error: format!("starting the backup worker failed: {e}"),
                        },
                    });
                }
            }
        }

        drop(tx);
        results.extend(rx);
        log::debug!(target: "backup::orchestrator", "Collected {} result(s)", results.len());
        results
    })
}
