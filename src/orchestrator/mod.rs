//! Coordination of the backup units of all sites of one run.
//!
//! Every site yields up to two units: one for its files and, if it has a
//! database, one for its database. Each unit produces exactly one
//! [BackupResult]; a failing unit never stops the others.

mod local;
mod remote;

pub use local::LocalBackup;
pub use remote::RemoteBackup;

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

use derive_more::Display;

use crate::backends::{Backup, Outcome, Stage};
use crate::sites::{Site, SiteName};
use crate::util::artifact::ArtifactKind;
use crate::util::retention::RetentionManager;

/// Where the backed up sites live.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    #[display("local")]
    Local,
    #[display("remote")]
    Remote,
}

/// Status of one attempted unit.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum UnitStatus {
    Created { path: PathBuf },
    Unchanged,
    Failed { stage: Stage, error: String },
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created { path } => write!(f, "created {}", path.display()),
            Self::Unchanged => f.write_str("unchanged"),
            Self::Failed { stage, error } => write!(f, "failed at {stage}: {error}"),
        }
    }
}

/// Result of one unit of a run.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct BackupResult {
    pub site: SiteName,
    pub kind: ArtifactKind,
    #[serde(flatten)]
    pub status: UnitStatus,
}

impl BackupResult {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, UnitStatus::Failed { .. })
    }
}

/// All results of one mode of a run.
#[derive(Clone, Debug, serde::Serialize)]
pub struct Summary {
    pub mode: BackupMode,
    pub results: Vec<BackupResult>,
    /// Reason the run stopped before any site was backed up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl Summary {
    pub fn new(mode: BackupMode, results: Vec<BackupResult>) -> Self {
        Self {
            mode,
            results,
            aborted: None,
        }
    }

    pub fn aborted(mode: BackupMode, reason: impl fmt::Display) -> Self {
        Self {
            mode,
            results: Vec::new(),
            aborted: Some(reason.to_string()),
        }
    }

    /// Number of failed units.
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.is_failed()).count()
    }

    pub fn is_success(&self) -> bool {
        self.aborted.is_none() && self.failed() == 0
    }

    /// Logs every unit and the totals.
    pub fn log(&self) {
        if let Some(reason) = &self.aborted {
            log::error!(target: "backup::orchestrator", "The {} backup was aborted: {reason}", self.mode);
            return;
        }

        for result in &self.results {
            if result.is_failed() {
                log::error!(target: "backup::orchestrator", "{} {} backup {}", result.site, result.kind, result.status);
            } else {
                log::info!(target: "backup::orchestrator", "{} {} backup {}", result.site, result.kind, result.status);
            }
        }

        let created = self
            .results
            .iter()
            .filter(|r| matches!(r.status, UnitStatus::Created { .. }))
            .count();
        log::info!(
            target: "backup::orchestrator",
            "Finished the {} backup: {created} created, {} unchanged, {} failed",
            self.mode,
            self.results.len() - created - self.failed(),
            self.failed(),
        );
    }
}

/// Logs the discovered sites, passwords masked.
pub fn log_sites(mode: BackupMode, sites: &[Site]) {
    log::info!(target: "backup::orchestrator", "Discovered {} {mode} site(s)", sites.len());
    for site in sites {
        log::info!(target: "backup::orchestrator", "  {site}");
    }
}

/// Stage a unit of `kind` is attributed to if it fails outside of a backend.
fn main_stage(kind: ArtifactKind) -> Stage {
    match kind {
        ArtifactKind::Files => Stage::Archive,
        ArtifactKind::Database => Stage::Dump,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// Runs one unit and rotates its artifacts unless it failed.
///
/// Panics of the backend are turned into a failed result.
fn run_unit<B: Backup + ?Sized>(backend: &B, retention: &RetentionManager, site: &Site) -> BackupResult {
    let kind = backend.kind();
    let name = site.name();

    let status = match panic::catch_unwind(AssertUnwindSafe(|| backend.backup(site))) {
        Ok(Ok(Outcome::Created(path))) => UnitStatus::Created { path },
        Ok(Ok(Outcome::Unchanged)) => UnitStatus::Unchanged,
        Ok(Err(e)) => {
            log::error!(target: "backup::orchestrator", "{name}: {kind} backup failed at {}: {e}", e.stage());
            UnitStatus::Failed {
                stage: e.stage(),
                error: e.to_string(),
            }
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            log::error!(target: "backup::orchestrator", "{name}: {kind} backup panicked: {message}");
            UnitStatus::Failed {
                stage: main_stage(kind),
                error: format!("backup worker panicked: {message}"),
            }
        }
    };

    if !matches!(status, UnitStatus::Failed { .. }) {
        if let Err(e) = retention.rotate(name, kind) {
            log::warn!(target: "backup::orchestrator", "{name}: rotating {kind} backups failed: {e}");
        }
    }

    BackupResult {
        site: name.clone(),
        kind,
        status,
    }
}
