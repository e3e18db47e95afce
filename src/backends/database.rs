use std::fs;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;

use derive_more::{Display, Error, From};
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::NamedTempFile;

use crate::backends::{Backup, BackupError, Outcome};
use crate::sites::{DatabaseConfig, Site};
use crate::util::artifact::{self, ArtifactKind, BackupLayout};

/// Dump program used if none is configured.
pub const DEFAULT_DUMP_PROGRAM: &str = "mysqldump";

/// Environment variable the dump program reads the password from.
pub const PASSWORD_ENV: &str = "MYSQL_PWD";

#[derive(Debug, Display, Error, From)]
/// Errors on creation of a database dump.
pub enum DumpError {
    /// The site has no database configuration.
    #[display("No database configured")]
    NotConfigured,
    /// The dump program couldn't be started.
    #[display("Starting {program} failed: {source}")]
    Spawn { program: String, source: io::Error },
    /// The dump program exited unsuccessfully.
    #[display("{program} failed with {status}: {}", stderr.trim_end())]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    /// Compressing the output of the dump program failed.
    #[display("Compressing the dump failed: {_0}")]
    Compress(io::Error),
    /// Storing the dump failed.
    #[display("Storing the dump failed: {_0}")]
    #[from]
    Io(io::Error),
}

/// Arguments of `mysqldump` for `db`, the password is passed by environment.
pub fn dump_args(db: &DatabaseConfig) -> [&str; 7] {
    [
        "-h",
        &db.host,
        "-u",
        &db.user,
        "--quick",
        "--lock-tables=false",
        &db.name,
    ]
}

/// Runs the dump program and compresses its output.
#[derive(Clone, Debug)]
pub struct DatabaseDumper {
    program: PathBuf,
    compression: Compression,
}

impl Default for DatabaseDumper {
    fn default() -> Self {
        Self::new(DEFAULT_DUMP_PROGRAM)
    }
}

impl DatabaseDumper {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            compression: Compression::default(),
        }
    }

    /// Sets the gzip compression level, clamped to `0..=9`.
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression = Compression::new(level.min(9));
        self
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Dumps `db` into the gzip compressed file `dest`.
    ///
    /// `dest` only appears once the dump program succeeded and its output is
    /// completely compressed.
    pub fn dump(&self, db: &DatabaseConfig, dest: &Path) -> Result<(), DumpError> {
        let program = self.program.display().to_string();
        let staging = artifact::staging_file(dest.parent().unwrap_or_else(|| Path::new(".")))?;

        let mut command = Command::new(&self.program);
        command
            .args(dump_args(db))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        match &db.password {
            Some(password) => command.env(PASSWORD_ENV, password),
            None => command.env_remove(PASSWORD_ENV),
        };

        let mut dump_process = command.spawn().map_err(|source| DumpError::Spawn {
            program: program.clone(),
            source,
        })?;
        log::trace!(target: "backup::database", "Started {program} for {db}");

        // drain stderr concurrently, a full pipe would block the dump
        let stderr_reader = dump_process.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut captured = Vec::new();
                let _ = stderr.read_to_end(&mut captured);
                captured
            })
        });

        let compressed = match dump_process.stdout.take() {
            Some(stdout) => self.compress_into(stdout, staging),
            None => Err(io::Error::other("stdout of the dump program is not captured")),
        };
        let status = dump_process.wait()?;
        let stderr = stderr_reader
            .and_then(|reader| reader.join().ok())
            .map(|captured| String::from_utf8_lossy(&captured).into_owned())
            .unwrap_or_default();

        if !status.success() {
            return Err(DumpError::Failed {
                program,
                status,
                stderr,
            });
        }
        let staging = compressed.map_err(DumpError::Compress)?;

        // relay warnings of a successful dump
        if !stderr.trim().is_empty() {
            log::warn!(target: "backup::database", "{program}: {}", stderr.trim_end());
        }

        artifact::commit(staging, dest)?;
        Ok(())
    }

    fn compress_into(&self, reader: impl Read, staging: NamedTempFile) -> io::Result<NamedTempFile> {
        let mut reader = BufReader::new(reader);
        let mut encoder = GzEncoder::new(staging, self.compression);
        io::copy(&mut reader, &mut encoder)?;
        encoder.finish()
    }
}

/// Dumps of the databases of local sites.
pub struct LocalDatabase {
    layout: BackupLayout,
    dumper: DatabaseDumper,
}

impl LocalDatabase {
    pub fn new(layout: BackupLayout, dumper: DatabaseDumper) -> Self {
        Self { layout, dumper }
    }
}

impl Backup for LocalDatabase {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::Database
    }

    fn applies_to(&self, site: &Site) -> bool {
        site.database().is_some()
    }

    fn backup(&self, site: &Site) -> Result<Outcome, BackupError> {
        let name = site.name();
        let db = site.database().ok_or(DumpError::NotConfigured)?;
        log::info!(target: "backup::database", "{name}: dumping {db}");

        fs::create_dir_all(self.layout.artifact_dir(name, ArtifactKind::Database)).map_err(DumpError::from)?;
        let dest = self.layout.new_artifact_path(name, ArtifactKind::Database);
        self.dumper.dump(db, &dest)?;

        log::info!(target: "backup::database", "{name}: saved database dump at {}", dest.display());
        Ok(Outcome::Created(dest))
    }
}
