use std::fs;
use std::io;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::archive::ArchiveError;
use crate::backends::database::{dump_args, DEFAULT_DUMP_PROGRAM, PASSWORD_ENV};
use crate::backends::{Backup, BackupError, DumpError, Outcome, Stage};
use crate::change::{ChangeDetector, RecentChangesDetector};
use crate::remote::{RemoteCommand, RemoteError, Session, Transport};
use crate::sites::Site;
use crate::util::artifact::{self, ArtifactKind, BackupLayout};
use crate::util::shell;

/// How artifacts are moved from the remote host to the backup root.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransferMethod {
    /// The artifact is streamed through a command channel.
    #[default]
    Stream,
    /// The artifact is created in the remote scratch directory and copied with `scp`.
    Scp,
}

/// Copies `remote_path` to `dest`, staged like every other artifact.
fn fetch<T: Transport>(session: &Session<T>, remote_path: &str, dest: &Path) -> Result<(), RemoteError> {
    let transfer_error = |e: io::Error| RemoteError::Transfer {
        remote_path: remote_path.to_string(),
        reason: e.to_string(),
    };

    let staging = artifact::staging_file(dest.parent().unwrap_or_else(|| Path::new("."))).map_err(transfer_error)?;
    session.transfer_out(remote_path, staging.path())?;
    artifact::commit(staging, dest).map_err(transfer_error)
}

/// Removes temporary remote files, failures are only logged.
fn clean_up<T: Transport>(session: &Session<T>, remote_paths: &[&str]) {
    for path in remote_paths {
        if let Err(e) = session.remove(path) {
            log::warn!(target: "backup::remote", "Removing remote {path} failed: {e}");
        }
    }
}

/// Name of the temporary remote copy of the artifact `dest`.
fn scratch_name(site: &Site, dest: &Path) -> String {
    let file_name = dest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}_{file_name}", site.name())
}

/// Archives of document roots on the remote host.
pub struct RemoteFiles<'s, T: Transport> {
    session: &'s Session<T>,
    layout: BackupLayout,
    excluded_dir: String,
    transfer: TransferMethod,
    detector: RecentChangesDetector<'s, T>,
}

impl<'s, T: Transport> RemoteFiles<'s, T> {
    pub fn new(
        session: &'s Session<T>,
        layout: BackupLayout,
        excluded_dir: impl Into<String>,
        transfer: TransferMethod,
    ) -> Self {
        let excluded_dir = excluded_dir.into();
        let detector = RecentChangesDetector::new(session, layout.clone(), excluded_dir.clone());
        Self {
            session,
            layout,
            excluded_dir,
            transfer,
            detector,
        }
    }

    /// `tar` command archiving `site` into `output`, `-` for stdout.
    fn tar_command(&self, site: &Site, output: &str) -> RemoteCommand {
        RemoteCommand::new(format!(
            "tar -czf {} {} -C {} .",
            shell::quote(output),
            shell::quote(&format!("--exclude={}", self.excluded_dir)),
            shell::quote(&site.document_root().to_string_lossy()),
        ))
    }
}

impl<T: Transport> Backup for RemoteFiles<'_, T> {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::Files
    }

    fn backup(&self, site: &Site) -> Result<Outcome, BackupError> {
        let name = site.name();
        if !self.detector.has_changed(name, site.document_root())? {
            log::info!(target: "backup::archive", "{name}: no recent changes on the remote host");
            return Ok(Outcome::Unchanged);
        }

        let dir = self.layout.artifact_dir(name, ArtifactKind::Files);
        fs::create_dir_all(&dir).map_err(ArchiveError::from)?;
        let dest = self.layout.new_artifact_path(name, ArtifactKind::Files);

        match self.transfer {
            TransferMethod::Stream => {
                let mut staging = artifact::staging_file(&dir).map_err(ArchiveError::from)?;
                self.session
                    .run_streaming(&self.tar_command(site, "-"), &mut staging)
                    .map_err(BackupError::remote(Stage::Archive))?;
                artifact::commit(staging, &dest).map_err(ArchiveError::from)?;
            }
            TransferMethod::Scp => {
                let remote_path = self.session.scratch_path(&scratch_name(site, &dest));
                let created = self
                    .session
                    .run(&self.tar_command(site, &remote_path))
                    .map_err(BackupError::remote(Stage::Archive))
                    .and_then(|_| fetch(self.session, &remote_path, &dest).map_err(BackupError::remote(Stage::Transfer)));
                clean_up(self.session, &[remote_path.as_str()]);
                created?;
            }
        }

        log::info!(target: "backup::archive", "{name}: saved remote file backup at {}", dest.display());
        Ok(Outcome::Created(dest))
    }
}

/// Dumps of databases of sites on the remote host.
pub struct RemoteDatabase<'s, T: Transport> {
    session: &'s Session<T>,
    layout: BackupLayout,
    compression: Compression,
    transfer: TransferMethod,
}

impl<'s, T: Transport> RemoteDatabase<'s, T> {
    pub fn new(session: &'s Session<T>, layout: BackupLayout, compression: Compression, transfer: TransferMethod) -> Self {
        Self {
            session,
            layout,
            compression,
            transfer,
        }
    }

    /// `mysqldump` command of the site's database writing to stdout.
    fn dump_command(site: &Site) -> Result<RemoteCommand, DumpError> {
        let db = site.database().ok_or(DumpError::NotConfigured)?;
        let args: Vec<String> = dump_args(db).iter().map(|arg| shell::quote(arg)).collect();
        let dump = format!("{DEFAULT_DUMP_PROGRAM} {}", args.join(" "));

        Ok(match &db.password {
            Some(password) => RemoteCommand::with_secret_env(PASSWORD_ENV, password, &dump),
            None => RemoteCommand::new(dump),
        })
    }
}

impl<T: Transport> Backup for RemoteDatabase<'_, T> {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::Database
    }

    fn applies_to(&self, site: &Site) -> bool {
        site.database().is_some()
    }

    fn backup(&self, site: &Site) -> Result<Outcome, BackupError> {
        let name = site.name();
        let command = Self::dump_command(site)?;

        let dir = self.layout.artifact_dir(name, ArtifactKind::Database);
        fs::create_dir_all(&dir).map_err(DumpError::from)?;
        let dest = self.layout.new_artifact_path(name, ArtifactKind::Database);

        match self.transfer {
            TransferMethod::Stream => {
                // the raw dump is compressed locally
                let staging = artifact::staging_file(&dir).map_err(DumpError::from)?;
                let mut encoder = GzEncoder::new(staging, self.compression);
                let stderr = self
                    .session
                    .run_streaming(&command, &mut encoder)
                    .map_err(BackupError::remote(Stage::Dump))?;
                if !stderr.trim().is_empty() {
                    log::warn!(target: "backup::database", "{name}: {}", stderr.trim_end());
                }
                let staging = encoder.finish().map_err(DumpError::Compress)?;
                artifact::commit(staging, &dest).map_err(DumpError::from)?;
            }
            TransferMethod::Scp => {
                let compressed = self.session.scratch_path(&scratch_name(site, &dest));
                let raw = compressed.strip_suffix(".gz").unwrap_or(&compressed).to_string();
                let command = command
                    .prefixed("umask 077; ")
                    .followed_by(&format!(" > {raw} && gzip -f {raw}", raw = shell::quote(&raw)));

                let created = self
                    .session
                    .run(&command)
                    .map_err(BackupError::remote(Stage::Dump))
                    .and_then(|_| fetch(self.session, &compressed, &dest).map_err(BackupError::remote(Stage::Transfer)));
                clean_up(self.session, &[raw.as_str(), compressed.as_str()]);
                created?;
            }
        }

        log::info!(target: "backup::database", "{name}: saved remote database dump at {}", dest.display());
        Ok(Outcome::Created(dest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{Read, Write};
    use std::path::PathBuf;

    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    use crate::remote::mock::{MockTransport, SCRATCH_DIR};
    use crate::sites::{DatabaseConfig, SiteName};

    fn shop(password: Option<&str>) -> Site {
        Site::new(
            SiteName::parse("shop.example.com").unwrap(),
            PathBuf::from("/var/www/shop"),
            Some(DatabaseConfig {
                host: "localhost".to_string(),
                name: "shop".to_string(),
                user: "shop".to_string(),
                password: password.map(str::to_string),
            }),
        )
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn gunzip(path: &Path) -> String {
        let mut contents = String::new();
        GzDecoder::new(fs::File::open(path).unwrap())
            .read_to_string(&mut contents)
            .unwrap();
        contents
    }

    fn session(transport: MockTransport) -> Session<MockTransport> {
        Session::with_transport(transport, 4, "~/.site-backup-tmp").unwrap()
    }

    fn created(outcome: Outcome) -> PathBuf {
        match outcome {
            Outcome::Created(path) => path,
            Outcome::Unchanged => panic!("artifact must be created"),
        }
    }

    #[test]
    fn streamed_archive_lands_in_the_site_dir() {
        let dir = TempDir::new().unwrap();
        let layout = BackupLayout::new(dir.path());
        let transport = MockTransport::unlimited();
        transport.respond("find . -type f", 0, "4\n", "");
        transport.respond_bytes("tar -czf - ", 0, gzip(b"tarball"), "");
        let session = session(transport);

        let backend = RemoteFiles::new(&session, layout.clone(), "node_modules", TransferMethod::Stream);
        let site = shop(None);
        let path = created(backend.backup(&site).unwrap());

        assert_eq!(path.parent().unwrap(), layout.site_dir(site.name()));
        assert_eq!(gunzip(&path), "tarball");
        let commands = session.pool().transport().commands();
        assert!(commands.contains(&"tar -czf - --exclude=node_modules -C /var/www/shop .".to_string()), "{commands:?}");
    }

    #[test]
    fn unchanged_remote_site_is_skipped() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::unlimited();
        transport.respond("find . -type f", 0, "0\n", "");
        let session = session(transport);

        let backend = RemoteFiles::new(&session, BackupLayout::new(dir.path()), "node_modules", TransferMethod::Stream);
        assert_eq!(backend.backup(&shop(None)).unwrap(), Outcome::Unchanged);
        assert!(!session.pool().transport().commands().iter().any(|c| c.starts_with("tar ")));
    }

    #[test]
    fn scp_archive_is_cleaned_up_remotely() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::unlimited();
        transport.respond("find . -type f", 0, "1\n", "");
        transport.serve_file(".tar.gz", b"archive".to_vec());
        let session = session(transport);

        let backend = RemoteFiles::new(&session, BackupLayout::new(dir.path()), "node_modules", TransferMethod::Scp);
        let path = created(backend.backup(&shop(None)).unwrap());
        assert_eq!(fs::read(&path).unwrap(), b"archive");

        let commands = session.pool().transport().commands();
        let remote = format!("{SCRATCH_DIR}/shop.example.com_{}", path.file_name().unwrap().to_string_lossy());
        assert!(commands.contains(&format!("tar -czf {remote} --exclude=node_modules -C /var/www/shop .")), "{commands:?}");
        assert_eq!(commands.last().unwrap(), &format!("rm -f {remote}"));
    }

    #[test]
    fn failed_transfer_is_tagged_and_cleaned_up() {
        let dir = TempDir::new().unwrap();
        let layout = BackupLayout::new(dir.path());
        let transport = MockTransport::unlimited();
        transport.respond("find . -type f", 0, "1\n", "");
        let session = session(transport);

        let site = shop(None);
        let backend = RemoteFiles::new(&session, layout.clone(), "node_modules", TransferMethod::Scp);
        let err = backend.backup(&site).unwrap_err();

        assert_eq!(err.stage(), Stage::Transfer);
        assert!(session.pool().transport().commands().last().unwrap().starts_with("rm -f "));
        assert!(artifact::list(&layout.site_dir(site.name()), ArtifactKind::Files).unwrap().is_empty());
        assert_eq!(fs::read_dir(layout.site_dir(site.name())).unwrap().count(), 0);
    }

    #[test]
    fn streamed_dump_is_compressed_locally() {
        let dir = TempDir::new().unwrap();
        let layout = BackupLayout::new(dir.path());
        let transport = MockTransport::unlimited();
        transport.respond("mysqldump", 0, "CREATE TABLE orders (id int);\n", "");
        let session = session(transport);

        let site = shop(Some("pa$$word"));
        let backend = RemoteDatabase::new(&session, layout.clone(), Compression::default(), TransferMethod::Stream);
        let path = created(backend.backup(&site).unwrap());

        assert_eq!(path.parent().unwrap(), layout.artifact_dir(site.name(), ArtifactKind::Database));
        assert_eq!(gunzip(&path), "CREATE TABLE orders (id int);\n");
        let command = session.pool().transport().commands().pop().unwrap();
        assert_eq!(
            command,
            "MYSQL_PWD='pa$$word' mysqldump -h localhost -u shop --quick --lock-tables=false shop"
        );
    }

    #[test]
    fn failed_dump_keeps_diagnostics_without_the_password() {
        let dir = TempDir::new().unwrap();
        let layout = BackupLayout::new(dir.path());
        let transport = MockTransport::unlimited();
        transport.respond("mysqldump", 2, "", "mysqldump: Got error: 1045: Access denied\n");
        let session = session(transport);

        let site = shop(Some("hunter2"));
        let backend = RemoteDatabase::new(&session, layout.clone(), Compression::default(), TransferMethod::Stream);
        let err = backend.backup(&site).unwrap_err();

        assert_eq!(err.stage(), Stage::Dump);
        let message = err.to_string();
        assert!(message.contains("Access denied"), "{message}");
        assert!(!message.contains("hunter2"), "{message}");
        let dump_dir = layout.artifact_dir(site.name(), ArtifactKind::Database);
        assert_eq!(fs::read_dir(dump_dir).unwrap().count(), 0);
    }

    #[test]
    fn scp_dump_is_gzipped_remotely() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::unlimited();
        transport.serve_file(".sql.gz", gzip(b"-- dump"));
        let session = session(transport);

        let backend = RemoteDatabase::new(&session, BackupLayout::new(dir.path()), Compression::default(), TransferMethod::Scp);
        let path = created(backend.backup(&shop(None)).unwrap());
        assert_eq!(gunzip(&path), "-- dump");

        let commands = session.pool().transport().commands();
        let dump = commands.iter().find(|c| c.contains("mysqldump")).unwrap();
        assert!(dump.starts_with("umask 077; mysqldump "), "{dump}");
        assert!(dump.ends_with(".sql"), "{dump}");
        assert!(dump.contains(" && gzip -f "), "{dump}");
        assert!(commands.last().unwrap().ends_with(".sql.gz"));
    }
}
