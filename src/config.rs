//! The engine configuration file.
//!
//! Everything that rarely changes between runs lives in a TOML file; the
//! connection settings and retention maxima come from the command line (or
//! its environment variables), see [crate::cli].
//!
//! A missing file is created with the default configuration, so the file
//! doubles as documentation of all available settings.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_more::{Display, Error};

use crate::archive::{ArchiveEngine, DEFAULT_EXCLUDED_DIR};
use crate::backends::{DatabaseDumper, TransferMethod, DEFAULT_DUMP_PROGRAM};
use crate::remote::{DEFAULT_PROBE_CEILING, DEFAULT_REMOTE_CONFIG_DIRS, DEFAULT_SCRATCH_DIR};
use crate::sites::DEFAULT_APACHE_CONFIG;
use crate::util::retention::RetentionPolicy;

const DEFAULT_COMPRESSION_LEVEL: u32 = 6;
const DEFAULT_LOCAL_BACKUP_ROOT: &str = "/var/backups/sites";
const DEFAULT_REMOTE_BACKUP_ROOT: &str = "/var/backups/sites-remote";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Display, Error)]
/// Errors on loading the configuration file.
pub enum ConfigError {
    /// The file exists but couldn't be read.
    #[display("Reading {} failed: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    /// The file isn't valid TOML or has unknown values.
    #[display("Parsing {} failed: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
/// Configuration of a whole run.
pub struct EngineConfig {
    pub archive: ArchiveConfig,
    pub database: DumpConfig,
    /// Backup of the sites of this host.
    pub local: LocalSettings,
    /// Backup of the sites of a host reached over SSH.
    pub remote: RemoteSettings,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
/// How file archives are created.
pub struct ArchiveConfig {
    /// Directory name left out of every archive, at any depth.
    pub excluded_dir: String,
    /// Gzip compression level of archives and dumps, `0..=9`.
    pub compression_level: u32,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            excluded_dir: DEFAULT_EXCLUDED_DIR.to_string(),
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl ArchiveConfig {
    pub fn engine(&self) -> ArchiveEngine {
        ArchiveEngine::new(self.excluded_dir.clone()).with_compression_level(self.compression_level)
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
/// How databases are dumped.
pub struct DumpConfig {
    /// Dump program run for local sites.
    pub program: PathBuf,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_DUMP_PROGRAM),
        }
    }
}

impl DumpConfig {
    pub fn dumper(&self, compression_level: u32) -> DatabaseDumper {
        DatabaseDumper::new(self.program.clone()).with_compression_level(compression_level)
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LocalSettings {
    /// Apache configuration files or directories of `*.conf` files.
    pub config_paths: Vec<PathBuf>,
    pub backup_root: PathBuf,
    pub retention: RetentionPolicy,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            config_paths: vec![PathBuf::from(DEFAULT_APACHE_CONFIG)],
            backup_root: PathBuf::from(DEFAULT_LOCAL_BACKUP_ROOT),
            retention: RetentionPolicy::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    /// Local directory the remote artifacts are stored in.
    pub backup_root: PathBuf,
    pub retention: RetentionPolicy,
    /// Directories on the remote host searched for `*.conf` files.
    pub config_dirs: Vec<String>,
    /// Directory on the remote host for temporary artifacts.
    pub scratch_dir: String,
    /// Upper bound of channels opened while probing the pool capacity.
    pub probe_ceiling: usize,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub transfer: TransferMethod,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            backup_root: PathBuf::from(DEFAULT_REMOTE_BACKUP_ROOT),
            retention: RetentionPolicy::default(),
            config_dirs: DEFAULT_REMOTE_CONFIG_DIRS.iter().map(|dir| dir.to_string()).collect(),
            scratch_dir: DEFAULT_SCRATCH_DIR.to_string(),
            probe_ceiling: DEFAULT_PROBE_CEILING,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            transfer: TransferMethod::default(),
        }
    }
}

impl RemoteSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl EngineConfig {
    /// Reads the configuration at `path`.
    ///
    /// If there is no file at `path` yet, the default configuration is
    /// written to it and returned. Failing to write it is only logged.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!(
                    target: "backup::config",
                    "Writing default config to {} because it doesn't exist yet",
                    path.display()
                );
                let config = Self::default();
                if let Err(e) = config.write(path) {
                    log::warn!(target: "backup::config", "Writing default config to {} failed: {e}", path.display());
                }
                Ok(config)
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn write(&self, path: &Path) -> io::Result<()> {
        let contents = toml::to_string_pretty(self).map_err(io::Error::other)?;
        fs::write(path, contents)
    }
}
