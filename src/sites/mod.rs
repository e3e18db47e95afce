//! Discovery of the sites to backup.
//!
//! Sites are found in the virtual-host configuration of an Apache HTTP server:
//! every `ServerName` followed by a `DocumentRoot` is one [Site]. The database
//! credentials of a site are read from the environment file of the
//! application (Laravel's `.env`) next to the document root.
//!
//! The configuration is accessed through a [ConfigSource], so the same parser
//! serves the local host ([LocalConfig]) and a remote host reached over ssh.

mod apache;
mod env;
mod local;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};

pub use apache::{parse_virtual_hosts, VirtualHost};
pub use env::{DatabaseConfig, EnvValues, ENV_CANDIDATES};
pub use local::{LocalConfig, DEFAULT_APACHE_CONFIG};

use crate::remote::RemoteError;

/// Name of a site, safe to be used as a single path component.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display, serde::Serialize)]
#[serde(transparent)]
pub struct SiteName(String);

/// Server name that can't be turned into a [SiteName].
#[derive(Debug, Display, Error)]
#[display("Server name can't be used as directory name: {_0:?}")]
pub struct InvalidSiteName(#[error(ignore)] String);

impl SiteName {
    /// Sanitizes a server name.
    ///
    /// Every character besides ASCII alphanumerics, `.`, `-` and `_` is
    /// replaced by `_`. Names that would be hidden or special path components
    /// are rejected.
    pub fn parse(raw: &str) -> Result<Self, InvalidSiteName> {
        let sanitized: String = raw
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        if sanitized.is_empty() || sanitized.starts_with('.') || sanitized.chars().all(|c| c == '_') {
            return Err(InvalidSiteName(raw.to_string()));
        }

        Ok(Self(sanitized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A web application deployment to backup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Site {
    name: SiteName,
    document_root: PathBuf,
    database: Option<DatabaseConfig>,
}

impl Site {
    pub fn new(name: SiteName, document_root: PathBuf, database: Option<DatabaseConfig>) -> Self {
        Self {
            name,
            document_root,
            database,
        }
    }

    pub fn name(&self) -> &SiteName {
        &self.name
    }

    pub fn document_root(&self) -> &Path {
        &self.document_root
    }

    pub fn database(&self) -> Option<&DatabaseConfig> {
        self.database.as_ref()
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.name, self.document_root.display())?;
        match &self.database {
            Some(db) => write!(f, " ({db})"),
            None => write!(f, " (no database configuration found)"),
        }
    }
}

/// One virtual-host configuration file.
#[derive(Clone, Debug)]
pub struct ConfigFragment {
    /// Where the fragment was read from.
    pub origin: String,
    pub contents: String,
}

/// Outcome of looking for the environment file of a site.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvLookup {
    Found { path: PathBuf, contents: String },
    /// None of the [ENV_CANDIDATES] exists.
    NotFound,
    /// An environment file exists but can't be read.
    Unreadable { path: PathBuf, reason: String },
}

/// Access to the web-server configuration and the files of its sites.
pub trait ConfigSource {
    /// Reads every virtual-host configuration fragment.
    fn fragments(&self) -> Result<Vec<ConfigFragment>, DiscoveryError>;

    /// Looks up the environment file belonging to `document_root`.
    ///
    /// The [ENV_CANDIDATES] are tried in order, the first readable file wins.
    fn env_file(&self, document_root: &Path) -> EnvLookup;
}

#[derive(Debug, Display, Error, From)]
/// Errors that prevent discovery of any site.
pub enum DiscoveryError {
    /// Not a single configuration fragment could be read.
    #[display("No virtual-host configuration could be read from: {}", _0.join(", "))]
    NoConfiguration(#[error(ignore)] Vec<String>),
    /// Reading a local configuration failed.
    #[display("Reading {} failed: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    /// Listing the remote configuration failed.
    #[from]
    #[display("Reading the remote configuration failed: {_0}")]
    Remote(RemoteError),
}

/// Discovers all sites exposed by `source`.
///
/// Sites are deduplicated by name and document root, keeping the order of
/// their first appearance. Sites with an unusable name or a relative
/// document root are skipped, as are sites whose sanitized name is already
/// taken by another document root: the name is their backup directory.
pub fn discover<S: ConfigSource + ?Sized>(source: &S) -> Result<Vec<Site>, DiscoveryError> {
    let fragments = source.fragments()?;

    let mut seen = HashSet::new();
    let mut taken: HashMap<SiteName, PathBuf> = HashMap::new();
    let mut sites = Vec::new();
    for fragment in &fragments {
        log::debug!(target: "backup::sites", "Parsing virtual hosts of {}", fragment.origin);
        for host in parse_virtual_hosts(&fragment.contents) {
            if !seen.insert((host.server_name.clone(), host.document_root.clone())) {
                continue;
            }

            let name = match SiteName::parse(&host.server_name) {
                Ok(name) => name,
                Err(e) => {
                    log::warn!(target: "backup::sites", "Skipping site in {}: {e}", fragment.origin);
                    continue;
                }
            };
            let document_root = PathBuf::from(&host.document_root);
            if document_root.is_relative() {
                log::warn!(target: "backup::sites", "Skipping {name}: document root is not absolute: {}", host.document_root);
                continue;
            }
            if let Some(owner) = taken.get(&name) {
                log::warn!(
                    target: "backup::sites",
                    "Skipping {name} at {}: the name is already used by {}",
                    document_root.display(),
                    owner.display()
                );
                continue;
            }
            taken.insert(name.clone(), document_root.clone());

            let database = match source.env_file(&document_root) {
                EnvLookup::Found { path, contents } => {
                    log::debug!(target: "backup::sites", "{name}: using environment file {}", path.display());
                    EnvValues::parse(&contents).database()
                }
                EnvLookup::NotFound => {
                    log::debug!(target: "backup::sites", "{name}: no environment file found");
                    None
                }
                EnvLookup::Unreadable { path, reason } => {
                    log::warn!(target: "backup::sites", "{name}: environment file {} is unreadable: {reason}", path.display());
                    None
                }
            };

            sites.push(Site::new(name, document_root, database));
        }
    }

    log::info!(target: "backup::sites", "Found {} unique site(s)", sites.len());
    Ok(sites)
}
