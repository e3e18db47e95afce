use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::{ConfigFragment, ConfigSource, DiscoveryError, EnvLookup, ENV_CANDIDATES};

/// Default location of the Apache configuration on the local host.
pub const DEFAULT_APACHE_CONFIG: &str = "/etc/apache2/conf/httpd.conf";

/// Apache configuration on the local file system.
///
/// Every configured path is either a configuration file or a directory whose
/// `*.conf` files are read in name order.
#[derive(Clone, Debug)]
pub struct LocalConfig {
    paths: Vec<PathBuf>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self::new(vec![PathBuf::from(DEFAULT_APACHE_CONFIG)])
    }
}

impl LocalConfig {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    fn config_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for path in &self.paths {
            if !path.is_dir() {
                files.push(path.clone());
                continue;
            }

            match conf_files_in(path) {
                Ok(mut found) => files.append(&mut found),
                Err(e) => {
                    log::warn!(target: "backup::sites", "Listing {} failed: {e}", path.display())
                }
            }
        }
        files
    }
}

fn conf_files_in(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "conf") {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

impl ConfigSource for LocalConfig {
    fn fragments(&self) -> Result<Vec<ConfigFragment>, DiscoveryError> {
        let files = self.config_files();

        let mut fragments = Vec::with_capacity(files.len());
        for file in &files {
            match fs::read_to_string(file) {
                Ok(contents) => fragments.push(ConfigFragment {
                    origin: file.display().to_string(),
                    contents,
                }),
                Err(e) => {
                    log::warn!(target: "backup::sites", "Reading {} failed: {e}", file.display())
                }
            }
        }

        if fragments.is_empty() {
            let tried = self.paths.iter().map(|p| p.display().to_string()).collect();
            return Err(DiscoveryError::NoConfiguration(tried));
        }

        Ok(fragments)
    }

    fn env_file(&self, document_root: &Path) -> EnvLookup {
        let mut unreadable = None;

        for candidate in ENV_CANDIDATES {
            let path = document_root.join(candidate);
            if !path.is_file() {
                continue;
            }

            match fs::read_to_string(&path) {
                Ok(contents) => return EnvLookup::Found { path, contents },
                Err(e) => {
                    log::debug!(target: "backup::sites", "Skipping unreadable {}: {e}", path.display());
                    unreadable.get_or_insert((path, e.to_string()));
                }
            }
        }

        match unreadable {
            Some((path, reason)) => EnvLookup::Unreadable { path, reason },
            None => EnvLookup::NotFound,
        }
    }
}
