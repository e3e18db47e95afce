use std::path::Path;

use super::{RemoteCommand, Session, Transport};
use crate::sites::{ConfigFragment, ConfigSource, DiscoveryError, EnvLookup, ENV_CANDIDATES};
use crate::util::shell;

/// Directories searched for `*.conf` files on the remote host.
pub const DEFAULT_REMOTE_CONFIG_DIRS: [&str; 2] = ["/etc/apache2", "/etc/httpd"];

/// Exit code of the env probe if a candidate exists but can't be read.
const ENV_UNREADABLE: i32 = 2;
/// Exit code of the env probe if no candidate exists.
const ENV_MISSING: i32 = 1;

/// Apache configuration on the remote host, read through a [Session].
pub struct RemoteConfigSource<'s, T: Transport> {
    session: &'s Session<T>,
    config_dirs: Vec<String>,
}

impl<'s, T: Transport> RemoteConfigSource<'s, T> {
    pub fn new(session: &'s Session<T>, config_dirs: Vec<String>) -> Self {
        Self {
            session,
            config_dirs,
        }
    }

    fn config_files(&self) -> Result<Vec<String>, DiscoveryError> {
        let dirs: Vec<String> = self.config_dirs.iter().map(|d| shell::quote_path(d)).collect();
        let command = RemoteCommand::new(format!(
            "find {} -type f -name '*.conf' 2>/dev/null | sort",
            dirs.join(" ")
        ));
        let output = self.session.run(&command)?;

        let mut files: Vec<String> = Vec::new();
        for file in output.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if !files.iter().any(|f| f == file) {
                files.push(file.to_string());
            }
        }
        Ok(files)
    }
}

impl<T: Transport> ConfigSource for RemoteConfigSource<'_, T> {
    fn fragments(&self) -> Result<Vec<ConfigFragment>, DiscoveryError> {
        let files = self.config_files()?;
        log::debug!(target: "backup::sites", "Found {} remote configuration file(s)", files.len());

        let mut fragments = Vec::with_capacity(files.len());
        for file in files {
            let command = RemoteCommand::new(format!("cat {}", shell::quote(&file)));
            match self.session.run(&command) {
                Ok(output) => fragments.push(ConfigFragment {
                    origin: format!("remote:{file}"),
                    contents: output.stdout,
                }),
                Err(e) => log::warn!(target: "backup::sites", "Reading remote {file} failed: {e}"),
            }
        }

        if fragments.is_empty() {
            return Err(DiscoveryError::NoConfiguration(self.config_dirs.clone()));
        }
        Ok(fragments)
    }

    fn env_file(&self, document_root: &Path) -> EnvLookup {
        let command = RemoteCommand::new(env_probe_script(document_root));
        let output = match self.session.execute(&command) {
            Ok(output) => output,
            Err(e) => {
                return EnvLookup::Unreadable {
                    path: document_root.to_path_buf(),
                    reason: e.to_string(),
                }
            }
        };

        match output.code {
            0 => {
                let (path, contents) = output.stdout.split_once('\n').unwrap_or((output.stdout.as_str(), ""));
                EnvLookup::Found {
                    path: document_root.join(path),
                    contents: contents.to_string(),
                }
            }
            ENV_MISSING => EnvLookup::NotFound,
            ENV_UNREADABLE => EnvLookup::Unreadable {
                path: document_root.join(output.stdout.trim()),
                reason: "permission denied".to_string(),
            },
            code => EnvLookup::Unreadable {
                path: document_root.to_path_buf(),
                reason: format!("probe exited with code {code}: {}", output.stderr.trim_end()),
            },
        }
    }
}

/// Shell script printing the first readable env candidate's relative path
/// on the first line, followed by its contents.
fn env_probe_script(document_root: &Path) -> String {
    let root = shell::quote(&document_root.to_string_lossy());
    let candidates: Vec<String> = ENV_CANDIDATES.iter().map(|c| shell::quote(c)).collect();
    format!(
        "cd {root} 2>/dev/null || exit {ENV_MISSING}; unreadable=; \
         for f in {}; do \
         if [ -f \"$f\" ]; then \
         if [ -r \"$f\" ]; then printf '%s\\n' \"$f\"; cat \"$f\"; exit 0; fi; \
         [ -n \"$unreadable\" ] || unreadable=\"$f\"; \
         fi; \
         done; \
         if [ -n \"$unreadable\" ]; then printf '%s\\n' \"$unreadable\"; exit {ENV_UNREADABLE}; fi; \
         exit {ENV_MISSING}",
        candidates.join(" ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::remote::mock::MockTransport;
    use crate::sites::discover;

    fn session(transport: MockTransport) -> Session<MockTransport> {
        Session::with_transport(transport, 4, "~/.site-backup-tmp").unwrap()
    }

    #[test]
    fn sites_are_discovered_through_the_session() {
        let transport = MockTransport::unlimited();
        transport.respond("find ", 0, "/etc/apache2/sites-enabled/a.conf\n/etc/apache2/sites-enabled/b.conf\n", "");
        transport.respond(
            "cat /etc/apache2/sites-enabled/a.conf",
            0,
            "<VirtualHost *:80>\nServerName app.example.com\nDocumentRoot /srv/app\n</VirtualHost>\n",
            "",
        );
        transport.respond("cat /etc/apache2/sites-enabled/b.conf", 1, "", "cat: Permission denied\n");
        transport.respond(
            "cd /srv/app ",
            0,
            "../.env\nDB_DATABASE=app\nDB_USERNAME=app\nDB_PASSWORD=pw\n",
            "",
        );

        let session = session(transport);
        let source = RemoteConfigSource::new(&session, vec!["/etc/apache2".to_string()]);
        let sites = discover(&source).unwrap();

        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].name().as_str(), "app.example.com");
        let db = sites[0].database().unwrap();
        assert_eq!(db.name, "app");
        assert_eq!(db.password.as_deref(), Some("pw"));
    }

    #[test]
    fn no_readable_configuration_is_an_error() {
        let transport = MockTransport::unlimited();
        transport.respond("find ", 0, "", "");
        let session = session(transport);
        let source = RemoteConfigSource::new(&session, vec!["/etc/httpd".to_string()]);

        assert!(matches!(source.fragments(), Err(DiscoveryError::NoConfiguration(_))));
    }

    #[test]
    fn env_probe_outcomes() {
        let transport = MockTransport::unlimited();
        transport.respond("cd /srv/missing ", ENV_MISSING, "", "");
        transport.respond("cd /srv/locked ", ENV_UNREADABLE, ".env\n", "");
        let session = session(transport);
        let source = RemoteConfigSource::new(&session, Vec::new());

        assert_eq!(source.env_file(Path::new("/srv/missing")), EnvLookup::NotFound);
        assert!(matches!(
            source.env_file(Path::new("/srv/locked")),
            EnvLookup::Unreadable { path, .. } if path == Path::new("/srv/locked/.env")
        ));
    }

    #[test]
    fn probe_script_tries_candidates_in_order() {
        let script = env_probe_script(Path::new("/srv/my app"));
        assert!(script.starts_with("cd '/srv/my app' 2>/dev/null || exit 1;"));
        let env = script.find(" .env ").unwrap();
        let parent = script.find(" ../.env ").unwrap();
        let laravel = script.find(" laravel/.env;").unwrap();
        assert!(env < parent && parent < laravel);
    }
}
