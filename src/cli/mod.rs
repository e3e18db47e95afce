use std::num::NonZeroUsize;
use std::path::PathBuf;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Parser, ValueEnum};
use derive_more::{Display, Error};
use log::LevelFilter;

use crate::backends::TransferMethod;
use crate::config::RemoteSettings;
use crate::remote::{Credentials, HostKeyPolicy, RemoteConfig};
use crate::util::retention::RetentionPolicy;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long)]
    pub verbose: Option<LevelFilter>,

    /// Engine configuration file, created with the defaults if missing.
    #[arg(long, short = 'c', default_value = "site-backup.toml")]
    pub config: PathBuf,

    /// Additionally print the run summary in this format on stdout.
    #[arg(long, value_enum, default_value_t = SummaryFormat::Text)]
    pub summary: SummaryFormat,

    /// Local Apache configuration file or directory. Overrides the config file.
    #[arg(long = "apache-config")]
    pub apache_config: Vec<PathBuf>,

    /// Folder for the backups of local sites. Overrides the config file.
    #[arg(long, env = "LOCAL_BACKUP_ROOT")]
    pub local_backup_root: Option<PathBuf>,

    /// Folder for the backups of remote sites. Overrides the config file.
    #[arg(long, env = "REMOTE_BACKUP_ROOT")]
    pub remote_backup_root: Option<PathBuf>,

    /// Don't back up the sites of this host.
    #[arg(long)]
    pub skip_local: bool,

    #[command(flatten)]
    pub retention: RetentionArgs,

    #[command(flatten)]
    pub remote: RemoteArgs,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum SummaryFormat {
    /// Only log the summary.
    #[default]
    Text,
    /// Print the summary as JSON.
    Json,
}

/// Retention maxima overriding the config file.
#[derive(Args, Debug, Default)]
pub struct RetentionArgs {
    /// File archives to keep per local site.
    #[arg(long, env = "LOCAL_MAX_FILE_BACKUPS")]
    pub local_max_file_backups: Option<NonZeroUsize>,

    /// Database dumps to keep per local site.
    #[arg(long, env = "LOCAL_MAX_DB_BACKUPS")]
    pub local_max_db_backups: Option<NonZeroUsize>,

    /// File archives to keep per remote site.
    #[arg(long, env = "REMOTE_MAX_FILE_BACKUPS")]
    pub remote_max_file_backups: Option<NonZeroUsize>,

    /// Database dumps to keep per remote site.
    #[arg(long, env = "REMOTE_MAX_DB_BACKUPS")]
    pub remote_max_db_backups: Option<NonZeroUsize>,
}

impl RetentionArgs {
    pub fn local(&self, configured: RetentionPolicy) -> RetentionPolicy {
        RetentionPolicy {
            max_file_backups: self.local_max_file_backups.unwrap_or(configured.max_file_backups),
            max_db_backups: self.local_max_db_backups.unwrap_or(configured.max_db_backups),
        }
    }

    pub fn remote(&self, configured: RetentionPolicy) -> RetentionPolicy {
        RetentionPolicy {
            max_file_backups: self.remote_max_file_backups.unwrap_or(configured.max_file_backups),
            max_db_backups: self.remote_max_db_backups.unwrap_or(configured.max_db_backups),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum HostKeyChecking {
    /// Accept every host key.
    #[default]
    AcceptAny,
    /// Require the host key to be listed in the known hosts file.
    KnownHosts,
}

#[derive(Debug, Display, Error)]
/// Errors of an incomplete remote connection setup.
pub enum RemoteArgsError {
    #[display("No remote host given (--ssh-host or SSH_HOST)")]
    MissingHost,
    #[display("No remote user given (--ssh-user or SSH_USER)")]
    MissingUser,
    #[display("Neither a key (SSH_KEY_PATH) nor a password (SSH_PASSWORD) given")]
    MissingCredentials,
    #[display("Known hosts checking needs a file (--known-hosts or SSH_KNOWN_HOSTS)")]
    MissingKnownHosts,
}

/// Connection to the remote host.
#[derive(Args, Debug, Default)]
pub struct RemoteArgs {
    /// Back up the sites of the remote host too.
    #[arg(
        long = "remote",
        env = "REMOTE_BACKUP_ENABLED",
        action = ArgAction::SetTrue,
        value_parser = BoolishValueParser::new()
    )]
    pub enabled: bool,

    #[arg(long = "ssh-host", env = "SSH_HOST")]
    pub host: Option<String>,

    #[arg(long = "ssh-port", env = "SSH_PORT", default_value_t = 22)]
    pub port: u16,

    #[arg(long = "ssh-user", env = "SSH_USER")]
    pub user: Option<String>,

    /// Private key, tried before the password.
    #[arg(long = "ssh-key", env = "SSH_KEY_PATH")]
    pub key_path: Option<PathBuf>,

    #[arg(long = "ssh-password", env = "SSH_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    #[arg(long, value_enum, env = "SSH_HOST_KEY_POLICY", default_value_t = HostKeyChecking::AcceptAny)]
    pub host_key_policy: HostKeyChecking,

    /// OpenSSH known hosts file used with `--host-key-policy known-hosts`.
    #[arg(long, env = "SSH_KNOWN_HOSTS")]
    pub known_hosts: Option<PathBuf>,

    /// How remote artifacts are brought to this host. Overrides the config file.
    #[arg(long, value_enum)]
    pub transfer: Option<TransferMethod>,
}

impl RemoteArgs {
    /// Combines the connection arguments with the remote section of the config file.
    pub fn remote_config(&self, settings: &RemoteSettings) -> Result<RemoteConfig, RemoteArgsError> {
        let host = self.host.clone().ok_or(RemoteArgsError::MissingHost)?;
        let user = self.user.clone().ok_or(RemoteArgsError::MissingUser)?;
        if self.key_path.is_none() && self.password.is_none() {
            return Err(RemoteArgsError::MissingCredentials);
        }

        let host_key_policy = match self.host_key_policy {
            HostKeyChecking::AcceptAny => HostKeyPolicy::AcceptAny,
            HostKeyChecking::KnownHosts => {
                HostKeyPolicy::KnownHosts(self.known_hosts.clone().ok_or(RemoteArgsError::MissingKnownHosts)?)
            }
        };

        Ok(RemoteConfig {
            host,
            port: self.port,
            user,
            credentials: Credentials {
                key_path: self.key_path.clone(),
                password: self.password.clone(),
            },
            host_key_policy,
            connect_timeout: settings.connect_timeout(),
            command_timeout: settings.command_timeout(),
            probe_ceiling: settings.probe_ceiling,
            scratch_dir: settings.scratch_dir.clone(),
        })
    }

    pub fn transfer(&self, settings: &RemoteSettings) -> TransferMethod {
        self.transfer.unwrap_or(settings.transfer)
    }
}
