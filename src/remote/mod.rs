//! Command execution and file transfer on a remote host.
//!
//! A [Session] owns one authenticated connection and a [SessionPool] of
//! command channels on it. Channels are used once: executing a command
//! consumes the channel.
//!
//! The connection itself is abstracted by the [Transport] trait. The
//! production implementation is [SshTransport] on top of `ssh2`.

mod discovery;
mod pool;
mod scp;
mod ssh;

#[cfg(test)]
pub(crate) mod mock;

use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use derive_more::{Display, Error};

pub use discovery::{RemoteConfigSource, DEFAULT_REMOTE_CONFIG_DIRS};
pub use pool::{SessionPool, DEFAULT_PROBE_CEILING};
pub use ssh::{SshChannel, SshTransport};

use crate::util::shell;

/// Remote directory for temporary artifacts.
pub const DEFAULT_SCRATCH_DIR: &str = "~/.site-backup-tmp";

#[derive(Debug, Display, Error)]
/// Errors of the remote connection and of commands executed on it.
pub enum RemoteError {
    /// The remote host isn't reachable.
    #[display("Connecting to {address} failed: {source}")]
    Connect { address: String, source: io::Error },
    /// The ssh protocol handshake failed.
    #[display("SSH handshake with {address} failed: {source}")]
    Handshake { address: String, source: ssh2::Error },
    /// The host key didn't pass the configured [HostKeyPolicy].
    #[display("Host key of {address} rejected: {reason}")]
    HostKey { address: String, reason: String },
    /// Neither of the configured credentials was accepted.
    #[display("Authentication as {user} failed: {reason}")]
    Auth { user: String, reason: String },
    /// A command channel couldn't be opened.
    #[display("Opening a channel failed: {_0}")]
    Channel(ssh2::Error),
    /// The remote endpoint doesn't accept a single channel.
    #[display("Remote endpoint refused every channel")]
    NoCapacity,
    /// Executing a command failed on transport level, including timeouts.
    #[display("Remote command `{command}` failed: {source}")]
    Io { command: String, source: io::Error },
    /// A command exited unsuccessfully.
    #[display("Remote command `{command}` exited with code {code}: {}", stderr.trim_end())]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },
    /// A command succeeded, but its output isn't what was expected.
    #[display("Remote command `{command}` returned unexpected output: {output:?}")]
    UnexpectedOutput { command: String, output: String },
    /// Copying a remote file to the local host failed.
    #[display("Copying {remote_path} from the remote host failed: {reason}")]
    Transfer { remote_path: String, reason: String },
    /// The session was already closed.
    #[display("Remote session is closed")]
    Closed,
}

/// How the identity of the remote host is verified.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Every host key is accepted.
    #[default]
    AcceptAny,
    /// The host key must match an entry of an OpenSSH `known_hosts` file.
    KnownHosts(PathBuf),
}

impl fmt::Display for HostKeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AcceptAny => f.write_str("accept any host key"),
            Self::KnownHosts(file) => write!(f, "known hosts of {}", file.display()),
        }
    }
}

/// Credentials offered to the remote host, the key is tried first.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub key_path: Option<PathBuf>,
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("key_path", &self.key_path)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// The credential the remote host accepted.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    Key(PathBuf),
    Password(String),
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(path) => f.debug_tuple("Key").field(path).finish(),
            Self::Password(_) => f.write_str("Password(***)"),
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(path) => write!(f, "key {}", path.display()),
            Self::Password(_) => f.write_str("password"),
        }
    }
}

/// Everything needed to open a [Session] to a remote host.
#[derive(Clone, Debug)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub credentials: Credentials,
    pub host_key_policy: HostKeyPolicy,
    /// Bound of connect, handshake and authentication.
    pub connect_timeout: Duration,
    /// Bound of every blocking read or write of a command.
    pub command_timeout: Duration,
    /// Maximum number of channels opened while probing the pool capacity.
    pub probe_ceiling: usize,
    /// Directory on the remote host for temporary artifacts.
    pub scratch_dir: String,
}

impl RemoteConfig {
    /// `host:port`, with IPv6 addresses in brackets.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Exit code and standard error of an executed command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: i32,
    pub stderr: String,
}

/// A connection able to open command channels.
pub trait Transport {
    type Channel: RemoteChannel;

    /// Opens a new command channel.
    fn open_channel(&self) -> Result<Self::Channel, RemoteError>;

    /// Copies the remote file `remote_path` to the existing local file `local`.
    fn copy_out(&self, remote_path: &str, local: &Path) -> Result<(), RemoteError>;

    /// Terminates the connection.
    fn disconnect(&self);
}

/// A channel executing exactly one command.
pub trait RemoteChannel {
    /// Runs `command` in the remote shell and copies its standard output into
    /// `stdout` until the command finished.
    fn execute(self, command: &str, stdout: &mut dyn Write) -> io::Result<ExitInfo>;

    /// Closes an unused channel.
    fn close(self);
}

/// A shell command line to run remotely.
///
/// Secrets embedded into the command are replaced by `***` in its
/// [Display](fmt::Display) form, which is used in logs and errors.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    shell: String,
    display: String,
}

impl RemoteCommand {
    pub fn new(shell: impl Into<String>) -> Self {
        let shell = shell.into();
        Self {
            display: shell.clone(),
            shell,
        }
    }

    /// Sets the environment variable `name` to the secret `value` for `command`.
    pub fn with_secret_env(name: &str, value: &str, command: &str) -> Self {
        Self {
            shell: format!("{name}={} {command}", shell::quote(value)),
            display: format!("{name}=*** {command}"),
        }
    }

    /// Prepends `prefix` to the command line.
    pub fn prefixed(self, prefix: &str) -> Self {
        Self {
            shell: format!("{prefix}{}", self.shell),
            display: format!("{prefix}{}", self.display),
        }
    }

    /// Appends `suffix` to the command line.
    pub fn followed_by(self, suffix: &str) -> Self {
        Self {
            shell: format!("{}{suffix}", self.shell),
            display: format!("{}{suffix}", self.display),
        }
    }

    /// The command line as sent to the remote shell.
    pub fn shell(&self) -> &str {
        &self.shell
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

impl fmt::Debug for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RemoteCommand").field(&self.display).finish()
    }
}

/// Captured result of a command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// An open connection to the remote host with its pool of channels.
pub struct Session<T: Transport> {
    pool: SessionPool<T>,
    scratch_dir: String,
    closed: AtomicBool,
}

impl Session<SshTransport> {
    /// Connects, authenticates and prepares the remote scratch directory.
    ///
    /// Failures are not retried.
    pub fn open(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let transport = SshTransport::connect(config)?;
        Self::with_transport(transport, config.probe_ceiling, &config.scratch_dir)
    }
}

impl<T: Transport> Session<T> {
    /// Probes the channel capacity of `transport` and creates `scratch_dir`.
    pub fn with_transport(transport: T, probe_ceiling: usize, scratch_dir: &str) -> Result<Self, RemoteError> {
        let pool = SessionPool::probe(transport, probe_ceiling);
        let mut session = Self {
            pool,
            scratch_dir: String::new(),
            closed: AtomicBool::new(false),
        };
        if session.pool.capacity() == 0 {
            session.close();
            return Err(RemoteError::NoCapacity);
        }

        let dir = shell::quote_path(scratch_dir);
        let command = RemoteCommand::new(format!("umask 077 && mkdir -p {dir} && cd {dir} && pwd"));
        let output = session.run(&command)?;
        let resolved = output.stdout.trim();
        if !resolved.starts_with('/') {
            return Err(RemoteError::UnexpectedOutput {
                command: command.to_string(),
                output: output.stdout,
            });
        }
        session.scratch_dir = resolved.to_string();

        log::debug!(target: "backup::remote", "Using remote scratch directory {}", session.scratch_dir);
        session.remove_stale_artifacts();
        Ok(session)
    }

    /// Removes temporary artifacts an interrupted earlier run left in the
    /// scratch directory. Failures are only logged.
    fn remove_stale_artifacts(&self) {
        let dir = shell::quote(&self.scratch_dir);
        let command = RemoteCommand::new(format!(
            "rm -f -- {dir}/*_files_*.tar.gz {dir}/*_db_*.sql {dir}/*_db_*.sql.gz"
        ));
        if let Err(e) = self.run(&command) {
            log::warn!(target: "backup::remote", "Removing stale temporary artifacts failed: {e}");
        }
    }

    pub fn pool(&self) -> &SessionPool<T> {
        &self.pool
    }

    /// Absolute path of the remote scratch directory.
    pub fn scratch_dir(&self) -> &str {
        &self.scratch_dir
    }

    /// Absolute remote path of `file_name` in the scratch directory.
    pub fn scratch_path(&self, file_name: &str) -> String {
        format!("{}/{file_name}", self.scratch_dir)
    }

    /// Runs `command` and captures its output, whatever its exit code.
    pub fn execute(&self, command: &RemoteCommand) -> Result<CommandOutput, RemoteError> {
        let mut stdout = Vec::new();
        let exit = self.exec_into(command, &mut stdout)?;
        Ok(CommandOutput {
            code: exit.code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: exit.stderr,
        })
    }

    /// Runs `command` and captures its output, failing on a non-zero exit code.
    pub fn run(&self, command: &RemoteCommand) -> Result<CommandOutput, RemoteError> {
        let output = self.execute(command)?;
        if output.code != 0 {
            return Err(RemoteError::CommandFailed {
                command: command.to_string(),
                code: output.code,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    /// Runs `command` and streams its standard output into `writer`.
    ///
    /// Standard error is captured separately and returned.
    pub fn run_streaming(&self, command: &RemoteCommand, writer: &mut dyn Write) -> Result<String, RemoteError> {
        let exit = self.exec_into(command, writer)?;
        if exit.code != 0 {
            return Err(RemoteError::CommandFailed {
                command: command.to_string(),
                code: exit.code,
                stderr: exit.stderr,
            });
        }
        Ok(exit.stderr)
    }

    /// Copies the remote file `remote_path` to the local file `local`.
    pub fn transfer_out(&self, remote_path: &str, local: &Path) -> Result<(), RemoteError> {
        self.ensure_open()?;
        self.pool.transport().copy_out(remote_path, local)
    }

    /// Removes a remote file, a missing file is no error.
    pub fn remove(&self, remote_path: &str) -> Result<(), RemoteError> {
        self.run(&RemoteCommand::new(format!("rm -f {}", shell::quote(remote_path))))
            .map(|_| ())
    }

    /// Closes all pooled channels and the connection. Closing twice is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let drained = self.pool.drain();
        self.pool.transport().disconnect();
        log::debug!(target: "backup::remote", "Closed remote session with {drained} idle channel(s)");
    }

    fn ensure_open(&self) -> Result<(), RemoteError> {
        if self.closed.load(Ordering::Acquire) {
            Err(RemoteError::Closed)
        } else {
            Ok(())
        }
    }

    fn exec_into(&self, command: &RemoteCommand, writer: &mut dyn Write) -> Result<ExitInfo, RemoteError> {
        self.ensure_open()?;
        let channel = self.pool.acquire()?;

        log::trace!(target: "backup::remote", "Executing `{command}`");
        let exit = channel
            .execute(command.shell(), writer)
            .map_err(|source| RemoteError::Io {
                command: command.to_string(),
                source,
            })?;

        if exit.code == 0 && !exit.stderr.trim().is_empty() {
            log::debug!(target: "backup::remote", "`{command}` reported: {}", exit.stderr.trim_end());
        }
        Ok(exit)
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        self.close();
    }
}
