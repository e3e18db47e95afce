use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use ssh2::{CheckResult, KnownHostFileKind};

use super::scp::ScpTarget;
use super::{AuthMethod, ExitInfo, HostKeyPolicy, RemoteChannel, RemoteConfig, RemoteError, Transport};

/// An authenticated ssh connection.
pub struct SshTransport {
    session: ssh2::Session,
    scp: ScpTarget,
}

impl SshTransport {
    /// Connects to the configured host, verifies its key and authenticates.
    pub fn connect(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let address = config.address();
        let connect_error = |source| RemoteError::Connect {
            address: address.clone(),
            source,
        };

        let socket = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(connect_error)?
            .next()
            .ok_or_else(|| connect_error(io::Error::new(io::ErrorKind::NotFound, "host name resolved to no address")))?;
        let tcp = TcpStream::connect_timeout(&socket, config.connect_timeout).map_err(connect_error)?;

        let handshake_error = |source| RemoteError::Handshake {
            address: address.clone(),
            source,
        };
        let mut session = ssh2::Session::new().map_err(handshake_error)?;
        session.set_tcp_stream(tcp);
        session.set_timeout(timeout_millis(config.connect_timeout));
        session.handshake().map_err(handshake_error)?;

        verify_host_key(&session, config)?;
        let auth = authenticate(&session, config)?;
        session.set_timeout(timeout_millis(config.command_timeout));

        log::info!(target: "backup::remote", "Connected to {}@{address} using {auth}", config.user);
        Ok(Self {
            session,
            scp: ScpTarget::new(config, auth),
        })
    }
}

fn timeout_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

fn verify_host_key(session: &ssh2::Session, config: &RemoteConfig) -> Result<(), RemoteError> {
    let rejected = |reason: String| RemoteError::HostKey {
        address: config.address(),
        reason,
    };

    let known_hosts_file = match &config.host_key_policy {
        HostKeyPolicy::AcceptAny => {
            log::debug!(target: "backup::remote", "Accepting any host key of {}", config.host);
            return Ok(());
        }
        HostKeyPolicy::KnownHosts(file) => file,
    };

    let (key, _) = session
        .host_key()
        .ok_or_else(|| rejected("the server presented no host key".to_string()))?;
    let mut known_hosts = session
        .known_hosts()
        .map_err(|e| rejected(e.to_string()))?;
    known_hosts
        .read_file(known_hosts_file, KnownHostFileKind::OpenSSH)
        .map_err(|e| rejected(format!("reading {} failed: {e}", known_hosts_file.display())))?;

    match known_hosts.check_port(&config.host, config.port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::Mismatch => Err(rejected(format!(
            "the key differs from the one in {}",
            known_hosts_file.display()
        ))),
        CheckResult::NotFound => Err(rejected(format!(
            "the host is not listed in {}",
            known_hosts_file.display()
        ))),
        CheckResult::Failure => Err(rejected("checking the key failed".to_string())),
    }
}

/// Tries the key first and falls back to the password.
fn authenticate(session: &ssh2::Session, config: &RemoteConfig) -> Result<AuthMethod, RemoteError> {
    let user = config.user.as_str();
    let mut failures = Vec::new();

    if let Some(key_path) = &config.credentials.key_path {
        match session.userauth_pubkey_file(user, None, key_path, None) {
            Ok(()) if session.authenticated() => return Ok(AuthMethod::Key(key_path.clone())),
            Ok(()) => failures.push(format!("key {} was not accepted", key_path.display())),
            Err(e) => {
                log::debug!(target: "backup::remote", "Key authentication failed, trying the next method: {e}");
                failures.push(format!("key {}: {e}", key_path.display()));
            }
        }
    }

    if let Some(password) = &config.credentials.password {
        match session.userauth_password(user, password) {
            Ok(()) if session.authenticated() => return Ok(AuthMethod::Password(password.clone())),
            Ok(()) => failures.push("password was not accepted".to_string()),
            Err(e) => failures.push(format!("password: {e}")),
        }
    }

    if failures.is_empty() {
        failures.push("neither a key nor a password is configured".to_string());
    }
    Err(RemoteError::Auth {
        user: user.to_string(),
        reason: failures.join("; "),
    })
}

impl Transport for SshTransport {
    type Channel = SshChannel;

    fn open_channel(&self) -> Result<SshChannel, RemoteError> {
        let channel = self.session.channel_session().map_err(RemoteError::Channel)?;
        Ok(SshChannel { channel })
    }

    fn copy_out(&self, remote_path: &str, local: &Path) -> Result<(), RemoteError> {
        self.scp.copy(remote_path, local)
    }

    fn disconnect(&self) {
        if let Err(e) = self.session.disconnect(None, "backup finished", None) {
            log::debug!(target: "backup::remote", "Disconnecting failed: {e}");
        }
    }
}

/// Bytes of standard error relayed per command, the tail is kept.
const STDERR_LIMIT: usize = 64 * 1024;

/// Wraps `command` so its standard error is relayed only after it exited,
/// capped to the last [STDERR_LIMIT] bytes.
///
/// Standard error shares the channel window with standard output; while
/// standard output is read, unread standard error would stall the command
/// once the window is full.
fn with_deferred_stderr(command: &str) -> String {
    format!(
        "err=$(mktemp \"${{TMPDIR:-/tmp}}/site-backup.XXXXXX\") || exit 125\n\
         ( {command}\n) 2>\"$err\"\n\
         rc=$?\n\
         tail -c {STDERR_LIMIT} \"$err\" >&2\n\
         rm -f \"$err\"\n\
         exit $rc\n"
    )
}

/// An ssh `session` channel.
pub struct SshChannel {
    channel: ssh2::Channel,
}

impl RemoteChannel for SshChannel {
    fn execute(mut self, command: &str, stdout: &mut dyn Write) -> io::Result<ExitInfo> {
        self.channel.exec(&with_deferred_stderr(command))?;
        io::copy(&mut self.channel, stdout)?;

        let mut stderr = Vec::new();
        self.channel.stderr().read_to_end(&mut stderr)?;
        self.channel.wait_close()?;
        let code = self.channel.exit_status()?;

        Ok(ExitInfo {
            code,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    fn close(mut self) {
        if let Err(e) = self.channel.close().and_then(|()| self.channel.wait_close()) {
            log::trace!(target: "backup::remote", "Closing channel failed: {e}");
        }
    }
}
