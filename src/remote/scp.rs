//! File transfer from the remote host with the `scp` program.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use super::{AuthMethod, HostKeyPolicy, RemoteConfig, RemoteError};

/// Everything `scp` needs to reach the host the session is connected to.
#[derive(Clone, Debug)]
pub(super) struct ScpTarget {
    host: String,
    port: u16,
    user: String,
    auth: AuthMethod,
    host_key_policy: HostKeyPolicy,
    connect_timeout: Duration,
}

impl ScpTarget {
    /// Uses the credential that authenticated the ssh session.
    pub(super) fn new(config: &RemoteConfig, auth: AuthMethod) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            auth,
            host_key_policy: config.host_key_policy.clone(),
            connect_timeout: config.connect_timeout,
        }
    }

    fn command(&self, remote_path: &str, local: &Path) -> Command {
        let mut command = match &self.auth {
            AuthMethod::Password(password) => {
                let mut command = Command::new("sshpass");
                command.env("SSHPASS", password).arg("-e").arg("scp");
                command
            }
            AuthMethod::Key(key_path) => {
                let mut command = Command::new("scp");
                command.arg("-i").arg(key_path).args(["-o", "BatchMode=yes"]);
                command
            }
        };

        command.arg("-q").arg("-P").arg(self.port.to_string());
        command
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)));
        match &self.host_key_policy {
            HostKeyPolicy::AcceptAny => {
                command.args(["-o", "StrictHostKeyChecking=no", "-o", "UserKnownHostsFile=/dev/null"]);
            }
            HostKeyPolicy::KnownHosts(file) => {
                command
                    .args(["-o", "StrictHostKeyChecking=yes", "-o"])
                    .arg(format!("UserKnownHostsFile={}", file.display()));
            }
        }

        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        command.arg(format!("{}@{host}:{remote_path}", self.user)).arg(local);
        command
    }

    /// Copies `remote_path` into the local file `local`.
    pub(super) fn copy(&self, remote_path: &str, local: &Path) -> Result<(), RemoteError> {
        let mut command = self.command(remote_path, local);
        let program = command.get_program().to_string_lossy().into_owned();
        let transfer_error = |reason: String| RemoteError::Transfer {
            remote_path: remote_path.to_string(),
            reason,
        };

        log::debug!(target: "backup::remote", "Copying {remote_path} to {} with {program}", local.display());
        let output = command
            .output()
            .map_err(|e| transfer_error(format!("running {program} failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(transfer_error(format!("{program} failed with {}: {}", output.status, stderr.trim_end())));
        }
        Ok(())
    }
}
