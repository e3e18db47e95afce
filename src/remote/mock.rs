//! In-memory [Transport] for tests.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{ExitInfo, RemoteChannel, RemoteError, Transport};

/// Absolute path the scratch directory resolves to.
pub(crate) const SCRATCH_DIR: &str = "/home/backup/.site-backup-tmp";

struct Response {
    needle: String,
    code: i32,
    stdout: Vec<u8>,
    stderr: String,
}

struct State {
    limit: usize,
    opened: usize,
    live: usize,
    disconnects: usize,
    commands: Vec<String>,
    responses: Vec<Response>,
    files: Vec<(String, Vec<u8>)>,
}

/// Endpoint accepting a limited number of concurrent channels.
///
/// Commands are answered by the most recently registered response whose
/// needle is contained in the command line; unknown commands succeed silently.
#[derive(Clone)]
pub(crate) struct MockTransport {
    state: Arc<Mutex<State>>,
}

impl MockTransport {
    pub(crate) fn with_limit(limit: usize) -> Self {
        let transport = Self {
            state: Arc::new(Mutex::new(State {
                limit,
                opened: 0,
                live: 0,
                disconnects: 0,
                commands: Vec::new(),
                responses: Vec::new(),
                files: Vec::new(),
            })),
        };
        transport.respond("mkdir -p", 0, &format!("{SCRATCH_DIR}\n"), "");
        transport
    }

    pub(crate) fn unlimited() -> Self {
        Self::with_limit(usize::MAX)
    }

    pub(crate) fn set_limit(&self, limit: usize) {
        self.lock().limit = limit;
    }

    pub(crate) fn respond(&self, needle: &str, code: i32, stdout: &str, stderr: &str) {
        self.respond_bytes(needle, code, stdout.as_bytes().to_vec(), stderr);
    }

    pub(crate) fn respond_bytes(&self, needle: &str, code: i32, stdout: Vec<u8>, stderr: &str) {
        self.lock().responses.push(Response {
            needle: needle.to_string(),
            code,
            stdout,
            stderr: stderr.to_string(),
        });
    }

    /// Serves `contents` to copies of remote paths ending with `suffix`.
    pub(crate) fn serve_file(&self, suffix: &str, contents: Vec<u8>) {
        self.lock().files.push((suffix.to_string(), contents));
    }

    /// Number of channels opened so far.
    pub(crate) fn opened(&self) -> usize {
        self.lock().opened
    }

    /// Number of channels neither executed nor closed.
    pub(crate) fn live(&self) -> usize {
        self.lock().live
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.lock().disconnects
    }

    /// Every command line executed so far.
    pub(crate) fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

impl Transport for MockTransport {
    type Channel = MockChannel;

    fn open_channel(&self) -> Result<MockChannel, RemoteError> {
        let mut state = self.lock();
        if state.live >= state.limit {
            return Err(RemoteError::NoCapacity);
        }
        state.live += 1;
        state.opened += 1;
        Ok(MockChannel {
            state: Arc::clone(&self.state),
        })
    }

    fn copy_out(&self, remote_path: &str, local: &Path) -> Result<(), RemoteError> {
        let state = self.lock();
        let (_, contents) = state
            .files
            .iter()
            .rev()
            .find(|(suffix, _)| remote_path.ends_with(suffix.as_str()))
            .ok_or_else(|| RemoteError::Transfer {
                remote_path: remote_path.to_string(),
                reason: "No such file or directory".to_string(),
            })?;
        fs::write(local, contents).map_err(|e| RemoteError::Transfer {
            remote_path: remote_path.to_string(),
            reason: e.to_string(),
        })
    }

    fn disconnect(&self) {
        self.lock().disconnects += 1;
    }
}

pub(crate) struct MockChannel {
    state: Arc<Mutex<State>>,
}

impl RemoteChannel for MockChannel {
    fn execute(self, command: &str, stdout: &mut dyn Write) -> io::Result<ExitInfo> {
        let (code, output, stderr) = {
            let mut state = self.state.lock().unwrap();
            state.live -= 1;
            state.commands.push(command.to_string());
            match state.responses.iter().rev().find(|r| command.contains(&r.needle)) {
                Some(r) => (r.code, r.stdout.clone(), r.stderr.clone()),
                None => (0, Vec::new(), String::new()),
            }
        };

        stdout.write_all(&output)?;
        Ok(ExitInfo { code, stderr })
    }

    fn close(self) {
        self.state.lock().unwrap().live -= 1;
    }
}
