//! Execution backends.
//!
//! A backend runs diagnostic commands against exactly one host and gives the
//! artifact collector access to that host's files. The local variant spawns
//! processes on this machine; the remote variant lives in
//! [`crate::remote::RemoteBackend`] and drives an SSH session.

pub mod factory;
pub mod local;

use std::path::Path;
use std::time::{Duration, SystemTime};
use thiserror::Error;

use crate::error::Result;
use crate::poll::CancellationToken;

pub use factory::SystemBackendFactory;
pub use local::LocalBackend;

/// Raw result of one command.
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
}

impl RawOutput {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr, the way the consolidated log shows it.
    pub fn combined(&self) -> String {
        match (self.stdout.trim_end().is_empty(), self.stderr.trim_end().is_empty()) {
            (_, true) => self.stdout.trim_end().to_string(),
            (true, false) => self.stderr.trim_end().to_string(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
        }
    }
}

/// Why a command produced no exit code at all.
///
/// A non-zero exit code is not an error at this layer; it is reported
/// through [`RawOutput::exit_code`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecError {
    #[error("failed to start process: {0}")]
    Spawn(String),

    #[error("remote session failure: {0}")]
    RemoteSession(String),

    #[error("command did not finish within {0:?}")]
    Timeout(Duration),

    #[error("command cancelled")]
    Cancelled,
}

/// Result of the remote capability probes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preflight {
    Ready,
    /// The host did not answer on the remote execution port.
    Unreachable(String),
    /// The host answered but a remote shell session could not be opened.
    RemoteUnavailable(String),
}

impl Preflight {
    pub fn is_ready(&self) -> bool {
        matches!(self, Preflight::Ready)
    }
}

/// One command invocation.
#[derive(Debug, Clone, Copy)]
pub struct CommandRequest<'a> {
    pub command: &'a str,
    pub working_dir: Option<&'a str>,
    pub timeout: Option<Duration>,
    /// Stops a local command early once cancelled
    pub cancel: Option<&'a CancellationToken>,
}

impl<'a> CommandRequest<'a> {
    pub fn new(command: &'a str) -> Self {
        Self {
            command,
            working_dir: None,
            timeout: None,
            cancel: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: &'a CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn in_dir(mut self, dir: &'a str) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Runs commands against a single host.
pub trait ExecutionBackend {
    fn host(&self) -> &str;

    fn is_local(&self) -> bool;

    /// Reachability and remote-execution probes; always ready for local hosts.
    fn preflight(&mut self) -> Preflight;

    fn run(&mut self, request: &CommandRequest<'_>) -> std::result::Result<RawOutput, ExecError>;
}

/// A file observed on the target host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path as understood by the host that owns the file
    pub path: String,
    pub file_name: String,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// File access on the target host, used by the artifact collector.
pub trait ArtifactStore {
    /// Creates the directory the log export writes into and returns its path
    /// on the target. `local_dir` has already been emptied by the collector;
    /// `run_key` names the directory after the session and host run.
    fn prepare_output_dir(&mut self, local_dir: &Path, run_key: &str) -> Result<String>;

    /// Regular files directly inside `dir`.
    fn list_files(&mut self, dir: &str) -> Result<Vec<FileEntry>>;

    /// Directory to search when nothing turns up in the output directory.
    fn fallback_search_dir(&mut self) -> Option<String>;

    /// Whether a process with this name is still running on the host.
    fn tool_running(&mut self, process_name: &str) -> bool;

    fn rename(&mut self, from: &str, to: &str) -> Result<()>;

    /// Copies a host file into `local_path` over the primary channel.
    fn fetch(&mut self, path: &str, local_path: &Path) -> Result<u64>;

    /// Second-chance copy over an independent channel.
    fn fetch_fallback(&mut self, path: &str, local_path: &Path) -> Result<u64>;

    /// Removes the output directory once its contents are safely local.
    fn discard_output_dir(&mut self, dir: &str) -> Result<()>;
}

/// Everything a host run needs from its backend.
pub trait HostBackend: ExecutionBackend + ArtifactStore + Send {}

impl<T: ExecutionBackend + ArtifactStore + Send> HostBackend for T {}

/// Opens one backend per host; a backend is never shared across hosts.
pub trait BackendFactory: Sync {
    fn open(&self, host: &str, is_local: bool) -> Box<dyn HostBackend>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(stdout: &str, stderr: &str) -> RawOutput {
        RawOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code: 0,
            duration: Duration::ZERO,
        }
    }

    #[test]
    fn test_combined_orders_stdout_first() {
        assert_eq!(output("out\n", "err\n").combined(), "out\nerr");
        assert_eq!(output("", "err\n").combined(), "err");
        assert_eq!(output("out", "").combined(), "out");
        assert_eq!(output("", "").combined(), "");
    }

    #[test]
    fn test_command_request_builder() {
        let request = CommandRequest::new("agent show")
            .in_dir("/tmp/out")
            .with_timeout(Some(Duration::from_secs(5)));
        assert_eq!(request.working_dir, Some("/tmp/out"));
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
    }
}
