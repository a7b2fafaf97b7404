//! Remote variant of the execution backend.

use log::{debug, info, warn};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use crate::backend::{
    ArtifactStore, CommandRequest, ExecError, ExecutionBackend, FileEntry, Preflight, RawOutput,
};
use crate::error::{Error, Result};
use crate::remote::executor::{shell_quote, RemoteSession, RemoteTarget, SSHExecutor};
use crate::remote::retry::{diagnose_ssh_error, RetryConfig};
use crate::remote::transfer::SCPTransfer;

/// Runs commands and file operations on one remote host over SSH.
///
/// The session is opened by [`preflight`](ExecutionBackend::preflight) and
/// lives until the backend is dropped at the end of the host's run.
pub struct RemoteBackend {
    executor: SSHExecutor,
    staging_root: String,
    session: Option<RemoteSession>,
}

impl RemoteBackend {
    pub fn new(target: RemoteTarget, staging_root: impl Into<String>, retries: u32) -> Self {
        let retry_config = RetryConfig {
            max_retries: retries,
            ..RetryConfig::default()
        };
        Self {
            executor: SSHExecutor::with_retry_config(target, retry_config),
            staging_root: staging_root.into(),
            session: None,
        }
    }

    fn session(&self) -> Result<&RemoteSession> {
        self.session.as_ref().ok_or_else(|| {
            Error::Remote(format!(
                "No open session to {}; preflight must succeed first",
                self.executor.target().host
            ))
        })
    }

    fn run_checked(&self, command: &str) -> Result<RawOutput> {
        let output = self.session()?.execute(command, None)?;
        if !output.is_success() {
            return Err(Error::Remote(format!(
                "'{}' failed with exit code {}: {}",
                command,
                output.exit_code,
                output.combined().trim()
            )));
        }
        Ok(output)
    }
}

impl ExecutionBackend for RemoteBackend {
    fn host(&self) -> &str {
        &self.executor.target().host
    }

    fn is_local(&self) -> bool {
        false
    }

    fn preflight(&mut self) -> Preflight {
        let target = self.executor.target().clone();
        let key = target.credentials.ssh_key.as_ref().map(|k| k.display().to_string());

        if let Err(e) = self.executor.probe_reachable() {
            warn!("{} is unreachable: {}", target.host, e);
            return Preflight::Unreachable(diagnose_ssh_error(
                &e,
                &target.host,
                target.port,
                key.as_deref(),
            ));
        }

        let session = match self.executor.open_session() {
            Ok(session) => session,
            Err(e) => return Preflight::RemoteUnavailable(e.to_string()),
        };

        if let Err(e) = session.verify() {
            return Preflight::RemoteUnavailable(diagnose_ssh_error(
                &e,
                &target.host,
                target.port,
                key.as_deref(),
            ));
        }

        info!("Remote execution available on {}", target.connection_string());
        self.session = Some(session);
        Preflight::Ready
    }

    fn run(&mut self, request: &CommandRequest<'_>) -> std::result::Result<RawOutput, ExecError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| ExecError::RemoteSession("session not open".to_string()))?;

        let command = match request.working_dir {
            Some(dir) => format!("cd {} && {}", shell_quote(dir), request.command),
            None => request.command.to_string(),
        };

        session
            .execute(&command, request.timeout)
            .map_err(|e| match (&e, request.timeout) {
                (Error::Io(io), Some(limit)) if io.kind() == ErrorKind::TimedOut => {
                    warn!("'{}' timed out on {}; terminating it", request.command, self.host());
                    let kill = termination_command(request.command);
                    if let Err(e) = session.execute(&kill, Some(KILL_TIMEOUT)) {
                        debug!("Could not terminate timed out command: {}", e);
                    }
                    ExecError::Timeout(limit)
                }
                _ => ExecError::RemoteSession(e.to_string()),
            })
    }
}

/// Upper bound for the clean-up command sent after a step times out.
const KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Shell command that stops remote processes whose command line matches
/// `command`. Quotes are dropped since the shell strips them from argv.
fn termination_command(command: &str) -> String {
    format!("pkill -f -- {}", shell_quote(&command.replace('"', "")))
}

impl ArtifactStore for RemoteBackend {
    fn prepare_output_dir(&mut self, _local_dir: &Path, run_key: &str) -> Result<String> {
        let dir = format!(
            "{}/fleetdiag-{}",
            self.staging_root.trim_end_matches('/'),
            run_key
        );
        let quoted = shell_quote(&dir);
        self.run_checked(&format!("rm -rf {} && mkdir -p {}", quoted, quoted))?;
        debug!("Prepared remote staging directory {}", dir);
        Ok(dir)
    }

    fn list_files(&mut self, dir: &str) -> Result<Vec<FileEntry>> {
        let mut files: Vec<FileEntry> = self
            .session()?
            .list_dir(dir)?
            .into_iter()
            .filter_map(|(path, stat)| {
                let file_name = path.file_name()?.to_string_lossy().into_owned();
                Some(FileEntry {
                    path: path.to_string_lossy().into_owned(),
                    file_name,
                    size: stat.size.unwrap_or(0),
                    modified: stat
                        .mtime
                        .map(|secs| UNIX_EPOCH + Duration::from_secs(secs)),
                })
            })
            .collect();
        files.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(files)
    }

    fn fallback_search_dir(&mut self) -> Option<String> {
        self.session.as_ref().and_then(RemoteSession::home_dir)
    }

    fn tool_running(&mut self, process_name: &str) -> bool {
        let Ok(session) = self.session() else {
            return false;
        };
        match session.execute(&format!("pgrep -x {}", shell_quote(process_name)), None) {
            Ok(output) => output.is_success(),
            Err(e) => {
                debug!("Remote process probe failed: {}", e);
                false
            }
        }
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.session()?.rename(from, to)
    }

    fn fetch(&mut self, path: &str, local_path: &Path) -> Result<u64> {
        let bytes = self.session()?.read_file(path)?;
        fs::write(local_path, &bytes)?;
        Ok(bytes.len() as u64)
    }

    fn fetch_fallback(&mut self, path: &str, local_path: &Path) -> Result<u64> {
        SCPTransfer::new(self.executor.target().clone()).download_file(path, local_path)
    }

    fn discard_output_dir(&mut self, dir: &str) -> Result<()> {
        self.run_checked(&format!("rm -rf {}", shell_quote(dir)))?;
        Ok(())
    }
}
