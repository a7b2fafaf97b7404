//! Local execution through the platform shell.

use log::{debug, warn};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use super::{ArtifactStore, CommandRequest, ExecError, ExecutionBackend, FileEntry, Preflight, RawOutput};
use crate::error::{Error, Result};
use crate::poll::CancellationToken;

/// How often a running child is checked for a timeout or cancellation.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Runs commands on the machine fleetdiag itself runs on.
pub struct LocalBackend {
    host: String,
}

impl LocalBackend {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    fn shell_command(command: &str) -> Command {
        if cfg!(windows) {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        }
    }

    /// Waits for the child, killing it if `timeout` passes or `cancel` fires first.
    fn wait_for_exit(
        child: &mut Child,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> std::result::Result<i32, ExecError> {
        let status = if timeout.is_none() && cancel.is_none() {
            child
                .wait()
                .map_err(|e| ExecError::Spawn(format!("failed to wait for process: {}", e)))?
        } else {
            let started = Instant::now();
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => break status,
                    Ok(None) => {
                        let stop = if cancel.is_some_and(|c| c.is_cancelled()) {
                            Some(ExecError::Cancelled)
                        } else {
                            timeout
                                .filter(|limit| started.elapsed() >= *limit)
                                .map(ExecError::Timeout)
                        };
                        if let Some(reason) = stop {
                            warn!("Stopping process {}: {}", child.id(), reason);
                            let _ = child.kill();
                            let _ = child.wait();
                            return Err(reason);
                        }
                        thread::sleep(WAIT_SLICE);
                    }
                    Err(e) => {
                        return Err(ExecError::Spawn(format!("failed to poll process: {}", e)))
                    }
                }
            }
        };

        // Killed by a signal: report the conventional shell code.
        Ok(status.code().unwrap_or(-1))
    }
}

/// Drains a pipe on its own thread so a chatty child never blocks on a full buffer.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

impl ExecutionBackend for LocalBackend {
    fn host(&self) -> &str {
        &self.host
    }

    fn is_local(&self) -> bool {
        true
    }

    fn preflight(&mut self) -> Preflight {
        Preflight::Ready
    }

    fn run(&mut self, request: &CommandRequest<'_>) -> std::result::Result<RawOutput, ExecError> {
        debug!("Executing local command: {}", request.command);
        let started = Instant::now();

        let mut cmd = Self::shell_command(request.command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = request.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ExecError::Spawn(format!("{}: {}", request.command, e)))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let exit_code = Self::wait_for_exit(&mut child, request.timeout, request.cancel)?;

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        debug!("Command exit code: {}", exit_code);

        Ok(RawOutput {
            stdout,
            stderr,
            exit_code,
            duration: started.elapsed(),
        })
    }
}

impl ArtifactStore for LocalBackend {
    fn prepare_output_dir(&mut self, local_dir: &Path, _run_key: &str) -> Result<String> {
        fs::create_dir_all(local_dir)?;
        Ok(local_dir.to_string_lossy().into_owned())
    }

    fn list_files(&mut self, dir: &str) -> Result<Vec<FileEntry>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            files.push(FileEntry {
                path: entry.path().to_string_lossy().into_owned(),
                file_name: entry.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
                modified: metadata.modified().ok(),
            });
        }
        files.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(files)
    }

    fn fallback_search_dir(&mut self) -> Option<String> {
        std::env::current_dir()
            .ok()
            .map(|d| d.to_string_lossy().into_owned())
    }

    fn tool_running(&mut self, process_name: &str) -> bool {
        let output = if cfg!(windows) {
            Command::new("tasklist")
                .args(["/NH", "/FI"])
                .arg(format!("IMAGENAME eq {}.exe", process_name))
                .output()
        } else {
            Command::new("pgrep").arg("-x").arg(process_name).output()
        };

        match output {
            Ok(out) if cfg!(windows) => {
                String::from_utf8_lossy(&out.stdout)
                    .to_ascii_lowercase()
                    .contains(&process_name.to_ascii_lowercase())
            }
            Ok(out) => out.status.success(),
            Err(e) => {
                debug!("Process probe unavailable ({}); assuming {} exited", e, process_name);
                false
            }
        }
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        fs::rename(from, to)?;
        Ok(())
    }

    fn fetch(&mut self, path: &str, local_path: &Path) -> Result<u64> {
        if Path::new(path) == local_path {
            return Ok(fs::metadata(local_path)?.len());
        }
        Ok(fs::copy(path, local_path)?)
    }

    fn fetch_fallback(&mut self, path: &str, local_path: &Path) -> Result<u64> {
        // Copy failed; a move works across permissions that block reading in place.
        fs::rename(path, local_path)?;
        Ok(fs::metadata(local_path)?.len())
    }

    fn discard_output_dir(&mut self, _dir: &str) -> Result<()> {
        // The output directory is the host's report folder.
        Ok(())
    }
}

/// Locates an executable the way the shell would.
pub fn locate_tool(tool_path: &str) -> Option<PathBuf> {
    let candidate = Path::new(tool_path);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let finder = if cfg!(windows) { "where" } else { "which" };
    let output = Command::new(finder).arg(tool_path).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(PathBuf::from)
}

/// Operator-facing error for an agent binary that could not be located.
pub fn missing_tool_error(tool_path: &str) -> Error {
    Error::Config(format!(
        "Diagnostic tool '{}' was not found\n\n\
         Suggestions:\n\
         • Install the agent on this machine\n\
         • Point tool_path in the config (or --tool) at the agent binary",
        tool_path
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_run_captures_stdout_then_stderr() {
        let mut backend = LocalBackend::new("wks01");
        let output = backend
            .run(&CommandRequest::new("echo out; echo err 1>&2"))
            .unwrap();

        assert!(output.is_success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert_eq!(output.combined(), "out\nerr");
    }

    #[test]
    fn test_non_zero_exit_is_not_an_error() {
        let mut backend = LocalBackend::new("wks01");
        let output = backend.run(&CommandRequest::new("exit 3")).unwrap();
        assert_eq!(output.exit_code, 3);
        assert!(!output.is_success());
    }

    #[test]
    fn test_working_directory_is_applied() {
        let temp = TempDir::new().unwrap();
        let mut backend = LocalBackend::new("wks01");
        let dir = temp.path().to_string_lossy().into_owned();

        backend
            .run(&CommandRequest::new("echo data > produced.zip").in_dir(&dir))
            .unwrap();

        assert!(temp.path().join("produced.zip").exists());
    }

    #[test]
    fn test_timeout_kills_command() {
        let mut backend = LocalBackend::new("wks01");
        let result = backend.run(
            &CommandRequest::new("sleep 5").with_timeout(Some(Duration::from_millis(200))),
        );
        assert_eq!(result, Err(ExecError::Timeout(Duration::from_millis(200))));
    }

    #[test]
    fn test_cancellation_kills_command() {
        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(200));
                token.cancel();
            })
        };

        let mut backend = LocalBackend::new("wks01");
        let started = Instant::now();
        let result = backend.run(&CommandRequest::new("sleep 5").with_cancellation(&token));
        canceller.join().unwrap();

        assert_eq!(result, Err(ExecError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_untouched_token_lets_command_finish() {
        let token = CancellationToken::new();
        let mut backend = LocalBackend::new("wks01");
        let output = backend
            .run(&CommandRequest::new("echo done").with_cancellation(&token))
            .unwrap();
        assert_eq!(output.stdout.trim(), "done");
    }

    #[test]
    fn test_list_files_skips_directories() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("b.zip"), b"bb").unwrap();
        fs::write(temp.path().join("a.txt"), b"a").unwrap();
        fs::create_dir(temp.path().join("sub")).unwrap();

        let mut backend = LocalBackend::new("wks01");
        let files = backend
            .list_files(&temp.path().to_string_lossy())
            .unwrap();

        let names: Vec<_> = files.iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.zip"]);
        assert_eq!(files[1].size, 2);
    }

    #[test]
    fn test_locate_tool() {
        assert!(locate_tool("sh").is_some());
        assert!(locate_tool("definitely-not-an-installed-agent-binary").is_none());
    }
}
