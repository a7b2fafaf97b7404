//! SSH-based remote command execution.
//!
//! `SSHExecutor` knows how to reach one host; it hands out a
//! [`RemoteSession`] that stays open for all of that host's diagnostic steps
//! and file operations and is dropped once the host is done.

use crate::backend::RawOutput;
use crate::config::RemoteSettings;
use crate::error::{Error, Result};
use crate::remote::retry::{diagnose_ssh_error, retry_with_backoff, RetryConfig};
use log::{debug, info, warn};
use ssh2::{FileStat, Session};
use std::io::Read;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Identity used for remote sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
    pub ssh_key: Option<PathBuf>,
}

impl Credentials {
    /// The invoking user, authenticated by key file or agent.
    pub fn current_user(settings: &RemoteSettings) -> Self {
        Self {
            user: settings.effective_user(),
            password: None,
            ssh_key: settings.expanded_ssh_key(),
        }
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }
}

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
    /// Probe, handshake and idle-read timeout
    pub timeout: Duration,
}

impl RemoteTarget {
    pub fn new(host: impl Into<String>, port: u16, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            port,
            credentials,
            timeout: Duration::from_secs(15),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the SSH connection string (user@host:port).
    pub fn connection_string(&self) -> String {
        if self.port == 22 {
            format!("{}@{}", self.credentials.user, self.host)
        } else {
            format!("{}@{}:{}", self.credentials.user, self.host, self.port)
        }
    }
}

/// Opens SSH sessions to a single host.
pub struct SSHExecutor {
    target: RemoteTarget,
    retry_config: RetryConfig,
}

impl SSHExecutor {
    pub fn new(target: RemoteTarget) -> Self {
        Self {
            target,
            retry_config: RetryConfig::default(),
        }
    }

    pub fn with_retry_config(target: RemoteTarget, retry_config: RetryConfig) -> Self {
        Self {
            target,
            retry_config,
        }
    }

    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }

    fn resolve(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.target.host, self.target.port);
        addr_str
            .to_socket_addrs()
            .map_err(|e| {
                Error::Remote(format!(
                    "Failed to resolve host '{}': {}",
                    self.target.host, e
                ))
            })?
            .next()
            .ok_or_else(|| {
                Error::Remote(format!("No addresses found for host '{}'", self.target.host))
            })
    }

    /// Basic reachability: can a TCP connection be made to the SSH port?
    pub fn probe_reachable(&self) -> Result<()> {
        let addr = self.resolve()?;
        TcpStream::connect_timeout(&addr, self.target.timeout).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to connect to {}: {}", addr, e),
            ))
        })?;
        debug!("{} is reachable on port {}", self.target.host, self.target.port);
        Ok(())
    }

    /// Opens and authenticates a session, retrying transient failures.
    ///
    /// On final failure the error carries remediation suggestions.
    pub fn open_session(&self) -> Result<RemoteSession> {
        info!("Opening SSH session to {}", self.target.connection_string());

        let label = format!("SSH connection to {}", self.target.connection_string());
        let session = retry_with_backoff(&self.retry_config, || self.connect_once(), &label)
            .map_err(|e| {
                let key = self
                    .target
                    .credentials
                    .ssh_key
                    .as_ref()
                    .map(|k| k.display().to_string());
                Error::Remote(diagnose_ssh_error(
                    &e,
                    &self.target.host,
                    self.target.port,
                    key.as_deref(),
                ))
            })?;

        Ok(RemoteSession {
            session,
            host: self.target.host.clone(),
        })
    }

    fn connect_once(&self) -> Result<Session> {
        let addr = self.resolve()?;
        let tcp = TcpStream::connect_timeout(&addr, self.target.timeout).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to connect to {}: {}", self.target.host, e),
            ))
        })?;

        let mut sess = Session::new()
            .map_err(|e| Error::Remote(format!("Failed to create SSH session: {}", e)))?;
        sess.set_tcp_stream(tcp);
        sess.set_timeout(self.target.timeout.as_millis() as u32);
        sess.handshake()
            .map_err(|e| Error::Remote(format!("SSH handshake failed: {}", e)))?;

        self.authenticate(&mut sess)?;

        // Handshake timeout no longer applies; steps set their own.
        sess.set_timeout(0);
        debug!("SSH connection attempt successful");
        Ok(sess)
    }

    /// Tries key file, then password, then agent authentication.
    fn authenticate(&self, sess: &mut Session) -> Result<()> {
        let creds = &self.target.credentials;
        debug!("Authenticating as user: {}", creds.user);

        if let Some(key_path) = &creds.ssh_key {
            match sess.userauth_pubkey_file(&creds.user, None, key_path, None) {
                Ok(_) => return Ok(()),
                Err(e) => warn!("Public key authentication failed: {}", e),
            }
        }

        if let Some(password) = &creds.password {
            match sess.userauth_password(&creds.user, password) {
                Ok(_) => return Ok(()),
                Err(e) => warn!("Password authentication failed: {}", e),
            }
        }

        match sess.userauth_agent(&creds.user) {
            Ok(_) => return Ok(()),
            Err(e) => warn!("Agent authentication failed: {}", e),
        }

        Err(Error::Remote(format!(
            "SSH authentication failed for user {}",
            creds.user
        )))
    }
}

/// An authenticated session to one host.
pub struct RemoteSession {
    session: Session,
    host: String,
}

impl RemoteSession {
    /// Confirms the session can actually run a command.
    pub fn verify(&self) -> Result<()> {
        if !self.session.authenticated() {
            return Err(Error::Remote(
                "SSH connection established but not authenticated".to_string(),
            ));
        }
        let result = self.execute("echo fleetdiag-ready", None)?;
        if !result.is_success() || !result.stdout.contains("fleetdiag-ready") {
            return Err(Error::Remote(format!(
                "Remote shell on {} did not respond (exit code {})",
                self.host, result.exit_code
            )));
        }
        Ok(())
    }

    /// Executes a command and waits for it to exit.
    ///
    /// Stderr is folded into stdout on the remote side, so one read drains
    /// the channel and `stderr` comes back empty. With a timeout, any
    /// blocking read longer than the timeout fails with an IO error of kind
    /// `TimedOut`; the channel is then closed and the session timeout cleared.
    pub fn execute(&self, command: &str, timeout: Option<Duration>) -> Result<RawOutput> {
        debug!("Executing remote command on {}: {}", self.host, command);
        let started = Instant::now();
        let _timeout = TimeoutGuard::set(&self.session, timeout);

        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| Error::Remote(format!("Failed to open channel: {}", e)))?;
        channel
            .exec(&merge_stderr(command))
            .map_err(|e| Error::Remote(format!("Failed to execute command: {}", e)))?;

        let mut stdout = String::new();
        if let Err(e) = channel.read_to_string(&mut stdout) {
            let _ = channel.close();
            return Err(Error::Io(e));
        }

        channel
            .wait_close()
            .map_err(|e| Error::Remote(format!("Failed to close channel: {}", e)))?;
        let exit_code = channel
            .exit_status()
            .map_err(|e| Error::Remote(format!("Failed to get exit status: {}", e)))?;
        debug!("Command exit code: {}", exit_code);

        Ok(RawOutput {
            stdout,
            stderr: String::new(),
            exit_code,
            duration: started.elapsed(),
        })
    }

    /// Regular files directly inside `dir`.
    pub fn list_dir(&self, dir: &str) -> Result<Vec<(PathBuf, FileStat)>> {
        let sftp = self.session.sftp()?;
        let entries = sftp.readdir(Path::new(dir))?;
        Ok(entries
            .into_iter()
            .filter(|(_, stat)| stat.is_file())
            .collect())
    }

    /// Reads a whole file over SFTP on this session.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let sftp = self.session.sftp()?;
        let mut file = sftp.open(Path::new(path))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let sftp = self.session.sftp()?;
        sftp.rename(Path::new(from), Path::new(to), None)?;
        Ok(())
    }

    /// Home directory of the session user.
    pub fn home_dir(&self) -> Option<String> {
        self.execute("pwd", None)
            .ok()
            .filter(|r| r.is_success())
            .map(|r| r.stdout.trim().to_string())
            .filter(|p| !p.is_empty())
    }
}

/// Applies a per-command read timeout to a session and clears it on drop.
struct TimeoutGuard<'a> {
    session: &'a Session,
}

impl<'a> TimeoutGuard<'a> {
    fn set(session: &'a Session, timeout: Option<Duration>) -> Self {
        let millis = timeout.map_or(0, |t| t.as_millis().min(u32::MAX as u128) as u32);
        session.set_timeout(millis);
        Self { session }
    }
}

impl Drop for TimeoutGuard<'_> {
    fn drop(&mut self) {
        self.session.set_timeout(0);
    }
}

/// Wraps a command so everything it writes to stderr arrives on stdout.
pub fn merge_stderr(command: &str) -> String {
    format!("exec 2>&1; {}", command)
}

/// Quotes a value for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Credentials {
        Credentials {
            user: "ops".to_string(),
            password: None,
            ssh_key: None,
        }
    }

    #[test]
    fn test_timeout_is_cleared_when_command_ends() {
        let session = Session::new().unwrap();
        {
            let _guard = TimeoutGuard::set(&session, Some(Duration::from_secs(5)));
            assert_eq!(session.timeout(), 5000);
        }
        assert_eq!(session.timeout(), 0);

        let _guard = TimeoutGuard::set(&session, None);
        assert_eq!(session.timeout(), 0);
    }

    #[test]
    fn test_timeout_is_cleared_on_early_return() {
        fn failing(session: &Session) -> Result<()> {
            let _guard = TimeoutGuard::set(session, Some(Duration::from_millis(750)));
            Err(Error::Remote("channel refused".to_string()))
        }

        let session = Session::new().unwrap();
        assert!(failing(&session).is_err());
        assert_eq!(session.timeout(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_merged_command_sends_stderr_to_stdout() {
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(merge_stderr("echo out; echo err 1>&2; ls /nonexistent-fleetdiag"))
            .output()
            .unwrap();
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("out"));
        assert!(stdout.contains("err"));
        assert!(stdout.contains("nonexistent-fleetdiag"));
        assert!(output.stderr.is_empty());
    }

    #[test]
    fn test_connection_string() {
        let target = RemoteTarget::new("srv01", 22, credentials());
        assert_eq!(target.connection_string(), "ops@srv01");

        let target = RemoteTarget::new("srv01", 2222, credentials());
        assert_eq!(target.connection_string(), "ops@srv01:2222");
    }

    #[test]
    fn test_current_user_credentials_use_settings() {
        let settings = RemoteSettings {
            user: Some("svc-diag".to_string()),
            ..RemoteSettings::default()
        };
        let creds = Credentials::current_user(&settings).with_password(Some("pw".to_string()));
        assert_eq!(creds.user, "svc-diag");
        assert_eq!(creds.password.as_deref(), Some("pw"));
    }

    #[test]
    fn test_probe_unresolvable_host_fails() {
        let target = RemoteTarget::new("host.invalid", 22, credentials())
            .with_timeout(Duration::from_millis(200));
        let executor = SSHExecutor::new(target);
        assert!(executor.probe_reachable().is_err());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/tmp/a b"), "'/tmp/a b'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
