//! Out-of-band file retrieval with the system `scp` client.
//!
//! Used when reading an artifact over the host's own SSH session fails. It
//! opens an independent connection, so it also recovers from a session that
//! died halfway through a transfer.

use crate::error::{Error, Result};
use crate::remote::executor::RemoteTarget;
use log::debug;
use std::path::Path;
use std::process::Command;

/// Handles SCP-based downloads from one remote host.
pub struct SCPTransfer {
    target: RemoteTarget,
}

impl SCPTransfer {
    pub fn new(target: RemoteTarget) -> Self {
        Self { target }
    }

    /// Downloads a single file, returning its local size in bytes.
    pub fn download_file(&self, remote_path: &str, local_path: &Path) -> Result<u64> {
        let mut cmd = Command::new("scp");
        self.add_ssh_options(&mut cmd);
        cmd.arg(self.remote_spec(remote_path));
        cmd.arg(local_path);

        debug!("Running scp fallback for {}", remote_path);
        let output = cmd
            .output()
            .map_err(|e| Error::Transfer(format!("Failed to start scp: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Transfer(format!(
                "SCP download failed: {}",
                stderr.trim()
            )));
        }

        Ok(std::fs::metadata(local_path)?.len())
    }

    fn remote_spec(&self, remote_path: &str) -> String {
        format!(
            "{}@{}:{}",
            self.target.credentials.user, self.target.host, remote_path
        )
    }

    fn add_ssh_options(&self, cmd: &mut Command) {
        cmd.arg("-o").arg("BatchMode=yes");
        cmd.arg("-o")
            .arg(format!("ConnectTimeout={}", self.target.timeout.as_secs().max(1)));

        if let Some(ref key) = self.target.credentials.ssh_key {
            cmd.arg("-i").arg(key);
        }

        if self.target.port != 22 {
            cmd.arg("-P").arg(self.target.port.to_string()); // scp uses -P, not -p
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::executor::Credentials;
    use std::path::PathBuf;

    fn transfer(port: u16) -> SCPTransfer {
        let creds = Credentials {
            user: "ops".to_string(),
            password: None,
            ssh_key: Some(PathBuf::from("/keys/id_ed25519")),
        };
        SCPTransfer::new(RemoteTarget::new("srv01", port, creds))
    }

    #[test]
    fn test_remote_spec() {
        assert_eq!(
            transfer(22).remote_spec("/tmp/fleetdiag-x/logs.zip"),
            "ops@srv01:/tmp/fleetdiag-x/logs.zip"
        );
    }

    #[test]
    fn test_ssh_options_include_key_and_port() {
        let mut cmd = Command::new("scp");
        transfer(2222).add_ssh_options(&mut cmd);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"/keys/id_ed25519".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-P" && w[1] == "2222"));
    }
}
