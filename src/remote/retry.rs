//! Retry logic with exponential backoff for SSH connections.
//!
//! Opening a session to a freshly booted or busy host can fail transiently;
//! connection attempts are retried a few times before the host is declared
//! unavailable for remote execution.

use crate::error::{Error, Result};
use log::{debug, warn};
use std::thread;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the initial attempt)
    pub max_retries: u32,
    /// Initial delay between retries in milliseconds
    pub initial_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 8000,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, initial_delay_ms: u64) -> Self {
        Self {
            max_retries,
            initial_delay_ms,
            ..Self::default()
        }
    }

    fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay_ms = (self.initial_delay_ms as f64
            * self.backoff_multiplier.powi(attempt as i32))
        .min(self.max_delay_ms as f64) as u64;

        Duration::from_millis(delay_ms)
    }
}

/// Retries an operation with exponential backoff.
///
/// Returns the first success, or the last error once all attempts fail.
pub fn retry_with_backoff<T, F>(
    config: &RetryConfig,
    mut operation: F,
    operation_name: &str,
) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut last_error = match operation() {
        Ok(result) => return Ok(result),
        Err(e) => {
            debug!("{} failed on initial attempt: {}", operation_name, e);
            e
        }
    };

    for attempt in 1..=config.max_retries {
        let delay = config.calculate_delay(attempt - 1);
        warn!(
            "Retrying {} (attempt {}/{}) after {:?}",
            operation_name, attempt, config.max_retries, delay
        );

        thread::sleep(delay);

        match operation() {
            Ok(result) => {
                debug!("{} succeeded on attempt {}", operation_name, attempt);
                return Ok(result);
            }
            Err(e) => {
                debug!("{} failed on attempt {}: {}", operation_name, attempt, e);
                last_error = e;
            }
        }
    }

    Err(last_error)
}

/// Builds the remediation text shown when a host cannot run remote commands.
pub fn diagnose_ssh_error(error: &Error, host: &str, port: u16, ssh_key: Option<&str>) -> String {
    let error_str = error.to_string().to_lowercase();

    let mut suggestions = vec![format!(
        "• Remote execution must be enabled on the target: sshd running and reachable on {}:{}",
        host, port
    )];

    if error_str.contains("connection refused")
        || error_str.contains("timed out")
        || error_str.contains("no route to host")
        || error_str.contains("resolve")
    {
        suggestions.push(format!("• Verify the host '{}' is reachable from this machine", host));
        suggestions.push("• Check firewall rules between this machine and the target".to_string());
    }

    if error_str.contains("authentication")
        || error_str.contains("permission denied")
        || error_str.contains("publickey")
    {
        match ssh_key {
            Some(key) => {
                suggestions.push(format!("• Check that the SSH key exists and is readable: {}", key));
                suggestions.push(format!(
                    "• Verify the public key is in ~/.ssh/authorized_keys on {}",
                    host
                ));
            }
            None => {
                suggestions.push("• Configure remote.ssh_key or pass --ssh-key".to_string());
                suggestions.push("• Verify your SSH agent is running (ssh-add -l)".to_string());
            }
        }
    }

    if error_str.contains("host key") || error_str.contains("known_hosts") {
        suggestions.push(format!(
            "• Add the host to known_hosts: ssh-keyscan -p {} {} >> ~/.ssh/known_hosts",
            port, host
        ));
    }

    suggestions.push(format!("• Test manually: ssh -p {} {} true", port, host));

    format!(
        "Remote execution unavailable on {}: {}\n\nTroubleshooting suggestions:\n{}",
        host,
        error,
        suggestions.join("\n")
    )
}
