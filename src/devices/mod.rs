//! Device list resolution.
//!
//! Turns a device-list file (or a single host name) into the ordered list
//! of targets for a session. A missing, unreadable or empty list is never
//! fatal: the session falls back to diagnosing the local machine.

use log::{debug, warn};
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Names that always refer to the machine running fleetdiag.
const LOCAL_ALIASES: &[&str] = &["localhost", ".", "127.0.0.1", "::1"];

/// A resolved diagnostic target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub name: String,
    pub is_local: bool,
}

/// Outcome of resolving the device list.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Never empty.
    pub devices: Vec<Device>,
    /// Where the devices came from, for the report header
    pub source: String,
    /// Set when a device list was given but could not be used, so the local
    /// machine was substituted.
    pub fallback_reason: Option<String>,
}

impl Resolution {
    pub fn names(&self) -> Vec<&str> {
        self.devices.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn has_local(&self) -> bool {
        self.devices.iter().any(|d| d.is_local)
    }
}

/// Identity of the machine running the session.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    hostname: String,
}

impl LocalIdentity {
    /// Reads the host name from the operating system.
    pub fn detect() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        Self { hostname }
    }

    pub fn with_hostname(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// True for local aliases and for this machine's short or qualified name.
    pub fn is_local(&self, name: &str) -> bool {
        let name = name.trim();
        if LOCAL_ALIASES.iter().any(|a| a.eq_ignore_ascii_case(name)) {
            return true;
        }
        if name.eq_ignore_ascii_case(&self.hostname) {
            return true;
        }
        let short = |n: &str| n.split('.').next().unwrap_or(n).to_ascii_lowercase();
        short(name) == short(&self.hostname) && !name.contains(':')
    }

    /// Replaces the `localhost` and `.` sentinels with the real host name.
    fn canonical_name(&self, name: &str) -> String {
        if name == "." || name.eq_ignore_ascii_case("localhost") {
            self.hostname.clone()
        } else {
            name.to_string()
        }
    }

    fn device(&self, name: &str) -> Device {
        Device {
            name: self.canonical_name(name),
            is_local: self.is_local(name),
        }
    }
}

/// Extracts device names from device-list text, preserving order and duplicates.
pub fn parse_device_list(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Resolves the session's targets.
///
/// A single host takes precedence over a list file. Without either, or when
/// the file yields no entries, the local machine is the only target.
pub fn resolve(
    list_path: Option<&Path>,
    single_host: Option<&str>,
    identity: &LocalIdentity,
) -> Resolution {
    if let Some(host) = single_host.map(str::trim).filter(|h| !h.is_empty()) {
        debug!("Using single host '{}'", host);
        return Resolution {
            devices: vec![identity.device(host)],
            source: format!("single host '{}'", host),
            fallback_reason: None,
        };
    }

    let reason = match list_path {
        None => "no device list supplied".to_string(),
        Some(path) => match fs::read_to_string(path) {
            Ok(contents) => {
                let names = parse_device_list(&contents);
                if !names.is_empty() {
                    debug!("Resolved {} devices from {}", names.len(), path.display());
                    return Resolution {
                        devices: names.iter().map(|n| identity.device(n)).collect(),
                        source: format!("device list {}", path.display()),
                        fallback_reason: None,
                    };
                }
                format!("device list {} has no usable entries", path.display())
            }
            Err(e) => format!("device list {} could not be read: {}", path.display(), e),
        },
    };

    let fallback_reason = if list_path.is_some() {
        warn!("{}; falling back to local machine", reason);
        Some(reason.clone())
    } else {
        debug!("{}; targeting local machine", reason);
        None
    };

    Resolution {
        devices: vec![Device {
            name: identity.hostname().to_string(),
            is_local: true,
        }],
        source: format!("local machine ({})", reason),
        fallback_reason,
    }
}
