//! Session-wide state handed down the coordinator chain.

use chrono::{DateTime, Local};
use log::warn;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::catalog::{self, DiagnosticStep};
use crate::collector::naming::sanitize_host;
use crate::config::Config;
use crate::devices::Device;
use crate::poll::{CancellationToken, Clock, SystemClock};

/// Created once at session start. Only the aggregator updates it, and only
/// before the first host runs.
pub struct SessionContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Local>,
    pub config: Config,
    /// Name of the machine running the session
    pub operator_host: String,
    pub tool_available: bool,
    pub steps: Vec<DiagnosticStep>,
    pub process_name: String,
    pub cancel: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl SessionContext {
    pub fn new(config: Config, operator_host: impl Into<String>) -> Self {
        Self::with_clock(config, operator_host, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(
        mut config: Config,
        operator_host: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        config.report_root = absolute_root(config.report_root);
        let steps = catalog::catalog(&config.tool_path);
        let process_name = catalog::tool_process_name(&config.tool_path);
        Self {
            run_id: Uuid::new_v4(),
            started_at: Local::now(),
            config,
            operator_host: operator_host.into(),
            tool_available: true,
            steps,
            process_name,
            cancel: CancellationToken::new(),
            clock,
        }
    }

    /// Shares a cancellation token owned by the caller.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Timestamp used in report file names.
    pub fn stamp(&self) -> String {
        self.started_at.format("%Y%m%d-%H%M%S").to_string()
    }

    /// Artifact folder for one host run.
    pub fn host_dir(&self, run_label: &str) -> PathBuf {
        self.config.report_root.join(sanitize_host(run_label))
    }

    /// Key that ties a host's export output to this session.
    pub fn correlation_key(&self, run_label: &str) -> String {
        let simple = self.run_id.simple().to_string();
        format!("{}-{}", sanitize_host(run_label), &simple[..8])
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.config.step_timeout()
    }

    /// Hosts run concurrently and their log blocks are buffered.
    pub fn is_parallel(&self) -> bool {
        self.config.execution.max_parallel_hosts > 1
    }
}

/// Anchors a relative report root at the current directory. Local steps run
/// inside their output folder, so every path handed to them must be absolute.
fn absolute_root(root: PathBuf) -> PathBuf {
    if root.is_absolute() {
        return root;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(root),
        Err(e) => {
            warn!("Could not resolve {} against the current directory: {}", root.display(), e);
            root
        }
    }
}

/// A resolved device paired with its label for this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedHost {
    pub device: Device,
    pub run_label: String,
}

/// Gives every occurrence of a device a distinct label.
///
/// The first occurrence keeps its name; repeats become `NAME-run2`,
/// `NAME-run3` and so on. Labels become directory names, so two labels clash
/// when their sanitized forms match case-insensitively.
pub fn plan_hosts(devices: &[Device]) -> Vec<PlannedHost> {
    let mut used: HashSet<String> = HashSet::new();
    devices
        .iter()
        .map(|device| {
            let mut label = device.name.clone();
            let mut run = 1;
            while !used.insert(sanitize_host(&label).to_ascii_lowercase()) {
                run += 1;
                label = format!("{}-run{}", device.name, run);
            }
            PlannedHost {
                device: device.clone(),
                run_label: label,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str) -> Device {
        Device {
            name: name.to_string(),
            is_local: false,
        }
    }

    #[test]
    fn test_duplicate_devices_get_distinct_labels() {
        let planned = plan_hosts(&[device("SRV01"), device("SRV02"), device("srv01"), device("SRV01")]);
        let labels: Vec<_> = planned.iter().map(|p| p.run_label.as_str()).collect();
        assert_eq!(labels, vec!["SRV01", "SRV02", "srv01-run2", "SRV01-run3"]);
        assert_eq!(planned[2].device.name, "srv01");
    }

    #[test]
    fn test_label_collision_with_literal_name() {
        let planned = plan_hosts(&[device("a-run2"), device("a"), device("a")]);
        let labels: Vec<_> = planned.iter().map(|p| p.run_label.as_str()).collect();
        assert_eq!(labels, vec!["a-run2", "a", "a-run3"]);
    }

    #[test]
    fn test_labels_sharing_a_folder_are_split() {
        let planned = plan_hosts(&[device("a b"), device("a_b"), device("A?B")]);
        let labels: Vec<_> = planned.iter().map(|p| p.run_label.as_str()).collect();
        assert_eq!(labels, vec!["a b", "a_b-run2", "A?B-run3"]);

        let ctx = SessionContext::new(Config::default(), "wks01");
        let dirs: HashSet<PathBuf> = planned.iter().map(|p| ctx.host_dir(&p.run_label)).collect();
        assert_eq!(dirs.len(), 3);
    }

    #[test]
    fn test_relative_report_root_is_anchored() {
        let mut config = Config::default();
        config.report_root = PathBuf::from("agent-diagnostics");
        let ctx = SessionContext::new(config, "wks01");
        let root = &ctx.config.report_root;
        assert!(root.is_absolute());
        assert_eq!(root, &std::env::current_dir().unwrap().join("agent-diagnostics"));
        assert!(ctx.host_dir("WKS01").is_absolute());
    }

    #[test]
    fn test_correlation_key_carries_run_id() {
        let ctx = SessionContext::new(Config::default(), "wks01");
        let key = ctx.correlation_key("SRV01");
        assert!(key.starts_with("SRV01-"));
        assert!(ctx.run_id.simple().to_string().starts_with(&key[6..]));
    }

    #[test]
    fn test_host_dir_is_under_report_root() {
        let mut config = Config::default();
        config.report_root = PathBuf::from("/reports");
        let ctx = SessionContext::new(config, "wks01");
        assert_eq!(ctx.host_dir("SRV01-run2"), PathBuf::from("/reports/SRV01-run2"));
    }
}
