//! Step, host and session result records.
//!
//! Success flags and counts are always derived from the step records they
//! summarise; nothing here stores an independent verdict.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::collector::CollectedArtifact;

/// What produced a step record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Catalog,
    /// Synthesized when a remote host failed its pre-flight
    Preflight,
}

/// Outcome of one catalog step on one host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    pub kind: StepKind,
    pub ordinal: usize,
    pub name: String,
    pub command: String,
    pub success: bool,
    pub duration_seconds: f64,
    /// -1 when the command never produced an exit code
    pub exit_code: i32,
    pub output: String,
    pub error: Option<String>,
}

/// Everything that happened to one host during a session.
#[derive(Debug, Clone, Serialize)]
pub struct HostResult {
    pub host_name: String,
    /// Distinguishes repeated runs of the same host within a session
    pub run_label: String,
    pub is_local: bool,
    pub step_results: Vec<StepResult>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
    pub artifacts: Vec<CollectedArtifact>,
    /// Set when the run stopped before the catalog was exhausted by choice
    /// of the session (cancellation), not by a step or pre-flight failure.
    pub incomplete: bool,
}

impl HostResult {
    pub fn new(host_name: impl Into<String>, run_label: impl Into<String>, is_local: bool) -> Self {
        Self {
            host_name: host_name.into(),
            run_label: run_label.into(),
            is_local,
            step_results: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
            started_at: Local::now(),
            finished_at: None,
            artifacts: Vec::new(),
            incomplete: false,
        }
    }

    /// A host the session never got to.
    pub fn not_attempted(host_name: &str, run_label: &str, is_local: bool, reason: &str) -> Self {
        let mut result = Self::new(host_name, run_label, is_local);
        result.incomplete = true;
        result.warnings.push(format!("Not attempted: {}", reason));
        result.finished_at = Some(result.started_at);
        result
    }

    /// True iff every recorded step succeeded and the run was not cut short.
    pub fn overall_success(&self) -> bool {
        !self.incomplete && self.step_results.iter().all(|s| s.success)
    }

    /// The host could not be driven remotely at all.
    pub fn failed_preflight(&self) -> bool {
        self.step_results
            .iter()
            .any(|s| s.kind == StepKind::Preflight && !s.success)
    }

    pub fn record_step(&mut self, step: StepResult) {
        if !step.success {
            let detail = step
                .error
                .clone()
                .unwrap_or_else(|| format!("exit code {}", step.exit_code));
            self.errors.push(format!("{}: {}", step.name, detail));
        }
        self.step_results.push(step);
    }

    pub fn artifact_paths(&self) -> Vec<String> {
        self.artifacts.iter().map(|a| a.display_path()).collect()
    }

    pub fn total_duration_seconds(&self) -> f64 {
        self.step_results.iter().map(|s| s.duration_seconds).sum()
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Local::now());
    }
}

/// Counts derived from the host map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStatistics {
    pub total_hosts: usize,
    pub successful_hosts: usize,
    pub failed_hosts: usize,
    pub total_errors: usize,
    pub total_warnings: usize,
    pub total_artifacts: usize,
}

/// All host results of a session, keyed by run label.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionResult {
    hosts: BTreeMap<String, HostResult>,
    /// Session-level warnings (tool missing, device list fallback)
    pub warnings: Vec<String>,
}

impl SessionResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, result: HostResult) {
        self.hosts.insert(result.run_label.clone(), result);
    }

    pub fn get(&self, run_label: &str) -> Option<&HostResult> {
        self.hosts.get(run_label)
    }

    /// Hosts in run-label order.
    pub fn hosts(&self) -> impl Iterator<Item = &HostResult> {
        self.hosts.values()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn statistics(&self) -> SessionStatistics {
        let successful_hosts = self.hosts().filter(|h| h.overall_success()).count();
        SessionStatistics {
            total_hosts: self.hosts.len(),
            successful_hosts,
            failed_hosts: self.hosts.len() - successful_hosts,
            total_errors: self.hosts().map(|h| h.errors.len()).sum(),
            total_warnings: self.warnings.len()
                + self.hosts().map(|h| h.warnings.len()).sum::<usize>(),
            total_artifacts: self.hosts().map(|h| h.artifacts.len()).sum(),
        }
    }

    pub fn artifact_paths(&self) -> Vec<String> {
        self.hosts().flat_map(|h| h.artifact_paths()).collect()
    }

    /// AND of every host's success; an empty session is not a success.
    pub fn all_succeeded(&self) -> bool {
        !self.hosts.is_empty() && self.hosts().all(|h| h.overall_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(ordinal: usize, success: bool) -> StepResult {
        StepResult {
            kind: StepKind::Catalog,
            ordinal,
            name: format!("Step {}", ordinal),
            command: "agent".to_string(),
            success,
            duration_seconds: 0.5,
            exit_code: if success { 0 } else { 1 },
            output: String::new(),
            error: None,
        }
    }

    #[test]
    fn test_overall_success_is_derived_from_steps() {
        // Every combination of up to three step outcomes.
        for len in 0..=3usize {
            for mask in 0..(1u32 << len) {
                let mut host = HostResult::new("srv01", "srv01", false);
                let outcomes: Vec<bool> = (0..len).map(|i| mask & (1 << i) != 0).collect();
                for (i, ok) in outcomes.iter().enumerate() {
                    host.record_step(step(i + 1, *ok));
                }
                assert_eq!(
                    host.overall_success(),
                    outcomes.iter().all(|ok| *ok),
                    "outcomes {:?}",
                    outcomes
                );
                assert_eq!(host.errors.len(), outcomes.iter().filter(|ok| !**ok).count());
            }
        }
    }

    #[test]
    fn test_failed_step_error_names_the_step() {
        let mut host = HostResult::new("srv01", "srv01", true);
        let mut failed = step(2, false);
        failed.name = "Health check".to_string();
        failed.error = Some("'agent check' exited with code 1".to_string());
        host.record_step(failed);

        assert_eq!(host.errors.len(), 1);
        assert!(host.errors[0].starts_with("Health check"));
    }

    #[test]
    fn test_not_attempted_is_never_successful() {
        let host = HostResult::not_attempted("srv01", "srv01", false, "session cancelled");
        assert!(host.step_results.is_empty());
        assert!(!host.overall_success());
        assert!(host.warnings[0].contains("session cancelled"));
    }

    #[test]
    fn test_statistics_are_recomputed_from_hosts() {
        let mut session = SessionResult::new();

        let mut ok = HostResult::new("a", "a", true);
        ok.record_step(step(1, true));
        session.insert(ok);

        let mut bad = HostResult::new("b", "b", false);
        bad.record_step(step(1, false));
        bad.warnings.push("slow".to_string());
        session.insert(bad);

        session.warnings.push("tool missing".to_string());

        let stats = session.statistics();
        assert_eq!(stats.total_hosts, 2);
        assert_eq!(stats.successful_hosts, 1);
        assert_eq!(stats.failed_hosts, 1);
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.total_warnings, 2);
        assert!(!session.all_succeeded());
    }

    #[test]
    fn test_hosts_iterate_in_label_order() {
        let mut session = SessionResult::new();
        for label in ["srv-c", "srv-a", "srv-b"] {
            session.insert(HostResult::new(label, label, false));
        }
        let labels: Vec<_> = session.hosts().map(|h| h.run_label.as_str()).collect();
        assert_eq!(labels, vec!["srv-a", "srv-b", "srv-c"]);
    }

    #[test]
    fn test_empty_session_is_not_success() {
        assert!(!SessionResult::new().all_succeeded());
    }
}
