//! The consolidated session log and the JSON summary.
//!
//! The log is the audit trail of a session: a header, one block per host with
//! every step's command, output, timing and status, a per-host summary, the
//! session summary with recommendations, and a footer. All writes go through
//! one [`ConsolidatedLog`], whose mutex keeps host blocks from interleaving.

use chrono::{DateTime, Local};
use log::warn;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::catalog::DiagnosticStep;
use crate::collector::Confidence;
use crate::error::{Error, Result};
use crate::session::result::{HostResult, SessionResult, SessionStatistics, StepResult};

const RULE: &str = "================================================================================";
const THIN_RULE: &str = "--------------------------------------------------------------------------------";

/// Single writer for the session log file.
pub struct ConsolidatedLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl ConsolidatedLog {
    /// Creates a fresh, timestamped log file under `report_root`.
    ///
    /// Earlier logs are never touched; a name collision gets a numeric suffix.
    pub fn create(report_root: &Path, stamp: &str) -> Result<Self> {
        fs::create_dir_all(report_root).map_err(|e| {
            Error::Report(format!(
                "Failed to create report directory {}: {}",
                report_root.display(),
                e
            ))
        })?;

        let mut path = report_root.join(format!("fleetdiag-{}.log", stamp));
        let mut suffix = 1;
        while path.exists() {
            path = report_root.join(format!("fleetdiag-{}-{}.log", stamp, suffix));
            suffix += 1;
        }

        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                Error::Report(format!(
                    "Failed to create session log {}: {}",
                    path.display(),
                    e
                ))
            })?;

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends lines as one uninterrupted block.
    pub fn write_lines(&self, lines: &[String]) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| Error::Report("session log writer poisoned".to_string()))?;
        for line in lines {
            writeln!(writer, "{}", line)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Appends lines, logging instead of failing once the session is under way.
    pub fn append(&self, lines: &[String]) {
        if let Err(e) = self.write_lines(lines) {
            warn!("Failed to write to {}: {}", self.path.display(), e);
        }
    }
}

/// Narrative for one host: streamed line by line, or held back and written
/// as a single block when hosts run concurrently.
pub struct HostNarrative<'a> {
    log: &'a ConsolidatedLog,
    buffered: bool,
    pending: Vec<String>,
}

impl<'a> HostNarrative<'a> {
    pub fn new(log: &'a ConsolidatedLog, buffered: bool) -> Self {
        Self {
            log,
            buffered,
            pending: Vec::new(),
        }
    }

    pub fn lines<I, S>(&mut self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let lines: Vec<String> = lines.into_iter().map(Into::into).collect();
        if self.buffered {
            self.pending.extend(lines);
        } else {
            self.log.append(&lines);
        }
    }

    pub fn line(&mut self, line: impl Into<String>) {
        self.lines([line.into()]);
    }
}

impl Drop for HostNarrative<'_> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            self.log.append(&self.pending);
        }
    }
}

/// Parameters echoed in the session header.
pub struct HeaderInfo<'a> {
    pub run_id: &'a str,
    pub started_at: DateTime<Local>,
    pub operator_host: &'a str,
    pub tool_path: &'a str,
    pub tool_available: bool,
    pub device_source: &'a str,
    pub devices: &'a [String],
    pub report_root: &'a Path,
    pub max_parallel: usize,
}

pub fn session_header(info: &HeaderInfo<'_>) -> Vec<String> {
    let mut lines = vec![
        RULE.to_string(),
        "AGENT DIAGNOSTICS SESSION".to_string(),
        RULE.to_string(),
        format!("Run ID:        {}", info.run_id),
        format!("Started:       {}", info.started_at.format("%Y-%m-%d %H:%M:%S %z")),
        format!("Operator host: {}", info.operator_host),
        format!(
            "Agent tool:    {} ({})",
            info.tool_path,
            if info.tool_available {
                "found"
            } else {
                "NOT FOUND"
            }
        ),
        format!("Device source: {}", info.device_source),
        format!("Report root:   {}", info.report_root.display()),
        format!("Parallelism:   {}", info.max_parallel),
        format!("Devices ({}):", info.devices.len()),
    ];
    lines.extend(info.devices.iter().map(|d| format!("  - {}", d)));
    lines.push(RULE.to_string());
    lines.push(String::new());
    lines
}

pub fn host_header(host: &HostResult, index: usize, total: usize) -> Vec<String> {
    vec![
        RULE.to_string(),
        format!(
            "DEVICE {}/{}: {} ({})",
            index,
            total,
            host.run_label,
            if host.is_local { "local" } else { "remote" }
        ),
        format!("Started: {}", host.started_at.format("%Y-%m-%d %H:%M:%S")),
        RULE.to_string(),
    ]
}

pub fn step_started(step: &DiagnosticStep, command: &str, total: usize) -> Vec<String> {
    vec![
        THIN_RULE.to_string(),
        format!("Step {}/{}: {}", step.ordinal, total, step.name),
        format!("Command:     {}", command),
        format!("Description: {}", step.description),
        format!("Timestamp:   {}", Local::now().format("%Y-%m-%d %H:%M:%S")),
    ]
}

pub fn step_finished(result: &StepResult) -> Vec<String> {
    let mut lines = vec!["Output:".to_string()];
    if result.output.trim().is_empty() {
        lines.push("  (no output)".to_string());
    } else {
        lines.extend(result.output.lines().map(|l| format!("  {}", l)));
    }
    lines.push(format!("Duration:    {:.2}s", result.duration_seconds));
    lines.push(format!("Exit code:   {}", result.exit_code));
    lines.push(format!(
        "Status:      {}",
        if result.success { "SUCCESS" } else { "FAILED" }
    ));
    if let Some(error) = &result.error {
        lines.push("Error:".to_string());
        lines.extend(error.lines().map(|l| format!("  {}", l)));
    }
    lines
}

pub fn host_summary(host: &HostResult) -> Vec<String> {
    let succeeded = host.step_results.iter().filter(|s| s.success).count();
    let mut lines = vec![
        THIN_RULE.to_string(),
        format!("Summary for {}", host.run_label),
        format!(
            "Result:      {}",
            if host.overall_success() {
                "SUCCESS"
            } else {
                "FAILED"
            }
        ),
        format!(
            "Steps:       {}/{} succeeded",
            succeeded,
            host.step_results.len()
        ),
        format!("Total time:  {:.2}s", host.total_duration_seconds()),
    ];
    push_list(&mut lines, "Errors", &host.errors);
    push_list(&mut lines, "Warnings", &host.warnings);
    let artifacts: Vec<String> = host
        .artifacts
        .iter()
        .map(|a| match a.confidence {
            Confidence::Low => format!("{} [low confidence]", a.display_path()),
            _ => a.display_path(),
        })
        .collect();
    push_list(&mut lines, "Artifacts", &artifacts);
    lines.push(String::new());
    lines
}

pub fn session_summary(result: &SessionResult, recommendations: &[String]) -> Vec<String> {
    let stats = result.statistics();
    let mut lines = vec![
        RULE.to_string(),
        "SESSION SUMMARY".to_string(),
        RULE.to_string(),
        format!("Hosts processed:  {}", stats.total_hosts),
        format!("Successful:       {}", stats.successful_hosts),
        format!("Failed:           {}", stats.failed_hosts),
        format!("Total errors:     {}", stats.total_errors),
        format!("Total warnings:   {}", stats.total_warnings),
    ];

    lines.push("Host results:".to_string());
    for host in result.hosts() {
        lines.push(format!(
            "  [{}] {}",
            if host.overall_success() { "PASS" } else { "FAIL" },
            host.run_label
        ));
    }

    push_list(&mut lines, "Session warnings", &result.warnings);
    push_list(&mut lines, "Artifacts created", &result.artifact_paths());
    push_list(&mut lines, "Recommendations", recommendations);
    lines
}

pub fn footer(log_path: &Path, success: bool) -> Vec<String> {
    vec![
        RULE.to_string(),
        format!(
            "Session {} at {}",
            if success { "SUCCEEDED" } else { "FAILED" },
            Local::now().format("%Y-%m-%d %H:%M:%S")
        ),
        format!("Log file: {}", log_path.display()),
        RULE.to_string(),
    ]
}

/// Operator advice derived from what went wrong.
pub fn recommendations(result: &SessionResult, tool_missing: bool) -> Vec<String> {
    let mut advice = Vec::new();
    let hosts: Vec<&HostResult> = result.hosts().collect();

    if tool_missing {
        advice.push("Install the diagnostic agent on this machine, or set tool_path to its location".to_string());
    }

    let remote_down: Vec<&str> = hosts
        .iter()
        .filter(|h| h.failed_preflight())
        .map(|h| h.run_label.as_str())
        .collect();
    if !remote_down.is_empty() {
        advice.push(format!(
            "Enable remote execution (SSH) on: {}",
            remote_down.join(", ")
        ));
    }

    let remote_only: Vec<&str> = hosts
        .iter()
        .filter(|h| h.artifacts.iter().any(|a| !a.is_local()))
        .map(|h| h.run_label.as_str())
        .collect();
    if !remote_only.is_empty() {
        advice.push(format!(
            "Copy archives left on the targets manually: {}",
            remote_only.join(", ")
        ));
    }

    let step_failures = hosts
        .iter()
        .filter(|h| h.step_results.iter().any(|s| !s.success))
        .count();
    if step_failures > 0 {
        advice.push(format!(
            "Review failed step output above for {} host(s)",
            step_failures
        ));
    }

    if hosts.iter().any(|h| h.incomplete) {
        advice.push("Rerun the session for hosts marked not attempted".to_string());
    }

    if advice.is_empty() {
        advice.push("No action needed".to_string());
    }
    advice
}

fn push_list(lines: &mut Vec<String>, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    lines.push(format!("{}:", title));
    lines.extend(items.iter().map(|i| format!("  - {}", i)));
}

/// Machine-readable companion to the consolidated log.
#[derive(Debug, Serialize)]
pub struct SessionSummary<'a> {
    pub run_id: &'a str,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub success: bool,
    pub log_file: &'a Path,
    pub statistics: SessionStatistics,
    pub recommendations: &'a [String],
    pub result: &'a SessionResult,
}

pub fn write_json_summary(path: &Path, summary: &SessionSummary<'_>) -> Result<()> {
    let json = serde_json::to_string_pretty(summary)
        .map_err(|e| Error::Report(format!("Failed to serialize summary: {}", e)))?;
    fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::result::StepKind;
    use tempfile::TempDir;

    fn step_result(success: bool) -> StepResult {
        StepResult {
            kind: StepKind::Catalog,
            ordinal: 2,
            name: "Health check".to_string(),
            command: "azcmagent check".to_string(),
            success,
            duration_seconds: 1.5,
            exit_code: if success { 0 } else { 1 },
            output: "endpoint ok\nendpoint ok".to_string(),
            error: (!success).then(|| "check failed".to_string()),
        }
    }

    #[test]
    fn test_log_files_never_overwrite() {
        let temp = TempDir::new().unwrap();
        let first = ConsolidatedLog::create(temp.path(), "20261019-120000").unwrap();
        let second = ConsolidatedLog::create(temp.path(), "20261019-120000").unwrap();

        assert_ne!(first.path(), second.path());
        assert!(second
            .path()
            .to_string_lossy()
            .ends_with("fleetdiag-20261019-120000-1.log"));
    }

    #[test]
    fn test_buffered_narrative_is_written_as_one_block() {
        let temp = TempDir::new().unwrap();
        let log = ConsolidatedLog::create(temp.path(), "stamp").unwrap();

        let mut a = HostNarrative::new(&log, true);
        let mut b = HostNarrative::new(&log, true);
        a.line("a1");
        b.line("b1");
        a.line("a2");
        b.line("b2");
        drop(b);
        drop(a);

        let contents = fs::read_to_string(log.path()).unwrap();
        assert_eq!(contents, "b1\nb2\na1\na2\n");
    }

    #[test]
    fn test_streamed_narrative_is_written_immediately() {
        let temp = TempDir::new().unwrap();
        let log = ConsolidatedLog::create(temp.path(), "stamp").unwrap();

        let mut narrative = HostNarrative::new(&log, false);
        narrative.line("first");
        assert_eq!(fs::read_to_string(log.path()).unwrap(), "first\n");
    }

    #[test]
    fn test_step_block_contents() {
        let lines = step_finished(&step_result(false)).join("\n");
        assert!(lines.contains("  endpoint ok"));
        assert!(lines.contains("Duration:    1.50s"));
        assert!(lines.contains("Exit code:   1"));
        assert!(lines.contains("Status:      FAILED"));
        assert!(lines.contains("  check failed"));
    }

    #[test]
    fn test_remote_advice_follows_step_kind_not_wording() {
        let mut result = SessionResult::new();
        let mut host = HostResult::new("srv02", "srv02", false);
        host.record_step(StepResult {
            name: "Remote execution check".to_string(),
            error: Some("Remote execution endpoint rejected the request".to_string()),
            ..step_result(false)
        });
        result.insert(host);

        let advice = recommendations(&result, false).join("\n");
        assert!(!advice.contains("Enable remote execution"));
        assert!(advice.contains("Review failed step output"));
    }

    #[test]
    fn test_recommendations_for_clean_session() {
        let mut result = SessionResult::new();
        let mut host = HostResult::new("srv01", "srv01", true);
        host.record_step(step_result(true));
        result.insert(host);

        assert_eq!(recommendations(&result, false), vec!["No action needed"]);
    }

    #[test]
    fn test_recommendations_name_failures() {
        let mut result = SessionResult::new();
        let mut host = HostResult::new("srv01", "srv01", false);
        host.record_step(StepResult {
            kind: StepKind::Preflight,
            name: "Remote execution pre-flight".to_string(),
            ..step_result(false)
        });
        result.insert(host);

        let advice = recommendations(&result, true).join("\n");
        assert!(advice.contains("Install the diagnostic agent"));
        assert!(advice.contains("Enable remote execution (SSH) on: srv01"));
        assert!(advice.contains("Review failed step output"));
    }
}
