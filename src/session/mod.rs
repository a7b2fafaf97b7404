//! Session aggregation: drives every host through the catalog and writes
//! the consolidated report.

pub mod context;
pub mod host;
pub mod report;
pub mod result;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use rayon::prelude::*;
use std::path::PathBuf;

use crate::backend::local::locate_tool;
use crate::backend::BackendFactory;
use crate::config::MissingToolPolicy;
use crate::devices::Resolution;

pub use context::{plan_hosts, PlannedHost, SessionContext};
pub use host::HostRunCoordinator;
pub use report::ConsolidatedLog;
pub use result::{HostResult, SessionResult, SessionStatistics, StepKind, StepResult};

use report::{HeaderInfo, HostNarrative, SessionSummary};

/// Why a session stopped before processing every host normally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The agent is missing locally and the policy said not to continue.
    ToolMissingDeclined,
    /// Something outside any single host failed, e.g. the log could not be created.
    Fatal(String),
    Cancelled,
}

#[derive(Debug)]
pub struct SessionOutcome {
    /// AND of every host's overall success; false for aborted sessions and
    /// whenever the local agent was missing
    pub success: bool,
    pub result: SessionResult,
    pub log_path: Option<PathBuf>,
    pub summary_path: Option<PathBuf>,
    pub aborted: Option<AbortReason>,
}

impl SessionOutcome {
    fn aborted(reason: AbortReason, result: SessionResult, log_path: Option<PathBuf>) -> Self {
        Self {
            success: false,
            result,
            log_path,
            summary_path: None,
            aborted: Some(reason),
        }
    }
}

/// Drives one session end to end.
pub struct SessionRunner<'a> {
    ctx: SessionContext,
    factory: &'a dyn BackendFactory,
    tool_probe: fn(&str) -> bool,
    show_progress: bool,
}

impl<'a> SessionRunner<'a> {
    pub fn new(ctx: SessionContext, factory: &'a dyn BackendFactory) -> Self {
        Self {
            ctx,
            factory,
            tool_probe: |tool| locate_tool(tool).is_some(),
            show_progress: false,
        }
    }

    /// Replaces the local lookup of the agent binary.
    pub fn with_tool_probe(mut self, probe: fn(&str) -> bool) -> Self {
        self.tool_probe = probe;
        self
    }

    /// Prints live progress to the terminal.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn run(mut self, resolution: &Resolution) -> SessionOutcome {
        let mut session = SessionResult::new();
        if let Some(reason) = &resolution.fallback_reason {
            session
                .warnings
                .push(format!("{}; targeting the local machine only", reason));
        }

        if let Some(outcome) = self.check_tool(resolution, &mut session) {
            return outcome;
        }

        let log = match ConsolidatedLog::create(&self.ctx.config.report_root, &self.ctx.stamp()) {
            Ok(log) => log,
            Err(e) => {
                error!("{}", e);
                return SessionOutcome::aborted(AbortReason::Fatal(e.to_string()), session, None);
            }
        };
        info!("Session log: {}", log.path().display());

        let planned = plan_hosts(&resolution.devices);
        let labels: Vec<String> = planned.iter().map(|p| p.run_label.clone()).collect();
        let operator_host = self.ctx.operator_host.clone();
        let run_id = self.ctx.run_id.to_string();
        let header = report::session_header(&HeaderInfo {
            run_id: &run_id,
            started_at: self.ctx.started_at,
            operator_host: &operator_host,
            tool_path: &self.ctx.config.tool_path,
            tool_available: self.ctx.tool_available,
            device_source: &resolution.source,
            devices: &labels,
            report_root: &self.ctx.config.report_root,
            max_parallel: self.ctx.config.execution.max_parallel_hosts.max(1),
        });
        if let Err(e) = log.write_lines(&header) {
            error!("{}", e);
            return SessionOutcome::aborted(
                AbortReason::Fatal(e.to_string()),
                session,
                Some(log.path().to_path_buf()),
            );
        }

        for host in self.run_hosts(&planned, &log) {
            session.insert(host);
        }

        let cancelled = session.hosts().any(|h| h.incomplete);
        // A missing local agent fails the session even when every step passed.
        let success = self.ctx.tool_available && session.all_succeeded();
        let recommendations = report::recommendations(&session, !self.ctx.tool_available);
        log.append(&report::session_summary(&session, &recommendations));
        log.append(&report::footer(log.path(), success));

        let summary_path = log.path().with_extension("json");
        let summary = SessionSummary {
            run_id: &run_id,
            started_at: self.ctx.started_at,
            finished_at: chrono::Local::now(),
            success,
            log_file: log.path(),
            statistics: session.statistics(),
            recommendations: &recommendations,
            result: &session,
        };
        let summary_path = match report::write_json_summary(&summary_path, &summary) {
            Ok(()) => Some(summary_path),
            Err(e) => {
                warn!("Failed to write {}: {}", summary_path.display(), e);
                None
            }
        };

        SessionOutcome {
            success,
            log_path: Some(log.path().to_path_buf()),
            summary_path,
            aborted: cancelled.then_some(AbortReason::Cancelled),
            result: session,
        }
    }

    /// Looks for the agent when the local machine is a target.
    fn check_tool(
        &mut self,
        resolution: &Resolution,
        session: &mut SessionResult,
    ) -> Option<SessionOutcome> {
        if !resolution.has_local() {
            return None;
        }

        let tool = self.ctx.config.tool_path.clone();
        if (self.tool_probe)(&tool) {
            self.ctx.tool_available = true;
            return None;
        }

        self.ctx.tool_available = false;
        let msg = format!("Diagnostic tool '{}' was not found on this machine", tool);
        warn!("{}", msg);

        match self.ctx.config.execution.on_missing_tool {
            MissingToolPolicy::Abort => {
                error!("Aborting before any host was processed");
                Some(SessionOutcome::aborted(
                    AbortReason::ToolMissingDeclined,
                    std::mem::take(session),
                    None,
                ))
            }
            MissingToolPolicy::Continue => {
                session
                    .warnings
                    .push(format!("{}; local steps are expected to fail", msg));
                None
            }
        }
    }

    fn run_hosts(&self, planned: &[PlannedHost], log: &ConsolidatedLog) -> Vec<HostResult> {
        let total = planned.len();
        let workers = self.ctx.config.execution.max_parallel_hosts.max(1);

        if workers > 1 && total > 1 {
            match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
                Ok(pool) => {
                    let progress = self.show_progress.then(|| progress_bar(total));
                    let results: Vec<HostResult> = pool.install(|| {
                        planned
                            .par_iter()
                            .enumerate()
                            .map(|(i, host)| {
                                let result = self.run_host(host, i + 1, total, log);
                                if let Some(pb) = &progress {
                                    pb.set_message(host.run_label.clone());
                                    pb.inc(1);
                                }
                                result
                            })
                            .collect()
                    });
                    if let Some(pb) = progress {
                        pb.finish_and_clear();
                    }
                    return results;
                }
                Err(e) => warn!("Could not start worker pool ({}); running hosts one at a time", e),
            }
        }

        planned
            .iter()
            .enumerate()
            .map(|(i, host)| {
                if self.show_progress {
                    println!(
                        "[{}/{}] {}",
                        i + 1,
                        total,
                        style(&host.run_label).bold()
                    );
                }
                let result = self.run_host(host, i + 1, total, log);
                if self.show_progress {
                    print_host_line(&result);
                }
                result
            })
            .collect()
    }

    fn run_host(
        &self,
        host: &PlannedHost,
        index: usize,
        total: usize,
        log: &ConsolidatedLog,
    ) -> HostResult {
        let device = &host.device;
        if self.ctx.cancel.is_cancelled() {
            log.append(&[format!(
                "DEVICE {}/{}: {} not attempted (session cancelled)",
                index, total, host.run_label
            )]);
            return HostResult::not_attempted(
                &device.name,
                &host.run_label,
                device.is_local,
                "session cancelled",
            );
        }

        let mut backend = self.factory.open(&device.name, device.is_local);
        let mut narrative = HostNarrative::new(log, self.ctx.is_parallel());
        let result = HostRunCoordinator::new(&self.ctx).run(
            host,
            backend.as_mut(),
            &mut narrative,
            index,
            total,
        );
        result
    }
}

fn progress_bar(total: usize) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} hosts {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

fn print_host_line(result: &HostResult) {
    for step in &result.step_results {
        let mark = if step.success {
            style("✓").green()
        } else {
            style("✗").red()
        };
        println!("    {} {} ({:.1}s)", mark, step.name, step.duration_seconds);
    }
    for artifact in &result.artifacts {
        println!("    {} {}", style("→").cyan(), artifact.display_path());
    }
}
