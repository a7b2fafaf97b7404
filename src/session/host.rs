//! Runs the diagnostic catalog against one host.

use log::{debug, info, warn};
use std::time::{Instant, SystemTime};

use crate::backend::{ArtifactStore, CommandRequest, ExecutionBackend, HostBackend, Preflight};
use crate::catalog::DiagnosticStep;
use crate::collector::{prepare_host_dir, ArtifactCollector};
use crate::remote::diagnose_step_failure;
use crate::remote::diagnostics::summary_line;
use crate::session::context::{PlannedHost, SessionContext};
use crate::session::report::{self, HostNarrative};
use crate::session::result::{HostResult, StepKind, StepResult};

/// Name of the synthesized step recorded when a remote host cannot be driven.
pub const PREFLIGHT_STEP_NAME: &str = "Remote execution pre-flight";

pub struct HostRunCoordinator<'a> {
    ctx: &'a SessionContext,
}

impl<'a> HostRunCoordinator<'a> {
    pub fn new(ctx: &'a SessionContext) -> Self {
        Self { ctx }
    }

    /// Runs every catalog step in order and returns the host's result.
    ///
    /// Step failures never stop the remaining steps. A failed remote
    /// pre-flight records one synthesized step and skips the catalog.
    pub fn run(
        &self,
        host: &PlannedHost,
        backend: &mut dyn HostBackend,
        narrative: &mut HostNarrative<'_>,
        index: usize,
        total: usize,
    ) -> HostResult {
        let device = &host.device;
        let mut result = HostResult::new(&device.name, &host.run_label, device.is_local);
        narrative.lines(report::host_header(&result, index, total));
        info!("[{}/{}] Running diagnostics on {}", index, total, host.run_label);

        if !device.is_local {
            let started = Instant::now();
            let preflight = backend.preflight();
            if let Some(step) = preflight_failure(&preflight, &device.name, started) {
                warn!("{}: {}", device.name, step.error.as_deref().unwrap_or_default());
                narrative.lines(report::step_finished(&step));
                narrative.line("Remaining steps skipped for this host");
                result.record_step(step);
                return self.finish(result, narrative);
            }
            narrative.line(format!("Pre-flight: remote execution available on {}", device.name));
        }

        for (position, step) in self.ctx.steps.iter().enumerate() {
            if self.ctx.cancel.is_cancelled() {
                let remaining: Vec<&str> = self.ctx.steps[position..]
                    .iter()
                    .map(|s| s.name.as_str())
                    .collect();
                let msg = format!("Session cancelled; not attempted: {}", remaining.join(", "));
                warn!("{}: {}", host.run_label, msg);
                narrative.line(msg.clone());
                result.warnings.push(msg);
                result.incomplete = true;
                break;
            }

            let step_result = if step.produces_artifacts {
                self.run_export(host, step, backend, narrative, &mut result)
            } else {
                let command = step.render("");
                self.run_step(step, &command, None, backend, narrative)
            };
            if !step_result.success && self.ctx.cancel.is_cancelled() {
                result.incomplete = true;
            }
            result.record_step(step_result);
        }

        self.finish(result, narrative)
    }

    fn finish(&self, mut result: HostResult, narrative: &mut HostNarrative<'_>) -> HostResult {
        result.finish();
        narrative.lines(report::host_summary(&result));
        info!(
            "{}: {}",
            result.run_label,
            if result.overall_success() {
                "all steps succeeded"
            } else {
                "completed with failures"
            }
        );
        result
    }

    /// Log export: fresh host folder, run-scoped output directory, then collection.
    fn run_export(
        &self,
        host: &PlannedHost,
        step: &DiagnosticStep,
        backend: &mut dyn HostBackend,
        narrative: &mut HostNarrative<'_>,
        result: &mut HostResult,
    ) -> StepResult {
        let device = &host.device;
        let local_dir = self.ctx.host_dir(&host.run_label);

        if let Err(e) = prepare_host_dir(&local_dir) {
            let error = format!("Could not prepare {}: {}", local_dir.display(), e);
            return self.setup_failure(step, &step.command_line, error, narrative);
        }

        let key = self.ctx.correlation_key(&host.run_label);
        let output_dir = match backend.prepare_output_dir(&local_dir, &key) {
            Ok(dir) => dir,
            Err(e) => {
                let error = format!("Could not create output directory on {}: {}", device.name, e);
                return self.setup_failure(step, &step.command_line, error, narrative);
            }
        };
        debug!("{}: export output directory {}", host.run_label, output_dir);

        let command = step.render(&output_dir);
        let since = SystemTime::now();
        let step_result = self.run_step(step, &command, Some(&output_dir), backend, narrative);

        let collector = ArtifactCollector::new(
            &self.ctx.config.artifacts,
            self.ctx.process_name.as_str(),
            self.ctx.clock(),
            &self.ctx.cancel,
        );
        let collection = collector.collect(
            backend,
            &device.name,
            device.is_local,
            &output_dir,
            &local_dir,
            since,
        );
        narrative.lines(collection.narrative);
        narrative.lines(collection.warnings.iter().map(|w| format!("Warning: {}", w)));
        result.warnings.extend(collection.warnings);
        result.artifacts.extend(collection.artifacts);

        step_result
    }

    fn run_step(
        &self,
        step: &DiagnosticStep,
        command: &str,
        working_dir: Option<&str>,
        backend: &mut dyn HostBackend,
        narrative: &mut HostNarrative<'_>,
    ) -> StepResult {
        narrative.lines(report::step_started(step, command, self.ctx.steps.len()));

        let mut request = CommandRequest::new(command)
            .with_timeout(self.ctx.step_timeout())
            .with_cancellation(&self.ctx.cancel);
        if let Some(dir) = working_dir {
            request = request.in_dir(dir);
        }

        let started = Instant::now();
        let (result, hint) = match backend.run(&request) {
            Ok(output) => {
                let text = output.combined();
                let diagnosis = (!output.is_success()).then(|| {
                    diagnose_step_failure(
                        output.exit_code,
                        &text,
                        command,
                        backend.host(),
                        backend.is_local(),
                    )
                });
                let result = StepResult {
                    kind: StepKind::Catalog,
                    ordinal: step.ordinal,
                    name: step.name.clone(),
                    command: command.to_string(),
                    success: output.is_success(),
                    duration_seconds: output.duration.as_secs_f64(),
                    exit_code: output.exit_code,
                    output: text,
                    error: diagnosis.as_deref().map(|d| summary_line(d).to_string()),
                };
                (result, diagnosis)
            }
            Err(e) => {
                let result = StepResult {
                    kind: StepKind::Catalog,
                    ordinal: step.ordinal,
                    name: step.name.clone(),
                    command: command.to_string(),
                    success: false,
                    duration_seconds: started.elapsed().as_secs_f64(),
                    exit_code: -1,
                    output: String::new(),
                    error: Some(e.to_string()),
                };
                (result, None)
            }
        };

        if !result.success {
            warn!(
                "{} failed on {}: {}",
                step.name,
                backend.host(),
                result.error.as_deref().unwrap_or_default()
            );
        }
        narrative.lines(report::step_finished(&result));
        if let Some(hint) = hint {
            narrative.lines(hint.lines().skip(1).map(str::to_string));
        }
        result
    }

    fn setup_failure(
        &self,
        step: &DiagnosticStep,
        command: &str,
        error: String,
        narrative: &mut HostNarrative<'_>,
    ) -> StepResult {
        warn!("{}", error);
        narrative.lines(report::step_started(step, command, self.ctx.steps.len()));
        let result = StepResult {
            kind: StepKind::Catalog,
            ordinal: step.ordinal,
            name: step.name.clone(),
            command: command.to_string(),
            success: false,
            duration_seconds: 0.0,
            exit_code: -1,
            output: String::new(),
            error: Some(error),
        };
        narrative.lines(report::step_finished(&result));
        result
    }
}

/// The single step recorded for a host whose pre-flight failed.
fn preflight_failure(preflight: &Preflight, host: &str, started: Instant) -> Option<StepResult> {
    let (summary, detail) = match preflight {
        Preflight::Ready => return None,
        Preflight::Unreachable(detail) => (format!("{} is unreachable", host), detail),
        Preflight::RemoteUnavailable(detail) => {
            (format!("remote execution is not available on {}", host), detail)
        }
    };
    Some(StepResult {
        kind: StepKind::Preflight,
        ordinal: 0,
        name: PREFLIGHT_STEP_NAME.to_string(),
        command: format!("remote session probe ({})", host),
        success: false,
        duration_seconds: started.elapsed().as_secs_f64(),
        exit_code: -1,
        output: detail.clone(),
        error: Some(summary),
    })
}
