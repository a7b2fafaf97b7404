//! CLI command that runs a diagnostic session.

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use std::path::PathBuf;

use crate::backend::local::missing_tool_error;
use crate::backend::SystemBackendFactory;
use crate::config::{Config, MissingToolPolicy};
use crate::devices::{resolve, LocalIdentity};
use crate::session::{AbortReason, SessionContext, SessionOutcome, SessionRunner};

/// Environment variable holding the SSH password, if one is needed.
pub const PASSWORD_ENV: &str = "FLEETDIAG_PASSWORD";

#[derive(Args)]
#[command(about = "Run agent diagnostics against one or more devices")]
pub struct RunCommand {
    /// Device list file: one host per line, '#' comments
    #[arg(short, long)]
    pub devices: Option<PathBuf>,

    /// Target a single host instead of a device list
    #[arg(long, conflicts_with = "devices")]
    pub host: Option<String>,

    /// Configuration file (defaults to the platform config directory)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Path or name of the diagnostic agent binary
    #[arg(long)]
    pub tool: Option<String>,

    /// Directory receiving the session log and per-host artifacts
    #[arg(long)]
    pub report_root: Option<PathBuf>,

    /// SSH user for remote hosts
    #[arg(long)]
    pub user: Option<String>,

    /// SSH private key for remote hosts
    #[arg(long)]
    pub ssh_key: Option<String>,

    /// SSH port for remote hosts
    #[arg(long)]
    pub port: Option<u16>,

    /// Number of hosts processed at the same time
    #[arg(long)]
    pub parallel: Option<usize>,

    /// Per-step timeout in seconds (no timeout by default)
    #[arg(long)]
    pub step_timeout: Option<u64>,

    /// Keep going when the agent is missing on this machine
    #[arg(long)]
    pub continue_without_tool: bool,
}

impl RunCommand {
    /// Runs the session; the returned flag is the session's overall success.
    pub fn execute(&self) -> Result<bool> {
        let config = self.load_config()?;
        let identity = LocalIdentity::detect();
        let resolution = resolve(self.devices.as_deref(), self.host.as_deref(), &identity);

        print_banner(&config, resolution.devices.len());

        let password = std::env::var(PASSWORD_ENV).ok().filter(|p| !p.is_empty());
        let factory = SystemBackendFactory::new(config.clone(), password);
        let tool_path = config.tool_path.clone();
        let ctx = SessionContext::new(config, identity.hostname());

        let outcome = SessionRunner::new(ctx, &factory)
            .with_progress(true)
            .run(&resolution);

        report_outcome(&outcome, &tool_path);
        Ok(outcome.success)
    }

    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load_from(path),
            None => Config::load(),
        }
        .context("Failed to load configuration")?;

        if let Some(tool) = &self.tool {
            config.tool_path = tool.clone();
        }
        if let Some(root) = &self.report_root {
            config.report_root = root.clone();
        }
        if let Some(user) = &self.user {
            config.remote.user = Some(user.clone());
        }
        if let Some(key) = &self.ssh_key {
            config.remote.ssh_key = Some(key.clone());
        }
        if let Some(port) = self.port {
            config.remote.port = port;
        }
        if let Some(parallel) = self.parallel {
            config.execution.max_parallel_hosts = parallel;
        }
        if let Some(secs) = self.step_timeout {
            config.execution.step_timeout_secs = Some(secs);
        }
        if self.continue_without_tool {
            config.execution.on_missing_tool = MissingToolPolicy::Continue;
        }

        config.validate()?;
        Ok(config)
    }
}

fn print_banner(config: &Config, device_count: usize) {
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Agent Diagnostics: {} device(s)", device_count);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();
    println!("Agent:       {}", config.tool_path);
    println!("Report root: {}", config.report_root.display());
    if config.execution.max_parallel_hosts > 1 {
        println!("Parallel:    {} hosts", config.execution.max_parallel_hosts);
    }
    println!();
}

fn report_outcome(outcome: &SessionOutcome, tool_path: &str) {
    match &outcome.aborted {
        Some(AbortReason::ToolMissingDeclined) => {
            eprintln!("{}", missing_tool_error(tool_path));
            eprintln!("• Or rerun with --continue-without-tool to document its absence");
            eprintln!();
            eprintln!("{}", style("Session aborted before any host was processed").red().bold());
            return;
        }
        Some(AbortReason::Fatal(msg)) => {
            eprintln!("{} {}", style("Session failed:").red().bold(), msg);
            return;
        }
        Some(AbortReason::Cancelled) | None => {}
    }

    let stats = outcome.result.statistics();
    println!();
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Session Summary");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();
    println!("Hosts:      {}", stats.total_hosts);
    println!("  Passed:   {} ✓", stats.successful_hosts);
    println!("  Failed:   {} ✗", stats.failed_hosts);
    println!("Errors:     {}", stats.total_errors);
    println!("Warnings:   {}", stats.total_warnings);
    println!("Artifacts:  {}", stats.total_artifacts);
    if let Some(AbortReason::Cancelled) = outcome.aborted {
        println!("{}", style("Session was cancelled; some hosts were not attempted").yellow());
    }
    println!();

    if outcome.success {
        println!("{}", style("✓ ALL HOSTS PASSED").green().bold());
    } else {
        println!("{}", style("✗ SESSION FAILED").red().bold());
    }
    if let Some(path) = &outcome.log_path {
        println!("Full log: {}", path.display());
    }
    if let Some(path) = &outcome.summary_path {
        println!("Summary:  {}", path.display());
    }
}
