//! CLI command that previews device resolution.

use anyhow::Result;
use clap::Args;
use console::style;
use std::path::PathBuf;

use crate::devices::{resolve, LocalIdentity};
use crate::session::plan_hosts;

#[derive(Args)]
#[command(about = "Show which devices a session would target")]
pub struct DevicesCommand {
    /// Device list file: one host per line, '#' comments
    #[arg(short, long)]
    pub devices: Option<PathBuf>,

    /// Target a single host instead of a device list
    #[arg(long, conflicts_with = "devices")]
    pub host: Option<String>,
}

impl DevicesCommand {
    pub fn execute(&self) -> Result<()> {
        let identity = LocalIdentity::detect();
        let resolution = resolve(self.devices.as_deref(), self.host.as_deref(), &identity);

        println!("Source: {}", resolution.source);
        if let Some(reason) = &resolution.fallback_reason {
            println!("{} {}", style("Warning:").yellow().bold(), reason);
        }
        println!();

        for (i, planned) in plan_hosts(&resolution.devices).iter().enumerate() {
            let kind = if planned.device.is_local {
                style("local").green()
            } else {
                style("remote").cyan()
            };
            if planned.run_label == planned.device.name {
                println!("  {:>3}. {} ({})", i + 1, planned.device.name, kind);
            } else {
                println!(
                    "  {:>3}. {} ({}, runs as {})",
                    i + 1,
                    planned.device.name,
                    kind,
                    planned.run_label
                );
            }
        }

        println!();
        println!("{} device(s)", resolution.devices.len());
        Ok(())
    }
}
