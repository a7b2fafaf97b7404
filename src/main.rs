use anyhow::Result;
use clap::{Parser, Subcommand};

use fleetdiag::cli::config::ConfigCommand;
use fleetdiag::cli::devices::DevicesCommand;
use fleetdiag::cli::run::RunCommand;

#[derive(Parser)]
#[command(name = "fleetdiag")]
#[command(about = "Runs agent diagnostics across a fleet of hosts and collects their logs", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Run(RunCommand),
    Devices(DevicesCommand),
    Config(ConfigCommand),
}

fn main() -> Result<()> {
    // Initialize logging with INFO level by default
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(cmd) => {
            if !cmd.execute()? {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Devices(cmd) => cmd.execute(),
        Commands::Config(cmd) => cmd.execute(),
    }
}
