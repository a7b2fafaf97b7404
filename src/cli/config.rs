//! CLI command for managing the fleetdiag configuration file.

use anyhow::{anyhow, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::config::Config;

#[derive(Args)]
#[command(about = "Manage fleetdiag configuration")]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show {
        /// Configuration file (defaults to the platform config directory)
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Show the configuration file path
    Path,

    /// Write a configuration file with default values
    Init {
        /// Configuration file (defaults to the platform config directory)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite existing configuration
        #[arg(long)]
        force: bool,
    },
}

impl ConfigCommand {
    pub fn execute(&self) -> Result<()> {
        match &self.action {
            ConfigAction::Show { path } => self.show_config(path.clone()),
            ConfigAction::Path => self.show_path(),
            ConfigAction::Init { path, force } => self.init_config(path.clone(), *force),
        }
    }

    fn show_config(&self, path: Option<PathBuf>) -> Result<()> {
        let path = resolve_path(path)?;
        let config = Config::load_from(&path)?;

        if !path.exists() {
            println!("# No configuration file at {}; showing defaults", path.display());
        }
        print!("{}", config.to_yaml()?);
        Ok(())
    }

    fn show_path(&self) -> Result<()> {
        match Config::default_path() {
            Some(path) => {
                println!("Configuration file path: {}", path.display());
                if path.exists() {
                    println!("Status: File exists");
                } else {
                    println!("Status: File does not exist");
                }
            }
            None => {
                println!("Could not determine configuration directory");
            }
        }

        Ok(())
    }

    fn init_config(&self, path: Option<PathBuf>, force: bool) -> Result<()> {
        let path = resolve_path(path)?;

        if path.exists() && !force {
            return Err(anyhow!(
                "Configuration file already exists at {}\n\
                 Use --force to overwrite",
                path.display()
            ));
        }

        Config::default().save_to(&path)?;

        println!("Created configuration file at: {}", path.display());
        println!();
        println!("Edit it to set the agent path, SSH user and key, and report location.");
        Ok(())
    }
}

fn resolve_path(path: Option<PathBuf>) -> Result<PathBuf> {
    path.or_else(Config::default_path)
        .ok_or_else(|| anyhow!("Could not determine configuration directory; pass --path"))
}
