//! xvm CLI - developer tools for filetests
//!
//! Inspects and re-formats filetest directives, checks run patterns against
//! test names and manages the filetest result cache.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use tracing::{debug, error};
use xvm_testing::TestConfig;

mod commands;
mod utils;

use commands::*;

/// xvm CLI - developer tools for filetests
#[derive(Parser)]
#[command(name = "xvm")]
#[command(about = "Developer tools for xvm filetests")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path (defaults to ./xvm-test.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the directives of a filetest
    Directives(DirectivesArgs),

    /// Normalize the directives of filetests
    Fmt(FmtArgs),

    /// Check which test names a run pattern selects
    Match(MatchArgs),

    /// Inspect or clear the filetest result cache
    #[command(subcommand)]
    Cache(CacheCommand),

    /// Show or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;

    let config = load_config(cli.config.as_ref())?;
    debug!(?config, "configuration loaded");

    let result = match cli.command {
        Commands::Directives(args) => directives::run(args),
        Commands::Fmt(args) => fmt::run(args),
        Commands::Match(args) => matcher::run(args, &config),
        Commands::Cache(cmd) => cache::run(cmd, &config),
        Commands::Config(cmd) => config::run(cmd, &config, cli.config.as_deref()),
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("Command failed: {:#}", e);
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<TestConfig> {
    let config = match path {
        Some(path) => TestConfig::from_file(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => {
            let cwd = std::env::current_dir().context("Failed to get current directory")?;
            TestConfig::load_or_default(&cwd)?
        }
    };
    config.validate()?;
    Ok(config)
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}
