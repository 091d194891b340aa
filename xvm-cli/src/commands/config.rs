//! Config command - show or create `xvm-test.toml`

use anyhow::{Context, Result};
use clap::Subcommand;
use std::path::{Path, PathBuf};
use xvm_testing::config::CONFIG_FILE;
use xvm_testing::TestConfig;

use crate::utils::print_success;

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration
    Show,

    /// Write a configuration file with the default settings
    Init {
        /// Directory to create the file in
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub fn run(cmd: ConfigCommand, config: &TestConfig, source: Option<&Path>) -> Result<()> {
    match cmd {
        ConfigCommand::Show => {
            match source {
                Some(path) => println!("# {}", path.display()),
                None => println!("# effective configuration"),
            }
            print!("{}", toml::to_string_pretty(config)?);
        }
        ConfigCommand::Init { dir, force } => {
            let path = init(&dir, force)?;
            print_success(&format!("wrote {}", path.display()));
        }
    }
    Ok(())
}

/// Writes the default configuration to `dir/xvm-test.toml`.
pub fn init(dir: &Path, force: bool) -> Result<PathBuf> {
    let path = dir.join(CONFIG_FILE);
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    TestConfig::default()
        .to_file(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}
