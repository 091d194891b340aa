//! Cache command - inspect or clear the filetest result cache

use anyhow::{Context, Result};
use clap::Subcommand;
use std::path::PathBuf;
use xvm_testing::{ResultCache, TestConfig};

use crate::utils::{format_file_size, print_success};

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Show the number and size of cached results
    Stats {
        /// Cache directory; defaults to `cache_dir` from the configuration
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Remove cached results
    Clear {
        /// Only forget the result of these filetests
        files: Vec<PathBuf>,

        /// Cache directory; defaults to `cache_dir` from the configuration
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

pub fn run(cmd: CacheCommand, config: &TestConfig) -> Result<()> {
    match cmd {
        CacheCommand::Stats { dir } => {
            let cache = open(dir, config)?;
            let stats = cache.stats()?;
            println!("Cache directory: {}", cache.cache_dir().display());
            println!("Entries:         {}", stats.total_entries);
            println!("Size:            {}", format_file_size(stats.total_size_bytes));
        }
        CacheCommand::Clear { files, dir } => {
            let cache = open(dir, config)?;
            if files.is_empty() {
                cache.clear_all()?;
                print_success(&format!("cleared {}", cache.cache_dir().display()));
            } else {
                for file in &files {
                    cache
                        .clear(file)
                        .with_context(|| format!("Failed to clear {}", file.display()))?;
                }
                print_success(&format!("cleared {} cached result(s)", files.len()));
            }
        }
    }
    Ok(())
}

fn open(dir: Option<PathBuf>, config: &TestConfig) -> Result<ResultCache> {
    let dir = dir.unwrap_or_else(|| config.cache_dir.clone());
    ResultCache::new(&dir).with_context(|| format!("Failed to open cache: {}", dir.display()))
}
