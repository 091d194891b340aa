//! Fmt command - rewrite filetest directives in their canonical form

use anyhow::{Context, Result};
use clap::Args;
use std::fs;
use std::path::PathBuf;
use tracing::info;
use xvm_testing::Directives;

use crate::utils::{print_success, print_warning};

/// Normalize the directives of filetests
#[derive(Debug, Args)]
pub struct FmtArgs {
    /// Filetests to format
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Only report the files that would change
    #[arg(long)]
    check: bool,
}

pub fn run(args: FmtArgs) -> Result<()> {
    let mut unformatted = Vec::new();

    for input in &args.inputs {
        let source = fs::read_to_string(input)
            .with_context(|| format!("Failed to read file: {}", input.display()))?;
        let Some(formatted) = reformat(&source)? else {
            continue;
        };

        if args.check {
            print_warning(&format!("{} is not formatted", input.display()));
        } else {
            fs::write(input, formatted)
                .with_context(|| format!("Failed to write file: {}", input.display()))?;
            info!("formatted {}", input.display());
        }
        unformatted.push(input);
    }

    if args.check && !unformatted.is_empty() {
        anyhow::bail!("{} file(s) need formatting", unformatted.len());
    }
    if unformatted.is_empty() {
        print_success(&format!("{} file(s) already formatted", args.inputs.len()));
    }
    Ok(())
}

/// The canonical form of `source`, when it differs.
pub fn reformat(source: &str) -> Result<Option<String>> {
    let mut dirs = Directives::parse(source.as_bytes())?;
    dirs.normalize();
    let formatted = dirs.file_test();
    Ok((formatted != source).then_some(formatted))
}
