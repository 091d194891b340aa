//! Directives command - list the directives of a filetest

use anyhow::{Context, Result};
use clap::Args;
use std::fs;
use std::path::PathBuf;
use xvm_testing::{Directive, Directives};

use crate::utils::TableBuilder;

/// List the directives of a filetest
#[derive(Debug, Args)]
pub struct DirectivesArgs {
    /// Filetest to inspect
    input: PathBuf,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table")]
    format: String,

    /// Include the verbatim source chunks
    #[arg(long)]
    all: bool,
}

pub fn run(args: DirectivesArgs) -> Result<()> {
    let source = fs::read(&args.input)
        .with_context(|| format!("Failed to read file: {}", args.input.display()))?;
    let dirs = Directives::parse(&source)
        .with_context(|| format!("Failed to parse directives of {}", args.input.display()))?;

    let selected: Vec<&Directive> = dirs
        .iter()
        .filter(|d| args.all || !d.is_anonymous())
        .collect();

    match args.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&selected)?),
        "table" => print!("{}", render_table(&selected)),
        other => anyhow::bail!("Unknown format: {other} (expected table or json)"),
    }
    Ok(())
}

fn render_table(dirs: &[&Directive]) -> String {
    let mut table = TableBuilder::new(&["Directive", "Lines", "Content"]);
    for dir in dirs {
        let name = if dir.is_anonymous() {
            "(source)".to_string()
        } else {
            dir.name.clone()
        };
        table.row(vec![
            name,
            dir.content.lines().count().to_string(),
            summarize(&dir.content),
        ]);
    }
    table.render()
}

/// First line of `content`, shortened to fit a table cell.
fn summarize(content: &str) -> String {
    const MAX: usize = 40;
    let first = content.lines().next().unwrap_or_default();
    if first.chars().count() > MAX {
        let cut: String = first.chars().take(MAX - 3).collect();
        format!("{cut}...")
    } else {
        first.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_table() {
        let source = "// PKGPATH: x.land/r/demo\npackage demo\n\n// Output:\n// hello\n// world\n";
        let dirs = Directives::parse(source.as_bytes()).unwrap();
        let named: Vec<&Directive> = dirs.iter().filter(|d| !d.is_anonymous()).collect();

        let table = render_table(&named);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[2].starts_with("PKGPATH    1      x.land/r/demo"));
        assert!(lines[3].starts_with("Output     2      hello"));
    }

    #[test]
    fn test_summarize() {
        assert_eq!(summarize(""), "");
        assert_eq!(summarize("short\nsecond"), "short");
        let long = "x".repeat(50);
        assert_eq!(summarize(&long).len(), 40);
        assert!(summarize(&long).ends_with("..."));
    }
}
