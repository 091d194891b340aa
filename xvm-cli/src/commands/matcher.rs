//! Match command - check which test names a run pattern selects

use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use serde::Serialize;
use xvm_testing::{FilterMatch, Matcher, TestConfig};

/// Check which test names a run pattern selects
#[derive(Debug, Args)]
pub struct MatchArgs {
    /// Test names, subtests separated by `/` (e.g. TestFoo/sub or file/a_filetest.x)
    #[arg(required = true)]
    names: Vec<String>,

    /// Run pattern; defaults to `run` from the configuration
    #[arg(short, long)]
    run: Option<String>,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    format: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct MatchOutcome {
    pub name: String,
    pub matched: bool,
    /// A subtest of `name` could still match
    pub partial: bool,
}

pub fn run(args: MatchArgs, config: &TestConfig) -> Result<()> {
    let pattern = args
        .run
        .as_deref()
        .or(config.run.as_deref())
        .context("No run pattern given and none configured")?;
    let outcomes = match_names(pattern, &args.names)?;

    match args.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&outcomes)?),
        "text" => {
            for outcome in &outcomes {
                let status = match (outcome.matched, outcome.partial) {
                    (true, false) => "run".green(),
                    (true, true) => "partial".yellow(),
                    _ => "skip".dimmed(),
                };
                println!("{:<8} {}", status, outcome.name);
            }
        }
        other => anyhow::bail!("Unknown format: {other} (expected text or json)"),
    }
    Ok(())
}

/// Compiles `pattern` and matches every name against it.
pub fn match_names(pattern: &str, names: &[String]) -> Result<Vec<MatchOutcome>> {
    let matcher = Matcher::new();
    let filter = FilterMatch::compile(pattern, &matcher)
        .with_context(|| format!("Invalid run pattern: {pattern}"))?;

    Ok(names
        .iter()
        .map(|name| {
            let elems: Vec<&str> = name.split('/').collect();
            let (matched, partial) = filter.matches(&elems, &matcher);
            MatchOutcome {
                name: name.clone(),
                matched,
                partial,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_match_names() {
        let outcomes = match_names("A/B|C", &names(&["A/B", "C", "A", "D"])).unwrap();
        let flags: Vec<(bool, bool)> = outcomes.iter().map(|o| (o.matched, o.partial)).collect();
        assert_eq!(
            flags,
            vec![(true, false), (true, false), (true, true), (false, false)]
        );
    }

    #[test]
    fn test_invalid_pattern() {
        let err = match_names("Test[", &names(&["TestFoo"])).unwrap_err();
        assert!(err.to_string().contains("Invalid run pattern: Test["));
    }
}
