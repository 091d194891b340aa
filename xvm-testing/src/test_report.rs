//! Test reporting
//!
//! Reporters receive the progress of a package run and render it. The console
//! reporter prints the familiar `=== RUN` / `--- PASS` lines.

use std::io::Write;
use std::time::Duration;

use colored::Colorize;

use crate::test_runner::{fmt_duration, TestResult};

/// Outcome of the tests of one package.
#[derive(Debug, Default)]
pub struct TestReport {
    /// Package path
    pub name: String,

    /// Results in execution order
    pub results: Vec<(String, TestResult)>,

    pub duration_ms: u64,

    pub stats: TestStats,

    /// Percentage of covered statements, when coverage is enabled
    pub coverage: Option<f64>,

    /// One line per failed test
    pub errors: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TestStats {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cached: usize,
}

impl TestReport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn add_result(&mut self, name: impl Into<String>, result: TestResult) {
        let name = name.into();
        self.stats.total += 1;

        match &result {
            TestResult::Pass { .. } => self.stats.passed += 1,
            TestResult::Fail { .. } => {
                self.stats.failed += 1;
                self.errors.push(format!("{name} failed"));
            }
            TestResult::Skipped { .. } => self.stats.skipped += 1,
            TestResult::Cached { .. } => {
                self.stats.cached += 1;
                self.stats.passed += 1;
            }
        }

        self.results.push((name, result));
    }

    /// Records a failure that is not tied to a single test, such as a
    /// package whose test files do not load. Counts as one failed run.
    pub fn add_error(&mut self, error: impl Into<String>) {
        self.stats.total += 1;
        self.stats.failed += 1;
        self.errors.push(error.into());
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn cache_hit_rate(&self) -> f64 {
        if self.stats.total == 0 {
            0.0
        } else {
            (self.stats.cached as f64) / (self.stats.total as f64) * 100.0
        }
    }

    pub fn result(&self, name: &str) -> Option<&TestResult> {
        self.results
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, r)| r)
    }

    /// Turns failures into an error listing them.
    pub fn check(&self) -> crate::error::Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(crate::error::TestError::Failed(self.errors.clone()))
        }
    }
}

/// Receives the progress of a run.
pub trait TestReporter {
    fn on_suite_start(&mut self, _name: &str) {}

    fn on_test_start(&mut self, _name: &str) {}

    /// Extra diagnostics about a test: runtime metrics, emitted events.
    fn on_test_info(&mut self, _name: &str, _info: &str) {}

    fn on_test_finish(&mut self, name: &str, result: &TestResult);

    fn on_suite_finish(&mut self, _report: &TestReport) {}
}

/// Prints progress as text.
pub struct ConsoleReporter<W: Write> {
    out: W,
    verbose: bool,
    color: bool,
}

impl<W: Write> ConsoleReporter<W> {
    pub fn new(out: W, verbose: bool) -> Self {
        Self {
            out,
            verbose,
            color: false,
        }
    }

    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn status(&self, text: &str) -> String {
        if !self.color {
            return text.to_string();
        }
        match text {
            "PASS" | "ok" => text.green().to_string(),
            "FAIL" => text.red().bold().to_string(),
            "SKIP" => text.yellow().to_string(),
            _ => text.to_string(),
        }
    }

    // Console write failures are not test failures.
    fn line(&mut self, text: &str) {
        let _ = writeln!(self.out, "{text}");
    }
}

impl<W: Write> TestReporter for ConsoleReporter<W> {
    fn on_test_start(&mut self, name: &str) {
        if self.verbose {
            self.line(&format!("=== RUN   {name}"));
        }
    }

    fn on_test_info(&mut self, _name: &str, info: &str) {
        self.line(info);
    }

    fn on_test_finish(&mut self, name: &str, result: &TestResult) {
        match result {
            TestResult::Pass { duration_ms, output } => {
                if self.verbose {
                    let status = self.status("PASS");
                    self.line(&format!("--- {status}: {name} ({})", fmt_ms(*duration_ms)));
                    if let Some(output) = output.as_deref().filter(|o| !o.is_empty()) {
                        let _ = write!(self.out, "{output}");
                    }
                }
            }
            TestResult::Cached { .. } => {
                if self.verbose {
                    let status = self.status("PASS");
                    self.line(&format!("--- {status}: {name} (cached)"));
                }
            }
            TestResult::Skipped { reason } => {
                if self.verbose {
                    let status = self.status("SKIP");
                    self.line(&format!("--- {status}: {name} ({reason})"));
                }
            }
            TestResult::Fail {
                duration_ms, error, ..
            } => {
                let status = self.status("FAIL");
                self.line(&format!("--- {status}: {name} ({})", fmt_ms(*duration_ms)));
                self.line(error);
            }
        }
    }

    fn on_suite_finish(&mut self, report: &TestReport) {
        if let Some(pct) = report.coverage {
            self.line(&format!("coverage: {pct:.1}% of statements"));
        }
        let elapsed = fmt_ms(report.duration_ms);
        let status = if report.is_success() {
            self.status("ok")
        } else {
            self.status("FAIL")
        };
        let mut summary = format!("{status:<7} {} {elapsed}", report.name);
        if self.verbose && report.stats.cached > 0 {
            summary.push_str(&format!(
                " ({} cached, {:.1}% hit rate)",
                report.stats.cached,
                report.cache_hit_rate()
            ));
        }
        self.line(&summary);
    }
}

/// Prints a single JSON document once the run is over.
pub struct JsonReporter<W: Write> {
    out: W,
}

impl<W: Write> JsonReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> TestReporter for JsonReporter<W> {
    fn on_test_finish(&mut self, _name: &str, _result: &TestResult) {}

    fn on_suite_finish(&mut self, report: &TestReport) {
        let json_report = serde_json::json!({
            "name": report.name,
            "duration_ms": report.duration_ms,
            "stats": {
                "total": report.stats.total,
                "passed": report.stats.passed,
                "failed": report.stats.failed,
                "skipped": report.stats.skipped,
                "cached": report.stats.cached,
                "cache_hit_rate": report.cache_hit_rate(),
            },
            "coverage": report.coverage,
            "success": report.is_success(),
            "errors": report.errors,
            "results": report.results.iter().map(|(name, result)| {
                let mut entry = match result {
                    TestResult::Pass { duration_ms, output } => serde_json::json!({
                        "status": "pass",
                        "duration_ms": duration_ms,
                        "output": output,
                    }),
                    TestResult::Fail { duration_ms, error, output } => serde_json::json!({
                        "status": "fail",
                        "duration_ms": duration_ms,
                        "error": error,
                        "output": output,
                    }),
                    TestResult::Skipped { reason } => serde_json::json!({
                        "status": "skipped",
                        "reason": reason,
                    }),
                    TestResult::Cached { cache_hit_time, .. } => serde_json::json!({
                        "status": "cached",
                        "cache_hit_time": cache_hit_time,
                    }),
                };
                entry["name"] = serde_json::Value::String(name.clone());
                entry
            }).collect::<Vec<_>>(),
        });

        let _ = writeln!(self.out, "{json_report:#}");
    }
}

fn fmt_ms(ms: u64) -> String {
    fmt_duration(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pass() -> TestResult {
        TestResult::Pass {
            duration_ms: 100,
            output: None,
        }
    }

    fn fail() -> TestResult {
        TestResult::Fail {
            duration_ms: 50,
            error: "Output diff:\n-hi\n+bye\n".to_string(),
            output: None,
        }
    }

    #[test]
    fn test_report_stats() {
        let mut report = TestReport::new("x.land/p/demo");
        report.add_result("TestOne", pass());
        report.add_result("file/a_filetest.x", fail());
        report.add_result(
            "file/b_filetest.x",
            TestResult::Cached {
                original_result: Box::new(pass()),
                cache_hit_time: chrono::Utc::now(),
            },
        );

        assert_eq!(report.stats.total, 3);
        assert_eq!(report.stats.passed, 2);
        assert_eq!(report.stats.failed, 1);
        assert_eq!(report.stats.cached, 1);
        assert!(!report.is_success());
        assert_eq!(report.errors, vec!["file/a_filetest.x failed"]);
        assert!(report.result("TestOne").unwrap().is_pass());
        assert!(report.check().is_err());
    }

    #[test]
    fn test_package_error_counts_as_failure() {
        let mut report = TestReport::new("x.land/p/demo");
        report.add_result("TestOne", pass());
        report.add_error("x.land/p/demo: panic: boom");

        assert_eq!(report.stats.total, 2);
        assert_eq!(report.stats.failed, 1);
        assert!(!report.is_success());
    }

    #[test]
    fn test_console_reporter_quiet() {
        let mut reporter = ConsoleReporter::new(Vec::new(), false);
        reporter.on_test_start("TestOne");
        reporter.on_test_finish("TestOne", &pass());
        reporter.on_test_finish("file/a_filetest.x", &fail());

        let text = String::from_utf8(reporter.into_inner()).unwrap();
        assert_eq!(text, "--- FAIL: file/a_filetest.x (0.05s)\nOutput diff:\n-hi\n+bye\n\n");
    }

    #[test]
    fn test_console_reporter_verbose() {
        let mut reporter = ConsoleReporter::new(Vec::new(), true);
        reporter.on_test_start("TestOne");
        reporter.on_test_finish("TestOne", &pass());

        let mut report = TestReport::new("x.land/p/demo");
        report.add_result("TestOne", pass());
        report.coverage = Some(62.5);
        reporter.on_suite_finish(&report);

        let text = String::from_utf8(reporter.into_inner()).unwrap();
        assert_eq!(
            text,
            "=== RUN   TestOne\n--- PASS: TestOne (0.10s)\ncoverage: 62.5% of statements\nok      x.land/p/demo 0.00s\n"
        );
    }

    #[test]
    fn test_json_reporter() {
        let mut reporter = JsonReporter::new(Vec::new());
        let mut report = TestReport::new("x.land/p/demo");
        report.add_result("TestOne", pass());
        reporter.on_suite_finish(&report);

        let json: serde_json::Value =
            serde_json::from_slice(&reporter.into_inner()).unwrap();
        assert_eq!(json["stats"]["passed"], 1);
        assert_eq!(json["results"][0]["name"], "TestOne");
        assert_eq!(json["results"][0]["status"], "pass");
        assert_eq!(json["success"], true);
    }
}
