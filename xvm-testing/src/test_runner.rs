//! Package test orchestration
//!
//! [`TestOptions::test`] classifies the files of a package, runs its unit and
//! integration tests through the language's testing package, then runs its
//! filetests, consulting the result cache and updating coverage on the way.

use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::TestConfig;
use crate::context::{Coins, ExecContext};
use crate::coverage::{CoverageData, CoverageMode};
use crate::error::{Result, TestError};
use crate::filetest::FileTestOptions;
use crate::matcher::{should_run, FilterMatch, Matcher};
use crate::profile::ProfileSink;
use crate::source::{test_functions, FileHeader};
use crate::test_cache::ResultCache;
use crate::test_report::{ConsoleReporter, TestReport, TestReporter};
use crate::vm::{
    Exception, MachineFactory, MachineOptions, MemFile, MemPackage, PackageStore, SharedBuffer,
    UnitReport, SOURCE_EXT,
};

/// Test result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TestResult {
    /// Test passed
    Pass {
        duration_ms: u64,
        output: Option<String>,
    },

    /// Test failed
    Fail {
        duration_ms: u64,
        error: String,
        output: Option<String>,
    },

    /// Test was skipped
    Skipped { reason: String },

    /// A previous passing run was reused
    Cached {
        original_result: Box<TestResult>,
        cache_hit_time: chrono::DateTime<chrono::Utc>,
    },
}

impl TestResult {
    pub fn is_pass(&self) -> bool {
        match self {
            TestResult::Pass { .. } => true,
            TestResult::Cached { original_result, .. } => original_result.is_pass(),
            _ => false,
        }
    }

    pub fn is_fail(&self) -> bool {
        match self {
            TestResult::Fail { .. } => true,
            TestResult::Cached { original_result, .. } => original_result.is_fail(),
            _ => false,
        }
    }
}

/// The test files of a package, by kind.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PackageTests {
    /// `_test` files of the package itself
    pub unit: Vec<MemFile>,
    /// `_test` files of the `<name>_test` package
    pub integration: Vec<MemFile>,
    pub filetests: Vec<MemFile>,
}

/// Sorts the test files of `pkg`, making sure every import is available.
pub fn classify_files(store: &dyn PackageStore, pkg: &MemPackage) -> Result<PackageTests> {
    let mut tests = PackageTests::default();
    let mut errors = Vec::new();
    let integration_name = format!("{}_test", pkg.name);

    for file in &pkg.files {
        if !file.name.ends_with(SOURCE_EXT) {
            continue;
        }
        let header = match FileHeader::parse(&file.name, &file.body) {
            Ok(header) => header,
            Err(err) => {
                errors.push(err.to_string());
                continue;
            }
        };
        for import in &header.imports {
            if !store.load_package(&import.path) {
                errors.push(format!("{}/{}: package not found: {}", pkg.path, file.name, import.path));
            }
        }

        let stem = &file.name[..file.name.len() - SOURCE_EXT.len()];
        if stem.ends_with("_filetest") {
            tests.filetests.push(file.clone());
        } else if stem.ends_with("_test") && header.package == pkg.name {
            tests.unit.push(file.clone());
        } else if stem.ends_with("_test") && header.package == integration_name {
            tests.integration.push(file.clone());
        } else if header.package != pkg.name {
            errors.push(format!(
                "expected package name [{}] or [{}] but got [{}] file [{}]",
                pkg.name, integration_name, header.package, file.name
            ));
        }
    }

    if !errors.is_empty() {
        return Err(TestError::classification(errors.join("\n")));
    }
    Ok(tests)
}

/// Options shared by the test runs of any number of packages.
pub struct TestOptions {
    pub store: Arc<dyn PackageStore>,
    pub factory: Arc<dyn MachineFactory>,
    /// Program output of unit tests
    pub output: Box<dyn Write>,
    pub reporter: Box<dyn TestReporter>,

    /// Rewrite golden directives instead of failing on them
    pub sync: bool,
    pub verbose: bool,
    /// Report cycles and allocations of every unit test
    pub metrics: bool,
    /// Report the events emitted by every unit test
    pub events: bool,

    /// Filetest result cache; `None` disables caching
    pub cache: Option<ResultCache>,
    pub cover_mode: Option<CoverageMode>,
    pub cover_profile: Option<PathBuf>,
    pub profile_sink: Option<Arc<dyn ProfileSink>>,

    matcher: Matcher,
    run_flag: String,
    filter: Option<FilterMatch>,
    filetest_buffer: SharedBuffer,
}

impl TestOptions {
    /// Options printing program output to stdout and progress to stderr.
    pub fn new(store: Arc<dyn PackageStore>, factory: Arc<dyn MachineFactory>) -> Self {
        Self {
            store,
            factory,
            output: Box::new(io::stdout()),
            reporter: Box::new(ConsoleReporter::new(io::stderr(), false)),
            sync: false,
            verbose: false,
            metrics: false,
            events: false,
            cache: None,
            cover_mode: None,
            cover_profile: None,
            profile_sink: None,
            matcher: Matcher::new(),
            run_flag: String::new(),
            filter: None,
            filetest_buffer: SharedBuffer::new(),
        }
    }

    /// Applies a configuration file on top of [`TestOptions::new`].
    pub fn from_config(
        config: &TestConfig,
        store: Arc<dyn PackageStore>,
        factory: Arc<dyn MachineFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let mut opts = Self::new(store, factory);
        opts.verbose = config.verbose;
        opts.metrics = config.metrics;
        opts.events = config.events;
        opts.cover_mode = config.cover_mode;
        opts.cover_profile = config.cover_profile.clone();
        opts.reporter = Box::new(ConsoleReporter::new(io::stderr(), config.verbose));
        if config.cache {
            opts.cache = Some(ResultCache::new(&config.cache_dir)?);
        }
        if let Some(run) = &config.run {
            opts.set_run_flag(run)?;
        }
        Ok(opts)
    }

    /// Compiles and verifies the run pattern before any test runs.
    pub fn set_run_flag(&mut self, run: &str) -> Result<()> {
        self.filter = if run.is_empty() {
            None
        } else {
            Some(FilterMatch::compile(run, &self.matcher)?)
        };
        self.run_flag = run.to_string();
        Ok(())
    }

    pub fn run_flag(&self) -> &str {
        &self.run_flag
    }

    /// Runs the tests of `pkg`, whose files live in `fs_dir`.
    ///
    /// Test failures are collected in the report; only errors that prevent
    /// running tests at all are returned as `Err`.
    pub fn test(&mut self, pkg: &MemPackage, fs_dir: &Path) -> Result<TestReport> {
        let started = Instant::now();
        info!(pkg = %pkg.path, files = pkg.files.len(), "testing package");
        self.reporter.on_suite_start(&pkg.path);

        let tests = classify_files(self.store.as_ref(), pkg)?;
        let coverage = self
            .cover_mode
            .map(|mode| Arc::new(CoverageData::new(mode, &pkg.name)));
        let mut report = TestReport::new(&pkg.path);

        if !tests.unit.is_empty() {
            self.run_test_files(pkg, &tests.unit, coverage.as_ref(), &mut report);
        }
        if !tests.integration.is_empty() {
            let it_pkg = MemPackage {
                name: format!("{}_test", pkg.name),
                path: format!("{}_test", pkg.path),
                files: tests.integration.clone(),
            };
            self.run_test_files(&it_pkg, &tests.integration, coverage.as_ref(), &mut report);
        }
        for file in &tests.filetests {
            self.run_filetest(file, fs_dir, coverage.as_ref(), &mut report)?;
        }

        if let Some(coverage) = &coverage {
            report.coverage = Some(coverage.percent());
            if let Some(path) = &self.cover_profile {
                coverage.append_profile(path)?;
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        self.reporter.on_suite_finish(&report);
        debug!(
            pkg = %pkg.path,
            passed = report.stats.passed,
            failed = report.stats.failed,
            cached = report.stats.cached,
            "package done"
        );
        Ok(report)
    }

    fn run_test_files(
        &mut self,
        pkg: &MemPackage,
        files: &[MemFile],
        coverage: Option<&Arc<CoverageData>>,
        report: &mut TestReport,
    ) {
        let names: Vec<String> = files.iter().flat_map(|f| test_functions(&f.body)).collect();
        let stdout = SharedBuffer::new();
        let mut m = self.factory.new_machine(MachineOptions {
            output: stdout.clone(),
            context: ExecContext::new(&pkg.path, Coins::default()),
            max_alloc_bytes: if self.metrics { i64::MAX } else { 0 },
            coverage: coverage.cloned(),
            profile_sink: self.profile_sink.clone(),
        });

        let loaded = panic::catch_unwind(AssertUnwindSafe(|| m.load_package(pkg, files)));
        let load_error = match loaded {
            Ok(Ok(())) => None,
            Ok(Err(exc)) => Some(format!("panic: {exc}\nstacktrace:\n{}", m.exceptions_stacktrace())),
            Err(_) => Some(format!("panic while loading {}\nstacktrace:\n{}", pkg.path, m.stacktrace())),
        };
        if let Some(error) = load_error {
            warn!(pkg = %pkg.path, "could not load test files");
            report.add_error(format!("{}: {error}", pkg.path));
            self.reporter.on_test_info(&pkg.path, &error);
            return;
        }
        self.flush_output(&stdout);

        for name in names {
            if !should_run(self.filter.as_ref(), &self.matcher, &name) {
                continue;
            }
            self.reporter.on_test_start(&name);
            let started = Instant::now();

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                m.run_unit_test(&name, &self.run_flag, self.verbose)
            }));
            let duration_ms = started.elapsed().as_millis() as u64;
            let output = stdout.contents();
            self.flush_output(&stdout);

            if self.events {
                let events = m.events();
                if !events.is_null() {
                    self.reporter.on_test_info(&name, &format!("EVENTS: {events}"));
                }
            }

            let result = match outcome {
                Ok(Ok(UnitReport { failed: false, skipped: true })) => TestResult::Skipped {
                    reason: "skipped".to_string(),
                },
                Ok(Ok(UnitReport { failed: false, .. })) => TestResult::Pass {
                    duration_ms,
                    output: Some(output),
                },
                Ok(Ok(UnitReport { failed: true, .. })) => TestResult::Fail {
                    duration_ms,
                    error: format!("failed: {name:?}"),
                    output: Some(output),
                },
                Ok(Err(exc)) => TestResult::Fail {
                    duration_ms,
                    error: panic_report(&exc, m.exceptions_stacktrace()),
                    output: Some(output),
                },
                Err(_) => TestResult::Fail {
                    duration_ms,
                    error: format!("failed to execute unit test: {name:?} [internal testing error]"),
                    output: Some(output),
                },
            };

            if self.metrics {
                let allocs = match m.alloc_status() {
                    Some((max, used)) if max > 0 => format!(
                        "{}({:.2}%)",
                        pretty_size(used),
                        used as f64 / max as f64 * 100.0
                    ),
                    _ => "n/a".to_string(),
                };
                self.reporter.on_test_info(
                    &name,
                    &format!("---       runtime: cycle={} allocs={allocs}", pretty_size(m.cycles())),
                );
            }

            self.reporter.on_test_finish(&name, &result);
            report.add_result(name, result);
        }
    }

    fn run_filetest(
        &mut self,
        file: &MemFile,
        fs_dir: &Path,
        coverage: Option<&Arc<CoverageData>>,
        report: &mut TestReport,
    ) -> Result<()> {
        let test_name = format!("file/{}", file.name);
        if !should_run(self.filter.as_ref(), &self.matcher, &test_name) {
            return Ok(());
        }
        let path = fs_dir.join(&file.name);
        self.reporter.on_test_start(&test_name);

        let cache = self.cache.as_ref().filter(|_| !self.sync);
        if let Some(cache) = cache {
            if let Some(hit) = cache.load(&path, file.body.as_bytes(), self.store.as_ref())? {
                let result = TestResult::Cached {
                    original_result: Box::new(TestResult::Pass {
                        duration_ms: hit.duration.as_millis() as u64,
                        output: Some(hit.output),
                    }),
                    cache_hit_time: chrono::Utc::now(),
                };
                self.reporter.on_test_finish(&test_name, &result);
                report.add_result(test_name, result);
                return Ok(());
            }
        }

        let runner = FileTestOptions {
            store: Arc::clone(&self.store),
            factory: Arc::clone(&self.factory),
            stdout: self.filetest_buffer.clone(),
            coverage: coverage.cloned(),
            profile_sink: self.profile_sink.clone(),
        };
        let started = Instant::now();
        let outcome = if self.sync {
            runner.run_sync(&file.name, file.body.as_bytes())
        } else {
            runner.run(&file.name, file.body.as_bytes()).map(|()| None)
        };
        let duration = started.elapsed();
        let output = self.filetest_buffer.contents();

        let result = match outcome {
            Ok(changed) => {
                if let Some(changed) = changed {
                    std::fs::write(&path, changed).map_err(|e| TestError::io(&path, e))?;
                    info!(file = %path.display(), "updated golden directives");
                }
                if let Some(cache) = cache {
                    if let Err(err) =
                        cache.save(&path, file.body.as_bytes(), self.store.as_ref(), &output, duration)
                    {
                        warn!(file = %path.display(), error = %err, "could not cache result");
                    }
                }
                TestResult::Pass {
                    duration_ms: duration.as_millis() as u64,
                    output: None,
                }
            }
            Err(err) => TestResult::Fail {
                duration_ms: duration.as_millis() as u64,
                error: err.to_string(),
                output: Some(output),
            },
        };

        self.reporter.on_test_finish(&test_name, &result);
        report.add_result(test_name, result);
        Ok(())
    }

    fn flush_output(&mut self, stdout: &SharedBuffer) {
        let text = stdout.contents();
        if !text.is_empty() {
            let _ = self.output.write_all(text.as_bytes());
        }
        stdout.reset();
    }
}

fn panic_report(exc: &Exception, stacktrace: String) -> String {
    if stacktrace.is_empty() {
        format!("panic: {exc}")
    } else {
        format!("panic: {exc}\nstacktrace:\n{stacktrace}")
    }
}

/// Formats `nb` with a decimal unit suffix: `999`, `1.5k`, `2.0M`.
pub fn pretty_size(nb: i64) -> String {
    const UNIT: i64 = 1000;
    if nb < UNIT {
        return nb.to_string();
    }
    let (mut div, mut exp) = (UNIT, 0);
    let mut n = nb / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let suffix = ['k', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1}{suffix}", nb as f64 / div as f64)
}

/// Seconds with two decimals, as printed after a test name.
pub fn fmt_duration(d: Duration) -> String {
    format!("{:.2}s", d.as_secs_f64())
}
