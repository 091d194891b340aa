//! Filetest execution
//!
//! A filetest is run as a `main` program, either directly or, for realm paths,
//! after committing it to the store the way a transaction would. The result is
//! then compared against the golden directives of the file.

use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::debug;

use crate::context::{is_realm_path, Coins, ExecContext};
use crate::coverage::CoverageData;
use crate::diff::unified_diff;
use crate::directives::{
    Directive, Directives, DIRECTIVE_ERROR, DIRECTIVE_EVENTS, DIRECTIVE_MAX_ALLOC,
    DIRECTIVE_OUTPUT, DIRECTIVE_PKG_PATH, DIRECTIVE_PREPROCESSED, DIRECTIVE_REALM,
    DIRECTIVE_SEND, DIRECTIVE_STACKTRACE,
};
use crate::error::{Mismatch, Result, TestError};
use crate::profile::ProfileSink;
use crate::source::FileHeader;
use crate::vm::{
    Exception, Machine, MachineFactory, MachineOptions, MemFile, MemPackage, PackageStore,
    SharedBuffer,
};

/// Package path of a filetest without a `PKGPATH` directive
pub const DEFAULT_PKG_PATH: &str = "main";

/// Everything needed to run filetests against a store.
#[derive(Clone)]
pub struct FileTestOptions {
    pub store: Arc<dyn PackageStore>,
    pub factory: Arc<dyn MachineFactory>,
    /// Program output; reset on every run
    pub stdout: SharedBuffer,
    pub coverage: Option<Arc<CoverageData>>,
    pub profile_sink: Option<Arc<dyn ProfileSink>>,
}

/// What a single execution produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    pub output: String,
    /// Rendered panic, if the program panicked
    pub error: Option<String>,
    /// Stack trace of the program
    pub stacktrace: String,
    /// Host stack, when the machine itself panicked
    pub native_stack: Option<String>,
}

impl FileTestOptions {
    pub fn new(store: Arc<dyn PackageStore>, factory: Arc<dyn MachineFactory>) -> Self {
        Self {
            store,
            factory,
            stdout: SharedBuffer::new(),
            coverage: None,
            profile_sink: None,
        }
    }

    /// Runs the filetest in `source`.
    pub fn run(&self, filename: &str, source: &[u8]) -> Result<()> {
        self.run_inner(filename, source, false).map(|_| ())
    }

    /// Runs the filetest in `source`, replacing golden directives that differ
    /// with the actual results. Returns the regenerated file when anything
    /// changed.
    pub fn run_sync(&self, filename: &str, source: &[u8]) -> Result<Option<String>> {
        self.run_inner(filename, source, true)
    }

    fn run_inner(&self, filename: &str, source: &[u8], sync: bool) -> Result<Option<String>> {
        let mut dirs = Directives::parse(source)?;
        let content = std::str::from_utf8(source)
            .map_err(|e| TestError::directive(format!("source is not valid UTF-8: {e}")))?;

        let pkg_path = dirs.first_default(DIRECTIVE_PKG_PATH, DEFAULT_PKG_PATH).to_string();
        let send: Coins = dirs.first_default(DIRECTIVE_SEND, "").parse()?;
        let max_alloc: i64 = dirs
            .first_default(DIRECTIVE_MAX_ALLOC, "0")
            .trim()
            .parse()
            .map_err(|e| TestError::directive(format!("could not parse MAXALLOC directive: {e}")))?;

        debug!(file = filename, pkg_path = %pkg_path, max_alloc, sync, "running filetest");

        let mut machine = self.factory.new_machine(MachineOptions {
            output: self.stdout.clone(),
            context: ExecContext::new(&pkg_path, send),
            max_alloc_bytes: max_alloc,
            coverage: self.coverage.clone(),
            profile_sink: self.profile_sink.clone(),
        });
        let result = self.run_test(machine.as_mut(), &pkg_path, filename, content);

        let mut mismatches = Vec::new();
        let mut updated = false;

        if let Some(error) = &result.error {
            let Some(dir) = dirs.first_mut(DIRECTIVE_ERROR) else {
                return Err(TestError::UnexpectedPanic {
                    error: error.clone(),
                    output: result.output.clone(),
                    stack: result
                        .native_stack
                        .clone()
                        .unwrap_or_else(|| Backtrace::capture().to_string()),
                });
            };
            // Directive content always ends with a newline.
            compare(dir, &format!("{error}\n"), sync, &mut updated, &mut mismatches);
        } else {
            machine
                .check_empty()
                .map_err(TestError::NotEmptyAfterMain)?;
            // An expected error that never happened.
            if let Some(dir) = dirs.first_mut(DIRECTIVE_ERROR) {
                compare(dir, "", sync, &mut updated, &mut mismatches);
            }
        }

        for dir in dirs.0.iter_mut() {
            let actual = match dir.name.as_str() {
                DIRECTIVE_OUTPUT => result.output.clone(),
                DIRECTIVE_REALM => format!("{}\n", machine.store_ops()),
                DIRECTIVE_EVENTS => format!("{:#}\n", machine.events()),
                DIRECTIVE_PREPROCESSED => machine
                    .preprocessed(&pkg_path)
                    .map(|pre| format!("{pre}\n"))
                    .unwrap_or_default(),
                DIRECTIVE_STACKTRACE => result.stacktrace.clone(),
                _ => continue,
            };
            compare(dir, &actual, sync, &mut updated, &mut mismatches);
        }

        if !mismatches.is_empty() {
            debug!(file = filename, mismatches = mismatches.len(), "filetest failed");
            return Err(TestError::ExpectationMismatch(mismatches));
        }
        Ok(updated.then(|| dirs.file_test()))
    }

    /// Makes sure every import of `content` is available in the store.
    fn load_imports(&self, filename: &str, content: &str) -> Option<RunResult> {
        let header = match FileHeader::parse(filename, content) {
            Ok(header) => header,
            Err(TestError::Parse { message, .. }) => return Some(failure(format!("parse failure: {message}"))),
            Err(err) => return Some(failure(format!("parse failure: {err}"))),
        };
        for import in &header.imports {
            if !self.store.load_package(&import.path) {
                return Some(failure(format!("package not found: {}", import.path)));
            }
        }
        None
    }

    fn run_test(
        &self,
        m: &mut dyn Machine,
        pkg_path: &str,
        filename: &str,
        content: &str,
    ) -> RunResult {
        let imports = panic::catch_unwind(AssertUnwindSafe(|| self.load_imports(filename, content)));
        match imports {
            Ok(None) => {}
            Ok(Some(res)) => return res,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                debug!(file = filename, error = %message, "import loading panicked");
                return RunResult {
                    error: Some(message),
                    native_stack: Some(Backtrace::force_capture().to_string()),
                    ..RunResult::default()
                };
            }
        }

        // Only program output is compared.
        self.stdout.reset();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            execute(&mut *m, pkg_path, filename, content)
        }));

        match outcome {
            Ok(Ok(())) => RunResult {
                output: self.stdout.contents(),
                stacktrace: m.stacktrace(),
                ..RunResult::default()
            },
            Ok(Err(exception)) => {
                debug!(file = filename, error = %exception, "program panicked");
                let stacktrace = match &exception {
                    Exception::Value(_) | Exception::Preprocess(_) => String::new(),
                    Exception::Unhandled(_) => m.exceptions_stacktrace(),
                    Exception::Other(_) => m.stacktrace(),
                };
                RunResult {
                    output: self.stdout.contents(),
                    error: Some(exception.message().to_string()),
                    stacktrace,
                    native_stack: None,
                }
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                debug!(file = filename, error = %message, "machine panicked");
                RunResult {
                    output: self.stdout.contents(),
                    error: Some(message),
                    stacktrace: m.stacktrace(),
                    native_stack: Some(Backtrace::force_capture().to_string()),
                }
            }
        }
    }
}

fn execute(m: &mut dyn Machine, pkg_path: &str, filename: &str, content: &str) -> std::result::Result<(), Exception> {
    let pkg_name = package_name(pkg_path);
    if !is_realm_path(pkg_path) {
        m.run_files(pkg_name, pkg_path, filename, content)?;
        return m.call_main();
    }

    m.set_debug(false);
    // A `_filetest` suffix would keep the file out of the package.
    let pkg = MemPackage {
        name: pkg_name.to_string(),
        path: pkg_path.to_string(),
        files: vec![MemFile::new(filename.replace("_filetest", ""), content)],
    };
    m.run_package_committed(&pkg)?;
    m.activate_package(pkg_path)?;
    m.set_debug(true);
    m.reset_store_ops();
    m.call_main()
}

/// Last element of `pkg_path`.
pub fn package_name(pkg_path: &str) -> &str {
    pkg_path.rsplit('/').next().unwrap_or(pkg_path)
}

fn failure(error: String) -> RunResult {
    RunResult {
        error: Some(error),
        ..RunResult::default()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

fn compare(
    dir: &mut Directive,
    actual: &str,
    sync: bool,
    updated: &mut bool,
    mismatches: &mut Vec<Mismatch>,
) {
    if dir.content == actual {
        return;
    }
    if sync {
        dir.content = actual.to_string();
        *updated = true;
    } else {
        mismatches.push(Mismatch {
            directive: dir.name.clone(),
            diff: unified_diff(&dir.content, actual),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directives::DirectiveForm;

    #[test]
    fn test_package_name() {
        assert_eq!(package_name("main"), "main");
        assert_eq!(package_name("x.land/r/demo/boards"), "boards");
        assert_eq!(package_name("x.land/r/demo/"), "");
    }

    #[test]
    fn test_compare_collects_diffs() {
        let mut dir = Directive {
            name: DIRECTIVE_OUTPUT.to_string(),
            content: "hi\n".to_string(),
            form: DirectiveForm::Block,
            complete: true,
        };
        let mut updated = false;
        let mut mismatches = Vec::new();

        compare(&mut dir, "hi\n", false, &mut updated, &mut mismatches);
        assert!(mismatches.is_empty());

        compare(&mut dir, "bye\n", false, &mut updated, &mut mismatches);
        assert_eq!(mismatches.len(), 1);
        assert!(mismatches[0].diff.contains("-hi\n+bye\n"));
        assert_eq!(dir.content, "hi\n");
        assert!(!updated);
    }

    #[test]
    fn test_compare_sync_rewrites_content() {
        let mut dir = Directive {
            name: DIRECTIVE_OUTPUT.to_string(),
            content: "hi\n".to_string(),
            form: DirectiveForm::Block,
            complete: true,
        };
        let mut updated = false;
        let mut mismatches = Vec::new();

        compare(&mut dir, "bye\n", true, &mut updated, &mut mismatches);
        assert!(mismatches.is_empty());
        assert!(updated);
        assert_eq!(dir.content, "bye\n");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn std::any::Any + Send> = Box::new(42);
        assert!(panic_message(payload.as_ref()).contains("non-string"));
    }
}
