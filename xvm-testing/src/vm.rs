//! Interfaces to the virtual machine, its package store and its output
//!
//! The interpreter itself lives outside this crate; the test engine only drives
//! it through the traits below.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::context::ExecContext;
use crate::coverage::CoverageData;
use crate::profile::ProfileSink;
use crate::test_cache::PackageInfo;

/// Source file extension of the language
pub const SOURCE_EXT: &str = ".x";

/// A source file held in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemFile {
    pub name: String,
    pub body: String,
}

impl MemFile {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }
}

/// A package held in memory: its name, import path and files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemPackage {
    pub name: String,
    pub path: String,
    pub files: Vec<MemFile>,
}

/// Output buffer shared between the engine and a machine.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded.
    pub fn contents(&self) -> String {
        let buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf).into_owned()
    }

    pub fn reset(&self) {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A panic raised while the machine was running.
///
/// The shape decides how the failure is rendered and which stack trace, if
/// any, accompanies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exception {
    /// A typed value passed to `panic`, already rendered by the machine
    Value(String),
    /// A preprocessing error; holds the message of the wrapped error
    Preprocess(String),
    /// A panic that was never recovered by the program
    Unhandled(String),
    /// Anything else, including allocation limits being exceeded
    Other(String),
}

impl Exception {
    pub fn message(&self) -> &str {
        match self {
            Exception::Value(msg)
            | Exception::Preprocess(msg)
            | Exception::Unhandled(msg)
            | Exception::Other(msg) => msg,
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Result of a single unit test, as reported by the language's testing package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitReport {
    pub failed: bool,
    pub skipped: bool,
}

/// Everything a machine is created with.
#[derive(Clone)]
pub struct MachineOptions {
    pub output: SharedBuffer,
    pub context: ExecContext,
    /// Allocation ceiling in bytes; 0 is unlimited
    pub max_alloc_bytes: i64,
    pub coverage: Option<Arc<CoverageData>>,
    pub profile_sink: Option<Arc<dyn ProfileSink>>,
}

impl fmt::Debug for MachineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineOptions")
            .field("context", &self.context)
            .field("max_alloc_bytes", &self.max_alloc_bytes)
            .field("coverage", &self.coverage.is_some())
            .field("profile_sink", &self.profile_sink.is_some())
            .finish()
    }
}

/// A running instance of the virtual machine.
pub trait Machine {
    /// Creates a fresh package `pkg_name` at `pkg_path`, runs the declarations of
    /// `source` in it and makes it the active package.
    fn run_files(
        &mut self,
        pkg_name: &str,
        pkg_path: &str,
        filename: &str,
        source: &str,
    ) -> Result<(), Exception>;

    /// Toggles fine-grained debug tracing.
    fn set_debug(&mut self, enabled: bool);

    /// Runs the declarations and init functions of `pkg` under a transactional
    /// view of the store, then commits the transaction.
    fn run_package_committed(&mut self, pkg: &MemPackage) -> Result<(), Exception>;

    /// Reloads the package at `pkg_path` from the store and makes it active.
    fn activate_package(&mut self, pkg_path: &str) -> Result<(), Exception>;

    /// Clears the store operation log and keeps logging from now on.
    fn reset_store_ops(&mut self);

    /// Calls `main` in the active package.
    fn call_main(&mut self) -> Result<(), Exception>;

    /// Loads `pkg` together with `test_files` so that unit tests can be called.
    fn load_package(&mut self, pkg: &MemPackage, test_files: &[MemFile]) -> Result<(), Exception>;

    /// Runs the test function `name` through the language's testing package.
    fn run_unit_test(
        &mut self,
        name: &str,
        run_flag: &str,
        verbose: bool,
    ) -> Result<UnitReport, Exception>;

    /// Fails when values or operations are left on the machine's stacks.
    fn check_empty(&self) -> Result<(), String>;

    /// The store operations logged since [`Machine::reset_store_ops`].
    fn store_ops(&self) -> String;

    /// Events emitted during the run.
    fn events(&self) -> serde_json::Value;

    /// Canonical dump of the first preprocessed file of `pkg_path`.
    fn preprocessed(&self, pkg_path: &str) -> Option<String>;

    fn stacktrace(&self) -> String;

    /// Stack trace of the exceptions currently being raised.
    fn exceptions_stacktrace(&self) -> String;

    fn cycles(&self) -> i64;

    /// `(max, used)` allocation figures, when an allocator is attached.
    fn alloc_status(&self) -> Option<(i64, i64)>;
}

/// Creates machines bound to a store.
pub trait MachineFactory: Send + Sync {
    fn new_machine(&self, opts: MachineOptions) -> Box<dyn Machine>;
}

/// Resolves import paths to packages.
pub trait PackageStore: Send + Sync {
    /// Loads (and caches) the package at `pkg_path`; false when it does not exist.
    fn load_package(&self, pkg_path: &str) -> bool;

    /// Content hashes of the package at `pkg_path`.
    fn package_info(&self, pkg_path: &str) -> Option<PackageInfo>;

    fn read_file(&self, pkg_path: &str, file: &str) -> Option<String>;
}
