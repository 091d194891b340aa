//! Test engine for the x virtual machine
//!
//! Runs the filetests and unit tests of x packages: golden directives are
//! parsed out of each filetest and compared against what the program actually
//! did, passing filetests are cached by the content hash of the file and its
//! dependencies, and coverage and profiles can be collected along the way.

pub mod config;
pub mod context;
pub mod coverage;
pub mod diff;
pub mod directives;
pub mod error;
pub mod filetest;
pub mod matcher;
pub mod profile;
pub mod source;
pub mod test_cache;
pub mod test_report;
pub mod test_runner;
pub mod vm;

pub use config::TestConfig;
pub use coverage::{CoverageData, CoverageMode};
pub use directives::{Directive, DirectiveForm, Directives};
pub use error::{Result, TestError};
pub use filetest::FileTestOptions;
pub use matcher::{FilterMatch, Matcher};
pub use profile::{ProfileConfig, ProfileType};
pub use test_cache::{PackageInfo, ResultCache, TestCache};
pub use test_report::{ConsoleReporter, JsonReporter, TestReport, TestReporter};
pub use test_runner::{TestOptions, TestResult};
pub use vm::{Machine, MachineFactory, MachineOptions, MemFile, MemPackage, PackageStore};
