//! Block-level statement coverage
//!
//! Machines register the blocks of every file they load and bump a counter each
//! time a block is entered. One [`CoverageData`] is shared by all the machines
//! that run the tests of a package.

use std::fmt;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TestError};

/// How block counters are accounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverageMode {
    /// Whether a block ran at all
    Set,
    /// How many times a block ran
    Count,
    /// Like `Count`, safe for concurrent increments
    Atomic,
}

impl fmt::Display for CoverageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CoverageMode::Set => "set",
            CoverageMode::Count => "count",
            CoverageMode::Atomic => "atomic",
        })
    }
}

impl FromStr for CoverageMode {
    type Err = TestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "set" => Ok(CoverageMode::Set),
            "count" => Ok(CoverageMode::Count),
            "atomic" => Ok(CoverageMode::Atomic),
            other => Err(TestError::coverage(format!(
                "unknown cover mode {other:?}, expected set, count or atomic"
            ))),
        }
    }
}

/// Index of a registered block; only valid for the [`CoverageData`] that
/// returned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockIndex(usize);

impl BlockIndex {
    pub fn get(self) -> usize {
        self.0
    }
}

/// A statement range and its hit counter.
#[derive(Debug)]
pub struct CoverageBlock {
    pub file: String,
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
    pub num_statements: u32,
    counter: AtomicU64,
}

impl CoverageBlock {
    pub fn count(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct CoverageData {
    mode: CoverageMode,
    package_name: String,
    blocks: RwLock<Vec<CoverageBlock>>,
}

impl CoverageData {
    pub fn new(mode: CoverageMode, package_name: impl Into<String>) -> Self {
        Self {
            mode,
            package_name: package_name.into(),
            blocks: RwLock::new(Vec::new()),
        }
    }

    pub fn mode(&self) -> CoverageMode {
        self.mode
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    /// Registers a block and returns its index, stable for the lifetime of `self`.
    pub fn add_block(
        &self,
        file: &str,
        start_line: u32,
        start_col: u32,
        end_line: u32,
        end_col: u32,
        num_statements: u32,
    ) -> BlockIndex {
        let mut blocks = self.blocks.write().unwrap_or_else(PoisonError::into_inner);
        blocks.push(CoverageBlock {
            file: file.to_string(),
            start_line,
            start_col,
            end_line,
            end_col,
            num_statements,
            counter: AtomicU64::new(0),
        });
        BlockIndex(blocks.len() - 1)
    }

    /// Records one execution of the block at `index`.
    pub fn increment_block(&self, index: BlockIndex) -> Result<()> {
        let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        let block = blocks.get(index.0).ok_or_else(|| {
            TestError::coverage(format!(
                "block index {} out of range ({} blocks)",
                index.0,
                blocks.len()
            ))
        })?;

        match self.mode {
            CoverageMode::Set => block.counter.store(1, Ordering::Relaxed),
            // Not safe for concurrent writers, use Atomic for that.
            CoverageMode::Count => {
                let n = block.counter.load(Ordering::Relaxed);
                block.counter.store(n + 1, Ordering::Relaxed);
            }
            CoverageMode::Atomic => {
                block.counter.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Hit count of the block at `index`.
    pub fn count(&self, index: BlockIndex) -> Option<u64> {
        let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        blocks.get(index.0).map(CoverageBlock::count)
    }

    pub fn block_count(&self) -> usize {
        self.blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// `(covered, total)` blocks, whatever the mode.
    pub fn get_coverage(&self) -> (usize, usize) {
        let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        let covered = blocks.iter().filter(|b| b.count() > 0).count();
        (covered, blocks.len())
    }

    /// Percentage of covered statements, 0 when nothing was registered.
    pub fn percent(&self) -> f64 {
        let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        let total: u64 = blocks.iter().map(|b| u64::from(b.num_statements)).sum();
        if total == 0 {
            return 0.0;
        }
        let covered: u64 = blocks
            .iter()
            .filter(|b| b.count() > 0)
            .map(|b| u64::from(b.num_statements))
            .sum();
        covered as f64 * 100.0 / total as f64
    }

    /// Writes the blocks as a cover profile; `with_header` adds the
    /// `mode:` line that starts a profile file.
    pub fn write_profile<W: Write>(&self, w: &mut W, with_header: bool) -> std::io::Result<()> {
        if with_header {
            writeln!(w, "mode: {}", self.mode)?;
        }
        let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        for b in blocks.iter() {
            writeln!(
                w,
                "{}:{}.{},{}.{} {} {}",
                b.file,
                b.start_line,
                b.start_col,
                b.end_line,
                b.end_col,
                b.num_statements,
                b.count()
            )?;
        }
        Ok(())
    }

    /// Appends the blocks to the cover profile at `path`, writing the header
    /// when the file is new or empty.
    pub fn append_profile(&self, path: &Path) -> Result<()> {
        let fresh = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| TestError::io(path, e))?;
        self.write_profile(&mut file, fresh)
            .map_err(|e| TestError::io(path, e))?;
        debug!(
            package = %self.package_name,
            blocks = self.block_count(),
            path = %path.display(),
            "wrote cover profile"
        );
        Ok(())
    }
}
