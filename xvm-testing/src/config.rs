//! Test engine configuration, read from `xvm-test.toml`

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::coverage::CoverageMode;
use crate::error::{Result, TestError};
use crate::profile::ProfileConfig;

/// Name of the configuration file looked up in a package directory
pub const CONFIG_FILE: &str = "xvm-test.toml";

/// Default location of the result cache, relative to the working directory
pub const DEFAULT_CACHE_DIR: &str = ".xvm-test-cache";

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    pub cache_dir: PathBuf,
    /// Reuse the results of unchanged filetests
    pub cache: bool,
    pub cover_mode: Option<CoverageMode>,
    /// Where to write the cover profile, if anywhere
    pub cover_profile: Option<PathBuf>,
    /// Run pattern, as accepted by the match filter
    pub run: Option<String>,
    pub verbose: bool,
    pub metrics: bool,
    pub events: bool,
    pub profile: ProfileConfig,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            cache: true,
            cover_mode: None,
            cover_profile: None,
            run: None,
            verbose: false,
            metrics: false,
            events: false,
            profile: ProfileConfig::default(),
        }
    }
}

impl TestConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| TestError::io(path, e))?;
        toml::from_str(&content)
            .map_err(|e| TestError::config(format!("{}: {e}", path.display())))
    }

    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| TestError::config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TestError::io(parent, e))?;
        }
        std::fs::write(path, content).map_err(|e| TestError::io(path, e))
    }

    /// Loads `dir/xvm-test.toml`, or the defaults when there is none.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_file(&path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cover_profile.is_some() && self.cover_mode.is_none() {
            return Err(TestError::config("cover_profile requires a cover_mode"));
        }
        if self.profile.line_level() && self.profile.kind == crate::profile::ProfileType::Memory {
            return Err(TestError::config(
                "function_list is not supported by memory profiles",
            ));
        }
        Ok(())
    }
}
