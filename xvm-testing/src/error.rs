//! Error types for the test engine

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TestError>;

/// A single golden directive whose content differs from what the run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    /// Name of the directive, e.g. `Output`
    pub directive: String,
    /// Unified diff between the expected and the actual content
    pub diff: String,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} diff:\n{}", self.directive, self.diff)
    }
}

#[derive(Error, Debug)]
pub enum TestError {
    #[error("{}", join_mismatches(.0))]
    ExpectationMismatch(Vec<Mismatch>),

    #[error("unexpected panic: {error}\noutput:\n{output}\nstack:\n{stack}")]
    UnexpectedPanic {
        error: String,
        output: String,
        stack: String,
    },

    #[error("machine not empty after main: {0}")]
    NotEmptyAfterMain(String),

    #[error("corrupt cache file {}: {source}", path.display())]
    CacheCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("element {index} of {pattern} ({element:?}): {source}")]
    MalformedPattern {
        index: usize,
        element: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("error parsing directives: {message}")]
    Directive { message: String },

    #[error("invalid coins {input:?}: {message}")]
    InvalidCoins { input: String, message: String },

    #[error("{message}")]
    Classification { message: String },

    #[error("parse failure in {file}: {message}")]
    Parse { file: String, message: String },

    #[error("profile error: {message}")]
    Profile { message: String },

    #[error("coverage error: {message}")]
    Coverage { message: String },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}", .0.join("\n"))]
    Failed(Vec<String>),
}

fn join_mismatches(mismatches: &[Mismatch]) -> String {
    mismatches
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

impl TestError {
    pub fn directive(message: impl Into<String>) -> Self {
        Self::Directive {
            message: message.into(),
        }
    }

    pub fn invalid_coins(input: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidCoins {
            input: input.into(),
            message: message.into(),
        }
    }

    pub fn classification(message: impl Into<String>) -> Self {
        Self::Classification {
            message: message.into(),
        }
    }

    pub fn parse(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            file: file.into(),
            message: message.into(),
        }
    }

    pub fn profile(message: impl Into<String>) -> Self {
        Self::Profile {
            message: message.into(),
        }
    }

    pub fn coverage(message: impl Into<String>) -> Self {
        Self::Coverage {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error is a golden-file mismatch rather than a failure to run
    pub fn is_mismatch(&self) -> bool {
        matches!(self, Self::ExpectationMismatch(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mismatches_are_joined() {
        let err = TestError::ExpectationMismatch(vec![
            Mismatch {
                directive: "Output".to_string(),
                diff: "-a\n+b\n".to_string(),
            },
            Mismatch {
                directive: "Events".to_string(),
                diff: "-[]\n+null\n".to_string(),
            },
        ]);

        let text = err.to_string();
        assert!(text.starts_with("Output diff:\n-a\n+b\n"));
        assert!(text.contains("\nEvents diff:\n-[]"));
        assert!(err.is_mismatch());
    }
}
