//! Hierarchical test name matching
//!
//! A run pattern such as `TestFoo/sub|TestBar` is split into path elements on
//! unescaped `/`, and into alternatives on unescaped `|`. Each element is a
//! regular expression matched against the element of the test name at the same
//! depth.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use regex::Regex;

use crate::error::{Result, TestError};

/// Compiles and caches the regular expressions of run patterns.
#[derive(Debug, Default)]
pub struct Matcher {
    compiled: Mutex<HashMap<String, Regex>>,
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports whether `pattern` matches anywhere in `s`.
    pub fn match_string(&self, pattern: &str, s: &str) -> std::result::Result<bool, regex::Error> {
        let mut compiled = self.compiled.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(re) = compiled.get(pattern) {
            return Ok(re.is_match(s));
        }
        let re = Regex::new(pattern)?;
        let matched = re.is_match(s);
        compiled.insert(pattern.to_string(), re);
        Ok(matched)
    }

    /// Number of distinct patterns compiled so far.
    pub fn cached_patterns(&self) -> usize {
        self.compiled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A compiled run pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterMatch {
    /// Path elements, matched by position
    Simple(Vec<String>),
    /// Alternatives, the first one that matches wins
    Alternation(Vec<FilterMatch>),
}

impl FilterMatch {
    /// Splits and verifies `pattern`, so that a malformed expression is reported
    /// before any test runs.
    pub fn compile(pattern: &str, matcher: &Matcher) -> Result<Self> {
        let mut filter = Self::split(pattern);
        filter.verify(pattern, matcher)?;
        Ok(filter)
    }

    /// Splits `pattern` on `/` and `|`, ignoring separators inside character
    /// classes and groups, and after a backslash.
    pub fn split(pattern: &str) -> Self {
        let bytes = pattern.as_bytes();
        let mut simple: Vec<String> = Vec::new();
        let mut alternation: Vec<FilterMatch> = Vec::new();
        let mut class_depth = 0i32;
        let mut group_depth = 0i32;
        let mut start = 0;

        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'[' => class_depth += 1,
                b']' => class_depth = (class_depth - 1).max(0),
                b'(' if class_depth == 0 => group_depth += 1,
                b')' if class_depth == 0 => group_depth -= 1,
                b'\\' => i += 1,
                b'/' if class_depth == 0 && group_depth == 0 => {
                    simple.push(pattern[start..i].to_string());
                    start = i + 1;
                }
                b'|' if class_depth == 0 && group_depth == 0 => {
                    simple.push(pattern[start..i].to_string());
                    start = i + 1;
                    alternation.push(FilterMatch::Simple(std::mem::take(&mut simple)));
                }
                _ => {}
            }
            i += 1;
        }
        simple.push(pattern.get(start..).unwrap_or_default().to_string());

        if alternation.is_empty() {
            return FilterMatch::Simple(simple);
        }
        alternation.push(FilterMatch::Simple(simple));
        FilterMatch::Alternation(alternation)
    }

    /// Matches the elements of a test name. The second value reports a partial
    /// match: `name` is shallower than the pattern, so a subtest could still match.
    pub fn matches(&self, name: &[&str], matcher: &Matcher) -> (bool, bool) {
        match self {
            FilterMatch::Simple(elems) => {
                for (pattern, element) in elems.iter().zip(name) {
                    if !matcher.match_string(pattern, element).unwrap_or(false) {
                        return (false, false);
                    }
                }
                (true, name.len() < elems.len())
            }
            FilterMatch::Alternation(branches) => branches
                .iter()
                .map(|branch| branch.matches(name, matcher))
                .find(|(ok, _)| *ok)
                .unwrap_or((false, false)),
        }
    }

    /// Rewrites every element into a printable form and checks that it compiles.
    pub fn verify(&mut self, pattern: &str, matcher: &Matcher) -> Result<()> {
        match self {
            FilterMatch::Simple(elems) => {
                for elem in elems.iter_mut() {
                    *elem = rewrite(elem);
                }
                for (index, elem) in elems.iter().enumerate() {
                    if let Err(source) = matcher.match_string(elem, "non-empty") {
                        return Err(TestError::MalformedPattern {
                            index,
                            element: elem.clone(),
                            pattern: pattern.to_string(),
                            source,
                        });
                    }
                }
                Ok(())
            }
            FilterMatch::Alternation(branches) => {
                for branch in branches.iter_mut() {
                    branch.verify(pattern, matcher)?;
                }
                Ok(())
            }
        }
    }
}

/// Replaces spaces with underscores and escapes non-printable characters, the
/// same way test names are sanitized.
pub fn rewrite(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_whitespace() {
            out.push('_');
        } else if c.is_control() {
            out.extend(c.escape_default());
        } else {
            out.push(c);
        }
    }
    out
}

/// Reports whether the test named `path` (elements separated by `/`) should run.
pub fn should_run(filter: Option<&FilterMatch>, matcher: &Matcher, path: &str) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    let elems: Vec<&str> = path.split('/').collect();
    filter.matches(&elems, matcher).0
}
