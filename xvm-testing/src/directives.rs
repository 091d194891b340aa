//! Filetest directives
//!
//! A filetest is an ordinary program annotated with comment directives. Input
//! directives are written on a single line (`// PKGPATH: x.land/r/demo`), golden
//! directives open a block whose content is carried by the following comment
//! lines:
//!
//! ```text
//! // Output:
//! // hello
//! ```
//!
//! Everything that is not a directive is kept as anonymous chunks, so that the
//! file can be regenerated byte for byte with [`Directives::file_test`].

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::error::{Result, TestError};

// Input directives, single line.
pub const DIRECTIVE_PKG_PATH: &str = "PKGPATH";
pub const DIRECTIVE_MAX_ALLOC: &str = "MAXALLOC";
pub const DIRECTIVE_SEND: &str = "SEND";

// Golden directives, matched against the result of the run.
pub const DIRECTIVE_OUTPUT: &str = "Output";
pub const DIRECTIVE_ERROR: &str = "Error";
pub const DIRECTIVE_REALM: &str = "Realm";
pub const DIRECTIVE_EVENTS: &str = "Events";
pub const DIRECTIVE_PREPROCESSED: &str = "Preprocessed";
pub const DIRECTIVE_STACKTRACE: &str = "Stacktrace";

const COMMENT_PREFIX: &str = "//";

/// Either `PascalCase:` alone, or `ALLCAPS: content` on the same line.
static DIRECTIVE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:([A-Z][a-z]*):|([A-Z]+):( ?)(.*))$").expect("directive pattern is valid")
});

/// How a named directive is written in the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveForm {
    /// `// Name:` followed by content lines
    #[default]
    Block,
    /// `// NAME: content`; `spaced` is false for `// NAME:content`
    Line { spaced: bool },
}

/// A directive of a filetest.
///
/// Directives with an empty name are verbatim pieces of the source file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Directive {
    pub name: String,
    pub content: String,
    pub form: DirectiveForm,
    /// Set once the directive can no longer receive content lines.
    pub complete: bool,
}

impl Directive {
    fn anonymous(content: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            content: content.into(),
            form: DirectiveForm::Block,
            complete: false,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.name.is_empty()
    }
}

/// The ordered directives of a filetest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Directives(pub Vec<Directive>);

impl Directives {
    /// Parses all the directives of the filetest in `source`.
    pub fn parse(source: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(source)
            .map_err(|e| TestError::directive(format!("source is not valid UTF-8: {e}")))?;

        let mut parsed: Vec<Directive> = Vec::with_capacity(8);
        for line in text.lines() {
            let Some(rest) = line.strip_prefix(COMMENT_PREFIX) else {
                push_source_line(&mut parsed, line);
                continue;
            };
            let comment = rest.strip_prefix(' ').unwrap_or(rest);

            let Some(caps) = DIRECTIVE_LINE.captures(comment) else {
                match parsed.last_mut() {
                    Some(last) if !last.is_anonymous() && !last.complete => {
                        last.content.push_str(comment);
                        last.content.push('\n');
                    }
                    Some(last) if last.is_anonymous() => {
                        last.content.push_str(line);
                        last.content.push('\n');
                    }
                    _ => parsed.push(Directive::anonymous(format!("{line}\n"))),
                }
                continue;
            };

            close_last(&mut parsed);
            if let Some(name) = caps.get(1) {
                parsed.push(Directive {
                    name: name.as_str().to_string(),
                    content: String::new(),
                    form: DirectiveForm::Block,
                    complete: false,
                });
            } else {
                let name = caps.get(2).map_or("", |m| m.as_str());
                let spaced = caps.get(3).is_some_and(|m| !m.as_str().is_empty());
                let content = caps.get(4).map_or("", |m| m.as_str());
                parsed.push(Directive {
                    name: name.to_string(),
                    content: content.to_string(),
                    form: DirectiveForm::Line { spaced },
                    complete: true,
                });
                // Forces whatever follows into a new chunk.
                parsed.push(Directive::anonymous(""));
            }
        }

        Ok(Self(parsed))
    }

    /// Returns the first directive called `name`.
    pub fn first(&self, name: &str) -> Option<&Directive> {
        if name.is_empty() {
            return None;
        }
        self.0.iter().find(|d| d.name == name)
    }

    pub fn first_mut(&mut self, name: &str) -> Option<&mut Directive> {
        if name.is_empty() {
            return None;
        }
        self.0.iter_mut().find(|d| d.name == name)
    }

    /// Content of [`Directives::first`], or `default` when absent.
    pub fn first_default<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.first(name).map_or(default, |d| d.content.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Directive> {
        self.0.iter()
    }

    /// Regenerates the filetest source; the inverse of [`Directives::parse`].
    pub fn file_test(&self) -> String {
        let mut out = String::new();
        for dir in &self.0 {
            if dir.is_anonymous() {
                out.push_str(&dir.content);
            } else if let DirectiveForm::Line { spaced } = dir.form {
                let sep = if spaced { " " } else { "" };
                out.push_str(&format!("{COMMENT_PREFIX} {}:{sep}{}\n", dir.name, dir.content));
            } else {
                out.push_str(&format!("{COMMENT_PREFIX} {}:\n", dir.name));
                if dir.content.is_empty() {
                    continue;
                }
                let content = dir.content.strip_suffix('\n').unwrap_or(&dir.content);
                for line in content.split('\n') {
                    out.push_str(COMMENT_PREFIX);
                    if !line.is_empty() {
                        out.push(' ');
                        out.push_str(line);
                    }
                    out.push('\n');
                }
            }
        }
        out
    }

    /// Puts exactly one space between the colon and the content of every
    /// single-line directive, and none when the content is empty.
    pub fn normalize(&mut self) {
        for dir in &mut self.0 {
            if let DirectiveForm::Line { spaced } = &mut dir.form {
                *spaced = !dir.content.is_empty();
            }
        }
    }
}

fn push_source_line(parsed: &mut Vec<Directive>, line: &str) {
    match parsed.last_mut() {
        Some(last) if last.is_anonymous() => {
            last.content.push_str(line);
            last.content.push('\n');
        }
        _ => {
            close_last(parsed);
            parsed.push(Directive::anonymous(format!("{line}\n")));
        }
    }
}

fn close_last(parsed: &mut [Directive]) {
    if let Some(last) = parsed.last_mut() {
        if !last.is_anonymous() {
            last.complete = true;
        }
    }
}
