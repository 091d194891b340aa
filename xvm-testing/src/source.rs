//! Lightweight scanning of source file headers
//!
//! The engine never needs a full parse of the program: the package clause and
//! the top-level import declarations are enough to classify files and to build
//! dependency fingerprints.

use std::iter::Peekable;
use std::str::CharIndices;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Result, TestError};

static TEST_FUNC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^func\s+(Test[A-Za-z0-9_]*)\s*\(").expect("test function pattern is valid")
});

/// A single import declaration, such as `avl "x.land/p/demo/avl"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportDecl {
    /// Local name, `.` or `_` when given
    pub name: Option<String>,
    pub path: String,
}

/// Package clause and imports of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub package: String,
    pub imports: Vec<ImportDecl>,
}

/// Visits import declarations in source order.
pub trait ImportVisitor {
    fn visit_import(&mut self, decl: &ImportDecl);
}

impl FileHeader {
    /// Scans the package clause and the import declarations of `source`.
    pub fn parse(filename: &str, source: &str) -> Result<Self> {
        HeaderParser::new(source)
            .parse()
            .map_err(|message| TestError::parse(filename, message))
    }

    pub fn walk_imports<V: ImportVisitor>(&self, visitor: &mut V) {
        for decl in &self.imports {
            visitor.visit_import(decl);
        }
    }
}

/// Names of the top-level functions starting with `Test`.
pub fn test_functions(source: &str) -> Vec<String> {
    TEST_FUNC
        .captures_iter(source)
        .map(|caps| caps[1].to_string())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Punct(char),
}

struct HeaderParser<'a> {
    src: &'a str,
    chars: Peekable<CharIndices<'a>>,
    peeked: Option<Token>,
}

impl<'a> HeaderParser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            chars: src.char_indices().peekable(),
            peeked: None,
        }
    }

    fn parse(mut self) -> std::result::Result<FileHeader, String> {
        match self.next()? {
            Some(Token::Ident(kw)) if kw == "package" => {}
            other => return Err(format!("expected 'package', found {}", describe(&other))),
        }
        let package = match self.next()? {
            Some(Token::Ident(name)) => name,
            other => return Err(format!("expected package name, found {}", describe(&other))),
        };
        self.skip_semicolon()?;

        let mut imports = Vec::new();
        while matches!(self.peek()?, Some(Token::Ident(kw)) if kw == "import") {
            self.next()?;
            if self.peek()? == Some(&Token::Punct('(')) {
                self.next()?;
                loop {
                    self.skip_semicolon()?;
                    if self.peek()? == Some(&Token::Punct(')')) {
                        self.next()?;
                        break;
                    }
                    imports.push(self.import_spec()?);
                }
            } else {
                imports.push(self.import_spec()?);
            }
            self.skip_semicolon()?;
        }

        Ok(FileHeader { package, imports })
    }

    fn import_spec(&mut self) -> std::result::Result<ImportDecl, String> {
        let name = match self.peek()? {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.next()?;
                Some(name)
            }
            Some(Token::Punct('.')) => {
                self.next()?;
                Some(".".to_string())
            }
            _ => None,
        };
        match self.next()? {
            Some(Token::Str(path)) if !path.is_empty() => Ok(ImportDecl { name, path }),
            other => Err(format!("expected import path, found {}", describe(&other))),
        }
    }

    fn skip_semicolon(&mut self) -> std::result::Result<(), String> {
        while self.peek()? == Some(&Token::Punct(';')) {
            self.next()?;
        }
        Ok(())
    }

    fn peek(&mut self) -> std::result::Result<Option<&Token>, String> {
        if self.peeked.is_none() {
            self.peeked = self.lex()?;
        }
        Ok(self.peeked.as_ref())
    }

    fn next(&mut self) -> std::result::Result<Option<Token>, String> {
        match self.peeked.take() {
            Some(tok) => Ok(Some(tok)),
            None => self.lex(),
        }
    }

    fn lex(&mut self) -> std::result::Result<Option<Token>, String> {
        loop {
            let Some(&(start, c)) = self.chars.peek() else {
                return Ok(None);
            };
            if c.is_whitespace() {
                self.chars.next();
                continue;
            }
            if c == '/' && self.src[start..].starts_with("//") {
                while let Some((_, c)) = self.chars.next() {
                    if c == '\n' {
                        break;
                    }
                }
                continue;
            }
            if c == '/' && self.src[start..].starts_with("/*") {
                let end = self.src[start + 2..]
                    .find("*/")
                    .ok_or("comment not terminated")?;
                let resume = start + 2 + end + 2;
                while matches!(self.chars.peek(), Some(&(i, _)) if i < resume) {
                    self.chars.next();
                }
                continue;
            }
            if c.is_alphabetic() || c == '_' {
                let mut ident = String::new();
                while let Some(&(_, c)) = self.chars.peek() {
                    if !(c.is_alphanumeric() || c == '_') {
                        break;
                    }
                    ident.push(c);
                    self.chars.next();
                }
                return Ok(Some(Token::Ident(ident)));
            }
            if c == '"' || c == '`' {
                self.chars.next();
                let mut lit = String::new();
                loop {
                    match self.chars.next() {
                        Some((_, ch)) if ch == c => break,
                        Some((_, '\\')) if c == '"' => {
                            return Err("unexpected invalid import path".to_string());
                        }
                        Some((_, '\n')) if c == '"' => return Err("string literal not terminated".to_string()),
                        Some((_, ch)) => lit.push(ch),
                        None => return Err("string literal not terminated".to_string()),
                    }
                }
                return Ok(Some(Token::Str(lit)));
            }
            self.chars.next();
            return Ok(Some(Token::Punct(c)));
        }
    }
}

fn describe(tok: &Option<Token>) -> String {
    match tok {
        Some(Token::Ident(s)) => format!("'{s}'"),
        Some(Token::Str(s)) => format!("{s:?}"),
        Some(Token::Punct(c)) => format!("'{c}'"),
        None => "end of file".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"// Package demo is a demo.
package demo

import "std"

/* grouped
   imports */
import (
	"x.land/p/demo/avl"
	ufmt "x.land/p/demo/ufmt"; _ "x.land/p/demo/blank"
	. "x.land/p/demo/dot"
)

func TestAdd(t *testing.T) {}

func helper() {}

func TestSub (t *testing.T) {}
"#;

    #[test]
    fn test_parse_header() {
        let header = FileHeader::parse("demo.x", SOURCE).unwrap();
        assert_eq!(header.package, "demo");
        let paths: Vec<&str> = header.imports.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "std",
                "x.land/p/demo/avl",
                "x.land/p/demo/ufmt",
                "x.land/p/demo/blank",
                "x.land/p/demo/dot",
            ]
        );
        assert_eq!(header.imports[2].name.as_deref(), Some("ufmt"));
        assert_eq!(header.imports[3].name.as_deref(), Some("_"));
        assert_eq!(header.imports[4].name.as_deref(), Some("."));
    }

    #[test]
    fn test_visitor_sees_every_import() {
        struct Count(usize);
        impl ImportVisitor for Count {
            fn visit_import(&mut self, _decl: &ImportDecl) {
                self.0 += 1;
            }
        }

        let header = FileHeader::parse("demo.x", SOURCE).unwrap();
        let mut count = Count(0);
        header.walk_imports(&mut count);
        assert_eq!(count.0, 5);
    }

    #[test]
    fn test_missing_package_clause() {
        let err = FileHeader::parse("bad.x", "func main() {}").unwrap_err();
        assert!(err.to_string().contains("expected 'package'"));
    }

    #[test]
    fn test_test_functions() {
        assert_eq!(test_functions(SOURCE), vec!["TestAdd", "TestSub"]);
    }
}
