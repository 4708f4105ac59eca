//! Ant-style path patterns for filter include/exclude lists.
//!
//! `*` matches within one path segment, `**` matches across segments, and
//! `?` matches a single character. Patterns compile to anchored regexes
//! once, at filter construction.

use regex::Regex;

use crate::error::{FluxgateError, Result};

/// A compiled set of Ant-style path patterns.
#[derive(Debug, Clone, Default)]
pub struct PathMatcher {
    patterns: Vec<(String, Regex)>,
}

impl PathMatcher {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            compiled.push((pattern.clone(), compile(pattern)?));
        }
        Ok(Self { patterns: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|(_, regex)| regex.is_match(path))
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    let mut regex = String::from("^");

    // A trailing `/**` also matches the bare prefix itself.
    let (body, tail) = match pattern.strip_suffix("/**") {
        Some(body) if !body.is_empty() => (body, "(/.*)?"),
        _ => (pattern, ""),
    };

    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    regex.push_str(".*");
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '?' => regex.push_str("[^/]"),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push_str(tail);
    regex.push('$');

    Regex::new(&regex)
        .map_err(|e| FluxgateError::Config(format!("invalid path pattern '{pattern}': {e}")))
}
