//! Name filter composition
//!
//! A run's effective filter is the conjunction of an anchor built from the
//! suites of a selected file and the caller's own name pattern. A candidate
//! title is selected only when both parts independently match the full
//! title string.

use regex::Regex;

use crate::common::{Error, Result};

/// Regex metacharacters escaped when a suite title is embedded as a literal
const METACHARACTERS: &[char] = &[
    '.', '*', '+', '?', '^', '$', '{', '}', '(', ')', '|', '[', ']', '\\',
];

/// Escape a title so it can be embedded literally in a pattern
pub fn escape_title(title: &str) -> String {
    let mut escaped = String::with_capacity(title.len());
    for ch in title.chars() {
        if METACHARACTERS.contains(&ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Composed name filter applied to fully-qualified test titles
#[derive(Debug, Clone)]
pub struct NameFilter {
    /// Anchored alternation over the escaped titles of a file's suites
    anchor: Option<Regex>,
    /// The caller's own name pattern, applied as a search
    pattern: Option<Regex>,
    /// Human-readable description of the selection, for the start event
    pub description: String,
}

impl NameFilter {
    /// Filter selecting every test
    pub fn all() -> Self {
        Self {
            anchor: None,
            pattern: None,
            description: "all tests".to_string(),
        }
    }

    /// Compose a filter from an optional grep pattern and the escaped
    /// titles of the suites matched by a file pattern
    ///
    /// `escaped_titles` is `None` when no file filter was supplied. An
    /// empty title list is a caller bug; file patterns matching zero suites
    /// must fail fast before composition.
    pub fn compose(
        grep: Option<&str>,
        escaped_titles: Option<&[String]>,
        file_pattern: Option<&str>,
    ) -> Result<Self> {
        let anchor = match escaped_titles {
            Some(titles) => {
                let source = format!("^({})", titles.join("|"));
                Some(
                    Regex::new(&source)
                        .map_err(|e| Error::invalid_pattern(&source, e))?,
                )
            }
            None => None,
        };

        let pattern = match grep {
            Some(p) => Some(Regex::new(p).map_err(|e| Error::invalid_pattern(p, e))?),
            None => None,
        };

        let description = match (grep, file_pattern, escaped_titles) {
            (Some(g), Some(f), Some(titles)) => {
                format!("file \"{}\" ({} suites) and /{}/", f, titles.len(), g)
            }
            (None, Some(f), Some(titles)) => format!("file \"{}\" ({} suites)", f, titles.len()),
            (Some(g), None, _) => format!("/{}/", g),
            _ => "all tests".to_string(),
        };

        Ok(Self {
            anchor,
            pattern,
            description,
        })
    }

    /// Whether a fully-qualified title satisfies both filter parts
    ///
    /// Inversion is applied by the engine, not here.
    pub fn matches(&self, full_title: &str) -> bool {
        let anchor_ok = self.anchor.as_ref().map_or(true, |r| r.is_match(full_title));
        let pattern_ok = self
            .pattern
            .as_ref()
            .map_or(true, |r| r.is_match(full_title));
        anchor_ok && pattern_ok
    }
}

impl Default for NameFilter {
    fn default() -> Self {
        Self::all()
    }
}
