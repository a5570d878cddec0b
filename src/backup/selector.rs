//! Pick tables for freeze and restore with shell-style patterns like `sales.*`

use regex::Regex;
use thiserror::Error;

use super::types::{BackupCatalog, BackupTable, Table};

/// Errors from parsing table patterns
#[derive(Error, Debug)]
pub enum SelectionError {
    /// The glob could not be compiled
    #[error("invalid table pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// Pattern as given
        pattern: String,
        /// Why it was rejected
        reason: String,
    },
}

/// A shell glob matched against `<database>.<table>`.
///
/// `*` matches any run of characters except `/`, `?` one such character, `[...]` a class
/// (`[^...]` negated, `a-z` ranges) and `\` escapes the next character.
#[derive(Debug, Clone)]
pub struct TablePattern {
    regex: Regex,
}

impl TablePattern {
    /// Compile a glob, rejecting unterminated classes and trailing escapes
    pub fn new(pattern: &str) -> Result<Self, SelectionError> {
        let invalid = |reason: &str| SelectionError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let source = glob_to_regex(pattern).map_err(|reason| invalid(reason))?;
        let regex = Regex::new(&source).map_err(|e| invalid(&e.to_string()))?;

        Ok(Self { regex })
    }

    /// Whether `name` (`<database>.<table>`) matches the whole pattern
    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }
}

fn escaped(c: char) -> String {
    regex::escape(c.encode_utf8(&mut [0; 4]))
}

fn glob_to_regex(pattern: &str) -> Result<String, &'static str> {
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '\\' => {
                let next = chars.next().ok_or("trailing escape")?;
                out.push_str(&escaped(next));
            }
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    out.push('^');
                }
                let mut empty = true;
                loop {
                    match chars.next().ok_or("unterminated character class")? {
                        ']' if empty => return Err("empty character class"),
                        ']' => break,
                        '\\' => {
                            let next = chars.next().ok_or("trailing escape")?;
                            out.push_str(&escaped(next));
                        }
                        '-' if !empty && chars.peek().is_some_and(|&n| n != ']') => out.push('-'),
                        other => out.push_str(&escaped(other)),
                    }
                    empty = false;
                }
                out.push(']');
            }
            other => out.push_str(&escaped(other)),
        }
    }

    out.push('$');
    Ok(out)
}

fn compile(patterns: &[String]) -> Result<Vec<TablePattern>, SelectionError> {
    patterns.iter().map(|p| TablePattern::new(p)).collect()
}

/// Tables to freeze, in catalog order.
///
/// No patterns selects everything. A table matched by several patterns appears once.
pub fn select_for_freeze(tables: &[Table], patterns: &[String]) -> Result<Vec<Table>, SelectionError> {
    if patterns.is_empty() {
        return Ok(tables.to_vec());
    }
    let patterns = compile(patterns)?;

    Ok(tables
        .iter()
        .filter(|table| {
            let name = table.full_name();
            patterns.iter().any(|p| p.matches(&name))
        })
        .cloned()
        .collect())
}

/// Frozen tables to restore, in catalog order.
///
/// No patterns means `*`. With a non-empty `increments` only those freeze generations are
/// kept.
pub fn select_for_restore(
    catalog: &BackupCatalog,
    patterns: &[String],
    increments: &[u32],
) -> Result<Vec<BackupTable>, SelectionError> {
    let patterns = if patterns.is_empty() {
        vec![TablePattern::new("*")?]
    } else {
        compile(patterns)?
    };

    Ok(catalog
        .values()
        .filter(|table| {
            let name = table.full_name();
            patterns.iter().any(|p| p.matches(&name))
        })
        .filter(|table| increments.is_empty() || increments.contains(&table.increment))
        .cloned()
        .collect())
}
