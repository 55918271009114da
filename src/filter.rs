//! Call filtering for `module!function` names
//!
//! Filters come from a line-oriented filter file:
//!
//! ```text
//! # comment
//! [whitelist]
//! libc.so.6!malloc
//! libc.so.6!str*
//! libssl.so.3
//!
//! [blacklist]
//! libc.so.6!free
//! ```
//!
//! - `module!function` entries are function-level rules
//! - `module` entries (no `!`) are module-level rules, and also match every
//!   function of that module
//! - a trailing `*` marks a wildcard rule
//! - if any whitelist entry exists, the blacklist is discarded entirely
//!
//! Rule sets are built once and never mutated, so a `FilterEngine` can be
//! shared freely between threads.

use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while loading a filter file
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Failed to read filter file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A single white/black list entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRule {
    pattern: String,
    is_wildcard: bool,
}

impl FilterRule {
    /// Build a rule from a raw filter entry.
    ///
    /// A trailing `*` is stripped and marks the rule as a wildcard. An entry
    /// naming only a module (no `!`) is a wildcard as well.
    pub fn parse(entry: &str) -> Self {
        if let Some(prefix) = entry.strip_suffix('*') {
            Self {
                pattern: prefix.to_string(),
                is_wildcard: true,
            }
        } else {
            Self {
                pattern: entry.to_string(),
                is_wildcard: !entry.contains('!'),
            }
        }
    }

    /// Exact-match rule, used for module names taken from `module!function`
    pub fn exact(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            is_wildcard: false,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_wildcard(&self) -> bool {
        self.is_wildcard
    }

    /// Test a candidate name against this rule.
    ///
    /// Wildcard rules compare only the first `min(len(pattern), len(candidate))`
    /// bytes of both strings, so a candidate shorter than the pattern can match
    /// too (`"ab"` matches `"abc*"`).
    pub fn matches(&self, candidate: &str) -> bool {
        if self.is_wildcard {
            prefix_eq(self.pattern.as_bytes(), candidate.as_bytes())
        } else {
            self.pattern == candidate
        }
    }
}

/// Symmetric min-length comparison shared by the filter and the return-value cache
pub fn prefix_eq(a: &[u8], b: &[u8]) -> bool {
    let n = a.len().min(b.len());
    a[..n] == b[..n]
}

/// Build the `module!function` name used for matching.
///
/// An unknown module is left out entirely.
pub fn qualified_name(module: Option<&str>, function: &str) -> String {
    match module {
        Some(module) => format!("{}!{}", module, function),
        None => function.to_string(),
    }
}

/// Per-call and per-module filter built from white/black lists
#[derive(Debug, Clone, Default)]
pub struct FilterEngine {
    function_whitelist: Vec<FilterRule>,
    function_blacklist: Vec<FilterRule>,
    module_whitelist: Vec<FilterRule>,
    module_blacklist: Vec<FilterRule>,
}

impl FilterEngine {
    /// Create a filter that traces everything
    pub fn all() -> Self {
        Self::default()
    }

    /// Build a filter from raw whitelist and blacklist entries.
    ///
    /// A non-empty whitelist discards the blacklist.
    pub fn from_lists<S: AsRef<str>>(whitelist: &[S], blacklist: &[S]) -> Self {
        let mut engine = Self::default();

        if !whitelist.is_empty() {
            engine.function_whitelist =
                build_rules(whitelist, true, &mut engine.module_whitelist);
        } else if !blacklist.is_empty() {
            engine.function_blacklist =
                build_rules(blacklist, false, &mut engine.module_blacklist);
        }

        tracing::debug!(
            whitelist = engine.function_whitelist.len(),
            blacklist = engine.function_blacklist.len(),
            module_whitelist = engine.module_whitelist.len(),
            module_blacklist = engine.module_blacklist.len(),
            "filter rules built"
        );

        engine
    }

    /// Parse filter file contents
    pub fn parse(text: &str) -> Self {
        #[derive(Clone, Copy)]
        enum Section {
            None,
            Whitelist,
            Blacklist,
        }

        let mut section = Section::None;
        let mut whitelist = Vec::new();
        let mut blacklist = Vec::new();

        for line in text.lines() {
            // Only the CRLF artifact is stripped; other whitespace is part of the entry
            let line = line.strip_suffix('\r').unwrap_or(line);

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match line {
                "[whitelist]" => section = Section::Whitelist,
                "[blacklist]" => section = Section::Blacklist,
                entry => match section {
                    Section::Whitelist => whitelist.push(entry),
                    Section::Blacklist => blacklist.push(entry),
                    Section::None => {}
                },
            }
        }

        if !whitelist.is_empty() && !blacklist.is_empty() {
            tracing::debug!(
                ignored = blacklist.len(),
                "whitelist present, ignoring blacklist entries"
            );
        }

        Self::from_lists(&whitelist, &blacklist)
    }

    /// Load and parse a filter file
    pub fn from_file(path: &Path) -> Result<Self, FilterError> {
        let text = std::fs::read_to_string(path).map_err(|source| FilterError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::parse(&text))
    }

    /// Decide whether a call into `module!function` is traced
    pub fn decide(&self, module: Option<&str>, function: &str) -> bool {
        let qualified = qualified_name(module, function);
        self.decide_qualified(&qualified)
    }

    /// Same as [`decide`](Self::decide) for an already-built qualified name
    pub fn decide_qualified(&self, qualified: &str) -> bool {
        if !self.function_whitelist.is_empty() {
            self.function_whitelist
                .iter()
                .any(|rule| rule.matches(qualified))
        } else if !self.function_blacklist.is_empty() {
            !self
                .function_blacklist
                .iter()
                .any(|rule| rule.matches(qualified))
        } else {
            true
        }
    }

    /// Decide whether a module should be instrumented at all
    pub fn module_allowed(&self, module: Option<&str>) -> bool {
        if !self.module_whitelist.is_empty() {
            match module {
                Some(name) => self.module_whitelist.iter().any(|rule| rule.matches(name)),
                None => false,
            }
        } else if !self.module_blacklist.is_empty() {
            match module {
                Some(name) => !self.module_blacklist.iter().any(|rule| rule.matches(name)),
                None => true,
            }
        } else {
            true
        }
    }

    pub fn function_whitelist(&self) -> &[FilterRule] {
        &self.function_whitelist
    }

    pub fn function_blacklist(&self) -> &[FilterRule] {
        &self.function_blacklist
    }

    pub fn module_whitelist(&self) -> &[FilterRule] {
        &self.module_whitelist
    }

    pub fn module_blacklist(&self) -> &[FilterRule] {
        &self.module_blacklist
    }

    /// True when no rule of any kind is configured
    pub fn is_empty(&self) -> bool {
        self.function_whitelist.is_empty()
            && self.function_blacklist.is_empty()
            && self.module_whitelist.is_empty()
            && self.module_blacklist.is_empty()
    }
}

impl FromStr for FilterEngine {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

/// Convert raw entries to function rules, registering module rules on the side
fn build_rules<S: AsRef<str>>(
    entries: &[S],
    is_whitelist: bool,
    modules: &mut Vec<FilterRule>,
) -> Vec<FilterRule> {
    let mut rules = Vec::with_capacity(entries.len());

    for entry in entries {
        let entry = entry.as_ref();

        match entry.split_once('!') {
            None => add_module_rule(modules, FilterRule::parse(entry)),
            // Otherwise module-level filtering would reject the function before
            // it is ever tested.
            Some((module, _)) if is_whitelist => {
                add_module_rule(modules, FilterRule::exact(module))
            }
            Some(_) => {}
        }

        rules.push(FilterRule::parse(entry));
    }

    rules
}

fn add_module_rule(modules: &mut Vec<FilterRule>, rule: FilterRule) {
    if !modules.iter().any(|existing| existing.pattern == rule.pattern) {
        modules.push(rule);
    }
}
