//! Wildcard target patterns compiled into anchored, case-insensitive regexes.

use parking_lot::RwLock;
use regex::{Regex, RegexBuilder};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("malformed target pattern {line:?}: contains whitespace")]
    Whitespace { line: String },
    #[error("invalid target pattern {line:?}: {source}")]
    Regex {
        line: String,
        #[source]
        source: regex::Error,
    },
}

/// One compiled wildcard pattern, e.g. `*.example.com`.
#[derive(Debug, Clone)]
pub struct TargetPattern {
    raw: String,
    regex: Regex,
}

impl TargetPattern {
    pub fn compile(raw: &str) -> Result<Self, CompileError> {
        if raw.chars().any(char::is_whitespace) {
            return Err(CompileError::Whitespace { line: raw.to_string() });
        }
        let escaped = regex::escape(raw).replace(r"\*", ".*");
        let regex = RegexBuilder::new(&format!("^{}$", escaped))
            .case_insensitive(true)
            .build()
            .map_err(|source| CompileError::Regex { line: raw.to_string(), source })?;
        Ok(TargetPattern { raw: raw.to_string(), regex })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }
}

/// The compiled in-scope pattern set.
#[derive(Debug, Clone, Default)]
pub struct TargetSet {
    patterns: Vec<TargetPattern>,
}

impl TargetSet {
    /// Compile newline-style pattern lines. Blank lines and `#` comments are skipped,
    /// and any line mentioning an excluded source (case-insensitive substring) is dropped
    /// before compilation.
    pub fn compile<I, S>(lines: I, excluded_sources: &[String]) -> Result<Self, CompileError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let excluded: Vec<String> = excluded_sources.iter().map(|s| s.to_lowercase()).filter(|s| !s.is_empty()).collect();
        let mut patterns = Vec::new();
        for line in lines {
            let line = line.as_ref().trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let lower = line.to_lowercase();
            if excluded.iter().any(|x| lower.contains(x.as_str())) {
                continue;
            }
            patterns.push(TargetPattern::compile(line)?);
        }
        Ok(TargetSet { patterns })
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }

    /// First pattern matching `name`, if any.
    pub fn matching(&self, name: &str) -> Option<&TargetPattern> {
        self.patterns.iter().find(|p| p.matches(name))
    }
}

/// Shared handle to the current target set. Readers take a cheap snapshot; a refresh
/// swaps the whole set atomically.
#[derive(Debug, Clone, Default)]
pub struct Targets {
    inner: Arc<RwLock<Arc<TargetSet>>>,
}

impl Targets {
    pub fn new(set: TargetSet) -> Self {
        Targets { inner: Arc::new(RwLock::new(Arc::new(set))) }
    }

    pub fn snapshot(&self) -> Arc<TargetSet> {
        self.inner.read().clone()
    }

    pub fn replace(&self, set: TargetSet) {
        *self.inner.write() = Arc::new(set);
    }
}
