use regex::Regex;

use crate::error::{Result, WeftError};

/// A compiled topic pattern: exact name, `*` wildcard, or glob.
///
/// Globs translate `*` to `.*` and `?` to `.`, anchored at both ends, so
/// `data.*` matches `data.processed` and `data.x.y` but not `dataset.processed`.
#[derive(Debug, Clone)]
pub enum TopicPattern {
    Any,
    Exact(String),
    Glob { source: String, regex: Regex },
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern == "*" {
            return Ok(Self::Any);
        }
        if !pattern.contains(['*', '?']) {
            return Ok(Self::Exact(pattern.to_string()));
        }

        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        for c in pattern.chars() {
            match c {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(&other.to_string())),
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr)
            .map_err(|e| WeftError::Validation(format!("invalid topic pattern '{}': {}", pattern, e)))?;
        Ok(Self::Glob {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(t) => t == topic,
            Self::Glob { regex, .. } => regex.is_match(topic),
        }
    }

    /// The single topic this pattern can match, if it is exact.
    pub fn exact(&self) -> Option<&str> {
        match self {
            Self::Exact(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Any => "*",
            Self::Exact(t) => t,
            Self::Glob { source, .. } => source,
        }
    }
}

impl std::fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
