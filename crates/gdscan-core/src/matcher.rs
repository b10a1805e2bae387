//! Pattern match stage

use gdscan_config::PatternMode;
use regex::bytes::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Predicate applied to the bytes of each ingested file
pub trait PatternMatcher {
    /// Number of non-overlapping matches in `haystack`
    fn count_matches(&self, haystack: &[u8]) -> usize;

    /// Whether `haystack` contains at least one match
    fn is_match(&self, haystack: &[u8]) -> bool {
        self.count_matches(haystack) > 0
    }
}

/// How a pattern string is interpreted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Regular expression syntax
    #[default]
    Regex,
    /// Exact substring
    Literal,
}

impl From<PatternMode> for MatchMode {
    fn from(mode: PatternMode) -> Self {
        match mode {
            PatternMode::Regex => MatchMode::Regex,
            PatternMode::Literal => MatchMode::Literal,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatcherOptions {
    pub mode: MatchMode,
    pub case_insensitive: bool,
}

/// Unanchored byte regex over the whole file
#[derive(Debug, Clone)]
pub struct RegexMatcher {
    pattern: String,
    regex: Regex,
}

impl RegexMatcher {
    /// Compile `pattern`
    ///
    /// # Errors
    /// `EmptyPattern` for `""`, `InvalidPattern` if it does not compile.
    pub fn new(pattern: &str, options: MatcherOptions) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::EmptyPattern);
        }

        let source = match options.mode {
            MatchMode::Regex => pattern.to_string(),
            MatchMode::Literal => regex::escape(pattern),
        };
        let regex = RegexBuilder::new(&source)
            .case_insensitive(options.case_insensitive)
            .build()?;

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// Pattern as given by the caller
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl PatternMatcher for RegexMatcher {
    fn count_matches(&self, haystack: &[u8]) -> usize {
        self.regex.find_iter(haystack).count()
    }

    fn is_match(&self, haystack: &[u8]) -> bool {
        self.regex.is_match(haystack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regex(pattern: &str) -> RegexMatcher {
        RegexMatcher::new(pattern, MatcherOptions::default()).unwrap()
    }

    #[test]
    fn test_substring_semantics() {
        let m = regex("foo");
        assert!(m.is_match(b"foo bar"));
        assert!(!m.is_match(b"baz"));
        assert_eq!(m.count_matches(b"foofoo foo"), 3);
    }

    #[test]
    fn test_regex_syntax() {
        let m = regex(r"ba[rz]\b");
        assert!(m.is_match(b"foo bar"));
        assert!(m.is_match(b"baz"));
        assert!(!m.is_match(b"bart"));
    }

    #[test]
    fn test_binary_haystack() {
        let m = regex("foo");
        assert!(m.is_match(&[0xff, 0x00, b'f', b'o', b'o', 0xfe]));
    }

    #[test]
    fn test_case_sensitivity() {
        assert!(!regex("foo").is_match(b"FOO"));

        let m = RegexMatcher::new(
            "foo",
            MatcherOptions {
                case_insensitive: true,
                ..MatcherOptions::default()
            },
        )
        .unwrap();
        assert!(m.is_match(b"FOO"));
    }

    #[test]
    fn test_literal_mode_escapes() {
        let options = MatcherOptions {
            mode: MatchMode::Literal,
            ..MatcherOptions::default()
        };
        let m = RegexMatcher::new("a.b(", options).unwrap();
        assert!(m.is_match(b"xx a.b( yy"));
        assert!(!m.is_match(b"axb("));
        assert_eq!(m.pattern(), "a.b(");
    }

    #[test]
    fn test_empty_pattern() {
        let err = RegexMatcher::new("", MatcherOptions::default()).unwrap_err();
        assert!(matches!(err, Error::EmptyPattern));
    }

    #[test]
    fn test_invalid_pattern() {
        let err = RegexMatcher::new("foo(", MatcherOptions::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidPattern(_)));
    }
}
