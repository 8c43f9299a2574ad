//! The reply-code-action mini-language (§4.4.3, §4.4.4, §9 Open Questions).
//!
//! A `reply_code_actions` string such as `":?R=F,:?E=S,:?A=C,:*=S"` is a
//! comma-separated list of `pattern=action` pairs. Patterns are matched
//! against `MSA-1` left to right; the first match wins. `*` is catch-all.
//! `I?`/`T?`/`~` are IRIS-compatibility categories whose full semantics are
//! not defined in the source material (§9 Open Questions) -- this core
//! preserves them as opaque patterns and matches them the same way any
//! other two-character `X?` pattern matches: first character literal,
//! `?` a single-character wildcard. The leading `:` in the source notation
//! is a namespace marker carried through verbatim; it does not affect
//! matching.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Fail,
    Suspend,
    Complete,
    Warning,
    Disable,
}

impl Action {
    fn parse(s: &str) -> Option<Action> {
        match s {
            "F" => Some(Action::Fail),
            "S" => Some(Action::Suspend),
            "C" => Some(Action::Complete),
            "W" => Some(Action::Warning),
            "D" => Some(Action::Disable),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Action::Fail => "F",
            Action::Suspend => "S",
            Action::Complete => "C",
            Action::Warning => "W",
            Action::Disable => "D",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyCodeRule {
    /// The pattern with its leading `:` namespace marker stripped, e.g.
    /// `?A`, `*`, `I?`, `T?`, `~`.
    pattern: String,
    action: Action,
}

impl ReplyCodeRule {
    /// Does `code` (e.g. `"AA"`, `"AE"`) match this rule's pattern?
    fn matches(&self, code: &str) -> bool {
        if self.pattern == "*" {
            return true;
        }
        if self.pattern == "~" {
            // `~` denotes "no ACK received" in the IRIS source notation;
            // matched explicitly by the caller passing code == "~", never
            // by a real MSA-1 value.
            return code == "~";
        }
        let pat_chars: Vec<char> = self.pattern.chars().collect();
        let code_chars: Vec<char> = code.chars().collect();
        if pat_chars.len() != code_chars.len() {
            return false;
        }
        pat_chars
            .iter()
            .zip(code_chars.iter())
            .all(|(p, c)| *p == '?' || p == c)
    }
}

/// A parsed, matchable `reply_code_actions` configuration that still
/// round-trips to its original literal string (`Display`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classifier {
    rules: Vec<ReplyCodeRule>,
    source: String,
}

impl Classifier {
    pub fn parse(source: &str) -> Result<Self, String> {
        let mut rules = Vec::new();
        for pair in source.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (pattern, action) = pair
                .split_once('=')
                .ok_or_else(|| format!("missing '=' in reply_code_actions entry `{pair}`"))?;
            let pattern = pattern.strip_prefix(':').unwrap_or(pattern).to_string();
            let action = Action::parse(action)
                .ok_or_else(|| format!("unknown action `{action}` in `{pair}`"))?;
            rules.push(ReplyCodeRule { pattern, action });
        }
        Ok(Self {
            rules,
            source: source.to_string(),
        })
    }

    /// Classify an `MSA-1` code, first matching rule wins. `None` if no
    /// rule matches (caller should then default to `Fail`).
    pub fn classify(&self, code: &str) -> Option<Action> {
        self.rules.iter().find(|r| r.matches(code)).map(|r| r.action)
    }
}

impl fmt::Display for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_literal_source_string() {
        let c = Classifier::parse(":?R=F,:?E=S,:?A=C,:*=S").unwrap();
        assert_eq!(c.to_string(), ":?R=F,:?E=S,:?A=C,:*=S");
    }

    #[test]
    fn matches_wildcard_pattern_against_ack_code() {
        let c = Classifier::parse(":?A=C,:?E=F,:*=F").unwrap();
        assert_eq!(c.classify("AA"), Some(Action::Complete));
        assert_eq!(c.classify("AE"), Some(Action::Fail));
        assert_eq!(c.classify("XY"), Some(Action::Fail));
    }

    #[test]
    fn preserves_iris_categories_as_opaque_patterns() {
        let c = Classifier::parse(":?A=C,:*=S,:I?=W,:T?=C").unwrap();
        assert_eq!(c.classify("IA"), Some(Action::Warning));
        assert_eq!(c.classify("T1"), Some(Action::Complete));
    }

    #[test]
    fn s2_scenario_ae_classifies_as_fail() {
        let c = Classifier::parse(":?A=C,:?E=F,:*=F").unwrap();
        assert_eq!(c.classify("AE"), Some(Action::Fail));
    }

    #[test]
    fn rejects_malformed_action() {
        assert!(Classifier::parse(":?A=ZZZ").is_err());
    }
}
