// Match/replace rules applied to a request before it is replayed

use std::fmt;
use std::str::FromStr;

use regex::Regex;

use super::{compile_pattern, UnknownKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchReplaceKind {
    PathLiteral,
    PathRegex,
    /// Match is a header name, replacement its new value
    HeaderReplace,
    /// Match is a cookie name, replacement its new value
    CookieReplace,
    /// Replacement becomes the value of the stepper login header
    StepperHeader,
    HeadersLiteral,
    HeadersRegex,
    BodyLiteral,
    BodyRegex,
}

/// Transformer stage a rule belongs to, in the order the stages run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Path,
    Header,
    Cookie,
    HeaderLines,
    Body,
    Stepper,
}

impl MatchReplaceKind {
    pub const ALL: [MatchReplaceKind; 9] = [
        MatchReplaceKind::PathLiteral,
        MatchReplaceKind::PathRegex,
        MatchReplaceKind::HeaderReplace,
        MatchReplaceKind::CookieReplace,
        MatchReplaceKind::StepperHeader,
        MatchReplaceKind::HeadersLiteral,
        MatchReplaceKind::HeadersRegex,
        MatchReplaceKind::BodyLiteral,
        MatchReplaceKind::BodyRegex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchReplaceKind::PathLiteral => "path-literal",
            MatchReplaceKind::PathRegex => "path-regex",
            MatchReplaceKind::HeaderReplace => "header-replace",
            MatchReplaceKind::CookieReplace => "cookie-replace",
            MatchReplaceKind::StepperHeader => "stepper-header",
            MatchReplaceKind::HeadersLiteral => "headers-literal",
            MatchReplaceKind::HeadersRegex => "headers-regex",
            MatchReplaceKind::BodyLiteral => "body-literal",
            MatchReplaceKind::BodyRegex => "body-regex",
        }
    }

    pub fn is_regex(&self) -> bool {
        matches!(
            self,
            MatchReplaceKind::PathRegex | MatchReplaceKind::HeadersRegex | MatchReplaceKind::BodyRegex
        )
    }

    pub fn stage(&self) -> Stage {
        match self {
            MatchReplaceKind::PathLiteral | MatchReplaceKind::PathRegex => Stage::Path,
            MatchReplaceKind::HeaderReplace => Stage::Header,
            MatchReplaceKind::CookieReplace => Stage::Cookie,
            MatchReplaceKind::HeadersLiteral | MatchReplaceKind::HeadersRegex => Stage::HeaderLines,
            MatchReplaceKind::BodyLiteral | MatchReplaceKind::BodyRegex => Stage::Body,
            MatchReplaceKind::StepperHeader => Stage::Stepper,
        }
    }
}

impl fmt::Display for MatchReplaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchReplaceKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| UnknownKind(name.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct MatchReplaceRule {
    kind: MatchReplaceKind,
    pattern: String,
    replacement: String,
    regex: Option<Regex>,
}

impl MatchReplaceRule {
    pub fn new(kind: MatchReplaceKind, pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let regex = if kind.is_regex() {
            compile_pattern(&pattern, false)
        } else {
            None
        };
        Self {
            kind,
            pattern,
            replacement: replacement.into(),
            regex,
        }
    }

    pub fn kind(&self) -> MatchReplaceKind {
        self.kind
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn replacement(&self) -> &str {
        &self.replacement
    }

    pub fn regex(&self) -> Option<&Regex> {
        self.regex.as_ref()
    }

    /// Rewrite `text` with this rule. Regex kinds substitute every match
    /// (`$1` style references expand); literal kinds replace every
    /// occurrence. Rules that cannot match return the text unchanged.
    pub fn apply_to(&self, text: &str) -> String {
        if self.kind.is_regex() {
            match &self.regex {
                Some(re) => re.replace_all(text, self.replacement.as_str()).into_owned(),
                None => text.to_string(),
            }
        } else if self.pattern.is_empty() {
            text.to_string()
        } else {
            text.replace(&self.pattern, &self.replacement)
        }
    }
}

impl PartialEq for MatchReplaceRule {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.pattern == other.pattern && self.replacement == other.replacement
    }
}

impl fmt::Display for MatchReplaceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} | {} -> {}", self.kind, self.pattern, self.replacement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_parse_back() {
        for kind in MatchReplaceKind::ALL {
            assert_eq!(kind.as_str().parse::<MatchReplaceKind>(), Ok(kind));
        }
        assert!("PATH-LITERAL".parse::<MatchReplaceKind>().is_ok());
        assert!("nonsense".parse::<MatchReplaceKind>().is_err());
    }

    #[test]
    fn invalid_regex_is_inert() {
        let rule = MatchReplaceRule::new(MatchReplaceKind::PathRegex, "([", "x");
        assert!(rule.regex().is_none());
        assert_eq!(rule.apply_to("/api/users"), "/api/users");
    }

    #[test]
    fn regex_replacement_expands_groups() {
        let rule = MatchReplaceRule::new(MatchReplaceKind::PathRegex, r"/users/(\d+)", "/users/${1}0");
        assert_eq!(rule.apply_to("/users/4/profile"), "/users/40/profile");
    }

    #[test]
    fn literal_pattern_is_case_sensitive() {
        let rule = MatchReplaceRule::new(MatchReplaceKind::BodyLiteral, "Admin", "guest");
        assert_eq!(rule.apply_to("admin Admin"), "admin guest");
    }

    #[test]
    fn empty_literal_pattern_is_inert() {
        let rule = MatchReplaceRule::new(MatchReplaceKind::PathLiteral, "", "x");
        assert_eq!(rule.apply_to("/a"), "/a");
    }
}
