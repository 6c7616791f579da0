// Enforcement rules: user-defined "access denied" detectors
// A rule set is evaluated against a replay response under AND or OR.

use std::fmt;
use std::str::FromStr;

use regex::Regex;

use super::{compile_pattern, regex_found, UnknownKind};
use crate::models::HttpResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnforcementKind {
    StatusEquals,
    HeadersContains,
    HeadersRegex,
    BodyContains,
    BodyRegex,
    FullContains,
    FullRegex,
    FullLengthEquals,
}

impl EnforcementKind {
    pub const ALL: [EnforcementKind; 8] = [
        EnforcementKind::StatusEquals,
        EnforcementKind::HeadersContains,
        EnforcementKind::HeadersRegex,
        EnforcementKind::BodyContains,
        EnforcementKind::BodyRegex,
        EnforcementKind::FullContains,
        EnforcementKind::FullRegex,
        EnforcementKind::FullLengthEquals,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnforcementKind::StatusEquals => "status-equals",
            EnforcementKind::HeadersContains => "headers-contains",
            EnforcementKind::HeadersRegex => "headers-regex",
            EnforcementKind::BodyContains => "body-contains",
            EnforcementKind::BodyRegex => "body-regex",
            EnforcementKind::FullContains => "full-contains",
            EnforcementKind::FullRegex => "full-regex",
            EnforcementKind::FullLengthEquals => "full-length-equals",
        }
    }

    pub fn is_regex(&self) -> bool {
        matches!(
            self,
            EnforcementKind::HeadersRegex | EnforcementKind::BodyRegex | EnforcementKind::FullRegex
        )
    }
}

impl fmt::Display for EnforcementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnforcementKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| UnknownKind(name.to_string()))
    }
}

/// How a rule set combines its rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CombineMode {
    And,
    #[default]
    Or,
}

impl CombineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CombineMode::And => "AND",
            CombineMode::Or => "OR",
        }
    }

    /// Lenient parse: anything other than `and` is OR.
    pub fn parse_or_default(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("and") {
            CombineMode::And
        } else {
            CombineMode::Or
        }
    }
}

impl fmt::Display for CombineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct EnforcementRule {
    kind: EnforcementKind,
    inverse: bool,
    content: String,
    regex: Option<Regex>,
}

impl EnforcementRule {
    pub fn new(kind: EnforcementKind, inverse: bool, content: impl Into<String>) -> Self {
        let content = content.into();
        let regex = if kind.is_regex() {
            compile_pattern(&content, true)
        } else {
            None
        };
        Self {
            kind,
            inverse,
            content,
            regex,
        }
    }

    pub fn kind(&self) -> EnforcementKind {
        self.kind
    }

    pub fn inverse(&self) -> bool {
        self.inverse
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn regex(&self) -> Option<&Regex> {
        self.regex.as_ref()
    }

    /// Predicate result for this rule, already XORed with the inverse flag.
    pub fn matches(&self, response: &HttpResponse) -> bool {
        self.matches_view(&mut ResponseView::new(response))
    }

    fn matches_view(&self, view: &mut ResponseView<'_>) -> bool {
        let c = self.content.as_str();
        let matched = match self.kind {
            EnforcementKind::StatusEquals => view.response.status.to_string() == c.trim(),
            EnforcementKind::HeadersContains => view.headers().contains(c),
            EnforcementKind::HeadersRegex => regex_found(self.regex(), view.headers()),
            EnforcementKind::BodyContains => view.body().contains(c),
            EnforcementKind::BodyRegex => regex_found(self.regex(), view.body()),
            EnforcementKind::FullContains => view.full().contains(c),
            EnforcementKind::FullRegex => regex_found(self.regex(), view.full()),
            EnforcementKind::FullLengthEquals => view.full_len().to_string() == c.trim(),
        };
        matched != self.inverse
    }
}

impl PartialEq for EnforcementRule {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.inverse == other.inverse && self.content == other.content
    }
}

impl fmt::Display for EnforcementRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let not = if self.inverse { "NOT " } else { "" };
        write!(f, "{}{} | {}", not, self.kind, self.content)
    }
}

/// Lazily rendered text views of one response, shared across a rule set.
struct ResponseView<'a> {
    response: &'a HttpResponse,
    headers: Option<String>,
    body: Option<String>,
    full: Option<Vec<u8>>,
    full_text: Option<String>,
}

impl<'a> ResponseView<'a> {
    fn new(response: &'a HttpResponse) -> Self {
        Self {
            response,
            headers: None,
            body: None,
            full: None,
            full_text: None,
        }
    }

    fn headers(&mut self) -> &str {
        let response = self.response;
        self.headers.get_or_insert_with(|| response.header_block())
    }

    fn body(&mut self) -> &str {
        let response = self.response;
        self.body
            .get_or_insert_with(|| response.body_text().into_owned())
    }

    fn full_bytes(&mut self) -> &[u8] {
        let response = self.response;
        self.full.get_or_insert_with(|| response.to_bytes())
    }

    fn full(&mut self) -> &str {
        if self.full_text.is_none() {
            let text = crate::models::body_to_text(self.full_bytes()).into_owned();
            self.full_text = Some(text);
        }
        self.full_text.as_deref().unwrap_or_default()
    }

    fn full_len(&mut self) -> usize {
        self.full_bytes().len()
    }
}

/// Evaluate a rule set against a response.
///
/// OR returns true on the first matching rule. AND short-circuits to false on
/// the first mismatch and is true only when every rule matched. An empty set
/// never signals enforcement, whatever the mode.
pub fn evaluate(rules: &[EnforcementRule], response: &HttpResponse, mode: CombineMode) -> bool {
    if rules.is_empty() {
        return false;
    }
    let mut view = ResponseView::new(response);
    match mode {
        CombineMode::Or => rules.iter().any(|rule| rule.matches_view(&mut view)),
        CombineMode::And => rules.iter().all(|rule| rule.matches_view(&mut view)),
    }
}
