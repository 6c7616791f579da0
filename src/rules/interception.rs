// Interception filters: predicates deciding whether a captured exchange is replayed

use std::fmt;
use std::str::FromStr;

use regex::Regex;

use super::{compile_pattern, UnknownKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKind {
    ScopeOnly,
    UrlContains,
    UrlNotContains,
    UrlRegex,
    UrlNotRegex,
    RequestBodyContains,
    RequestBodyNotContains,
    RequestBodyRegex,
    RequestBodyNotRegex,
    ResponseBodyContains,
    ResponseBodyNotContains,
    ResponseBodyRegex,
    ResponseBodyNotRegex,
    RequestHeaderContains,
    RequestHeaderNotContains,
    ResponseHeaderContains,
    ResponseHeaderNotContains,
    OnlyMethods,
    IgnoreMethods,
    IgnoreOptions,
    IgnoreProxyTool,
    IgnoreTargetTool,
    DropProxyPorts,
}

impl FilterKind {
    pub const ALL: [FilterKind; 23] = [
        FilterKind::ScopeOnly,
        FilterKind::UrlContains,
        FilterKind::UrlNotContains,
        FilterKind::UrlRegex,
        FilterKind::UrlNotRegex,
        FilterKind::RequestBodyContains,
        FilterKind::RequestBodyNotContains,
        FilterKind::RequestBodyRegex,
        FilterKind::RequestBodyNotRegex,
        FilterKind::ResponseBodyContains,
        FilterKind::ResponseBodyNotContains,
        FilterKind::ResponseBodyRegex,
        FilterKind::ResponseBodyNotRegex,
        FilterKind::RequestHeaderContains,
        FilterKind::RequestHeaderNotContains,
        FilterKind::ResponseHeaderContains,
        FilterKind::ResponseHeaderNotContains,
        FilterKind::OnlyMethods,
        FilterKind::IgnoreMethods,
        FilterKind::IgnoreOptions,
        FilterKind::IgnoreProxyTool,
        FilterKind::IgnoreTargetTool,
        FilterKind::DropProxyPorts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterKind::ScopeOnly => "scope-only",
            FilterKind::UrlContains => "url-contains",
            FilterKind::UrlNotContains => "url-not-contains",
            FilterKind::UrlRegex => "url-regex",
            FilterKind::UrlNotRegex => "url-not-regex",
            FilterKind::RequestBodyContains => "request-body-contains",
            FilterKind::RequestBodyNotContains => "request-body-not-contains",
            FilterKind::RequestBodyRegex => "request-body-regex",
            FilterKind::RequestBodyNotRegex => "request-body-not-regex",
            FilterKind::ResponseBodyContains => "response-body-contains",
            FilterKind::ResponseBodyNotContains => "response-body-not-contains",
            FilterKind::ResponseBodyRegex => "response-body-regex",
            FilterKind::ResponseBodyNotRegex => "response-body-not-regex",
            FilterKind::RequestHeaderContains => "request-header-contains",
            FilterKind::RequestHeaderNotContains => "request-header-not-contains",
            FilterKind::ResponseHeaderContains => "response-header-contains",
            FilterKind::ResponseHeaderNotContains => "response-header-not-contains",
            FilterKind::OnlyMethods => "only-methods",
            FilterKind::IgnoreMethods => "ignore-methods",
            FilterKind::IgnoreOptions => "ignore-options",
            FilterKind::IgnoreProxyTool => "ignore-proxy-tool",
            FilterKind::IgnoreTargetTool => "ignore-target-tool",
            FilterKind::DropProxyPorts => "drop-proxy-ports",
        }
    }

    pub fn is_regex(&self) -> bool {
        matches!(
            self,
            FilterKind::UrlRegex
                | FilterKind::UrlNotRegex
                | FilterKind::RequestBodyRegex
                | FilterKind::RequestBodyNotRegex
                | FilterKind::ResponseBodyRegex
                | FilterKind::ResponseBodyNotRegex
        )
    }

    /// One-line help text for listings.
    pub fn description(&self) -> &'static str {
        match self {
            FilterKind::ScopeOnly => "Scope is always enforced; this row is an extra guard",
            FilterKind::UrlContains => "Pass when the request URL contains the substring",
            FilterKind::UrlNotContains => "Pass when the request URL does not contain the substring",
            FilterKind::UrlRegex => "Pass when the request URL matches the regex",
            FilterKind::UrlNotRegex => "Pass when the request URL does not match the regex",
            FilterKind::RequestBodyContains => "Pass when the request body contains the substring",
            FilterKind::RequestBodyNotContains => "Pass when the request body does not contain the substring",
            FilterKind::RequestBodyRegex => "Pass when the request body matches the regex",
            FilterKind::RequestBodyNotRegex => "Pass when the request body does not match the regex",
            FilterKind::ResponseBodyContains => "Pass when the response body contains the substring",
            FilterKind::ResponseBodyNotContains => "Pass when the response body does not contain the substring",
            FilterKind::ResponseBodyRegex => "Pass when the response body matches the regex",
            FilterKind::ResponseBodyNotRegex => "Pass when the response body does not match the regex",
            FilterKind::RequestHeaderContains => "Pass when any request header line contains the substring",
            FilterKind::RequestHeaderNotContains => "Pass when no request header line contains the substring",
            FilterKind::ResponseHeaderContains => "Pass when any response header line contains the substring",
            FilterKind::ResponseHeaderNotContains => "Pass when no response header line contains the substring",
            FilterKind::OnlyMethods => "Pass when the method is in the comma or newline separated list",
            FilterKind::IgnoreMethods => "Pass when the method is not in the comma or newline separated list",
            FilterKind::IgnoreOptions => "Drop OPTIONS requests",
            FilterKind::IgnoreProxyTool => "Ignore traffic coming from the proxy tool",
            FilterKind::IgnoreTargetTool => "Ignore traffic coming from the target tool",
            FilterKind::DropProxyPorts => "Drop requests arriving on these proxy listener ports (comma separated)",
        }
    }
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterKind {
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
pub struct InterceptionFilter {
    kind: FilterKind,
    content: String,
    regex: Option<Regex>,
}

impl InterceptionFilter {
    pub fn new(kind: FilterKind, content: impl Into<String>) -> Self {
        let content = content.into();
        let regex = if kind.is_regex() {
            compile_pattern(&content, true)
        } else {
            None
        };
        Self { kind, content, regex }
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn regex(&self) -> Option<&Regex> {
        self.regex.as_ref()
    }
}

impl PartialEq for InterceptionFilter {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.content == other.content
    }
}

impl fmt::Display for InterceptionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} | {}", self.kind, self.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_regex_kinds_compile_a_pattern() {
        assert!(InterceptionFilter::new(FilterKind::UrlRegex, "/api/").regex().is_some());
        assert!(InterceptionFilter::new(FilterKind::UrlContains, "(").regex().is_none());
    }

    #[test]
    fn regex_filters_ignore_case() {
        let filter = InterceptionFilter::new(FilterKind::UrlRegex, "/ADMIN");
        assert!(filter.regex().map_or(false, |re| re.is_match("https://a/admin/x")));
    }

    #[test]
    fn every_kind_has_a_unique_name() {
        let mut names: Vec<_> = FilterKind::ALL.iter().map(|k| k.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), FilterKind::ALL.len());
        for kind in FilterKind::ALL {
            assert_eq!(kind.as_str().parse::<FilterKind>(), Ok(kind));
        }
    }
}
