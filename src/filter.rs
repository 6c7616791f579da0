// Interception filter engine
// Decides whether a captured exchange is eligible for replay. Every filter is
// an independent gate; the first failing gate drops the exchange.

use std::borrow::Cow;

use tracing::trace;

use crate::engine::ScopeOracle;
use crate::models::{Header, HttpRequest, HttpResponse, Method, ToolKind};
use crate::rules::{regex_found, FilterKind, InterceptionFilter};

/// Text views of the exchange, rendered on first use.
struct Subjects<'a> {
    request: &'a HttpRequest,
    response: &'a HttpResponse,
    url: Option<String>,
    request_body: Option<Cow<'a, str>>,
    response_body: Option<Cow<'a, str>>,
}

impl<'a> Subjects<'a> {
    fn new(request: &'a HttpRequest, response: &'a HttpResponse) -> Self {
        Self {
            request,
            response,
            url: None,
            request_body: None,
            response_body: None,
        }
    }

    fn url(&mut self) -> &str {
        let request = self.request;
        self.url.get_or_insert_with(|| request.url())
    }

    fn request_body(&mut self) -> &str {
        let request = self.request;
        self.request_body.get_or_insert_with(|| request.body_text())
    }

    fn response_body(&mut self) -> &str {
        let response = self.response;
        self.response_body.get_or_insert_with(|| response.body_text())
    }
}

fn any_header_contains(headers: &[Header], needle: &str) -> bool {
    headers.iter().any(|h| h.to_string().contains(needle))
}

/// Split a method list on commas and line breaks.
fn method_tokens(content: &str) -> impl Iterator<Item = &str> {
    content
        .split(|c| c == ',' || c == '\r' || c == '\n')
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn method_listed(method: &Method, content: &str) -> bool {
    method_tokens(content).any(|token| method.matches_token(token))
}

fn passes(filter: &InterceptionFilter, subjects: &mut Subjects<'_>, scope: &dyn ScopeOracle) -> bool {
    let c = filter.content();
    let re = filter.regex();
    match filter.kind() {
        FilterKind::ScopeOnly => {
            let url = subjects.url();
            scope.in_scope(url)
        }
        FilterKind::UrlContains => subjects.url().contains(c),
        FilterKind::UrlNotContains => !subjects.url().contains(c),
        FilterKind::UrlRegex => regex_found(re, subjects.url()),
        FilterKind::UrlNotRegex => !regex_found(re, subjects.url()),
        FilterKind::RequestBodyContains => subjects.request_body().contains(c),
        FilterKind::RequestBodyNotContains => !subjects.request_body().contains(c),
        FilterKind::RequestBodyRegex => regex_found(re, subjects.request_body()),
        FilterKind::RequestBodyNotRegex => !regex_found(re, subjects.request_body()),
        FilterKind::ResponseBodyContains => subjects.response_body().contains(c),
        FilterKind::ResponseBodyNotContains => !subjects.response_body().contains(c),
        FilterKind::ResponseBodyRegex => regex_found(re, subjects.response_body()),
        FilterKind::ResponseBodyNotRegex => !regex_found(re, subjects.response_body()),
        FilterKind::RequestHeaderContains => any_header_contains(&subjects.request.headers, c),
        FilterKind::RequestHeaderNotContains => !any_header_contains(&subjects.request.headers, c),
        FilterKind::ResponseHeaderContains => any_header_contains(&subjects.response.headers, c),
        FilterKind::ResponseHeaderNotContains => !any_header_contains(&subjects.response.headers, c),
        FilterKind::OnlyMethods => method_listed(&subjects.request.method, c),
        FilterKind::IgnoreMethods => !method_listed(&subjects.request.method, c),
        FilterKind::IgnoreOptions => subjects.request.method != Method::OPTIONS,
        // Applied before this point by the caller and the capture layer.
        FilterKind::IgnoreProxyTool | FilterKind::IgnoreTargetTool | FilterKind::DropProxyPorts => true,
    }
}

/// Whether an exchange passes every interception filter.
///
/// A missing request or response drops the exchange. Negative regex filters
/// whose pattern failed to compile pass; positive ones fail.
pub fn eligible(
    request: Option<&HttpRequest>,
    response: Option<&HttpResponse>,
    filters: &[InterceptionFilter],
    scope: &dyn ScopeOracle,
) -> bool {
    let (Some(request), Some(response)) = (request, response) else {
        return false;
    };
    let mut subjects = Subjects::new(request, response);
    for filter in filters {
        if !passes(filter, &mut subjects, scope) {
            trace!("Exchange {} {} dropped by filter {}", request.method, request.url(), filter);
            return false;
        }
    }
    true
}

/// Whether an `ignore-proxy-tool` / `ignore-target-tool` filter rejects traffic from `tool`.
pub fn tool_ignored(filters: &[InterceptionFilter], tool: ToolKind) -> bool {
    filters.iter().any(|f| match f.kind() {
        FilterKind::IgnoreProxyTool => tool == ToolKind::Proxy,
        FilterKind::IgnoreTargetTool => tool == ToolKind::Target,
        _ => false,
    })
}

/// Only proxy traffic is replayed, plus repeater traffic when enabled.
pub fn tool_accepted(tool: ToolKind, intercept_repeater: bool) -> bool {
    match tool {
        ToolKind::Proxy => true,
        ToolKind::Repeater => intercept_repeater,
        _ => false,
    }
}

/// Parse a comma separated port list, skipping anything that is not a port.
pub fn parse_ports(content: &str) -> Vec<u16> {
    content
        .split(',')
        .filter_map(|p| p.trim().parse::<u16>().ok())
        .collect()
}

/// Whether the proxy listener port appears in a `drop-proxy-ports` filter.
pub fn drops_listener_port(filters: &[InterceptionFilter], port: Option<u16>) -> bool {
    let Some(port) = port.filter(|p| *p > 0) else {
        return false;
    };
    filters
        .iter()
        .filter(|f| f.kind() == FilterKind::DropProxyPorts)
        .any(|f| parse_ports(f.content()).contains(&port))
}

/// Parse the port out of a listener interface such as `127.0.0.1:8080`.
pub fn parse_listener_port(listener: &str) -> Option<u16> {
    let (_, port) = listener.rsplit_once(':')?;
    port.trim().parse().ok()
}

/// 304 Not Modified and 204 No Content carry nothing worth comparing.
pub fn is_not_modified(status: u16) -> bool {
    status == 304 || status == 204
}
