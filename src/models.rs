// Core HTTP message model for Surrogate
// Captured exchanges, replay requests and their responses all use these types.

use std::borrow::Cow;
use std::fmt;

use url::{Position, Url};

/// HTTP request methods
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    GET,
    POST,
    PUT,
    DELETE,
    PATCH,
    OPTIONS,
    HEAD,
    TRACE,
    CONNECT,
    /// Any token not covered above, kept verbatim
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::PATCH => "PATCH",
            Method::OPTIONS => "OPTIONS",
            Method::HEAD => "HEAD",
            Method::TRACE => "TRACE",
            Method::CONNECT => "CONNECT",
            Method::Other(token) => token,
        }
    }

    /// Case-insensitive comparison against a method token such as `get`.
    pub fn matches_token(&self, token: &str) -> bool {
        self.as_str().eq_ignore_ascii_case(token.trim())
    }
}

impl From<&str> for Method {
    fn from(token: &str) -> Self {
        match token.trim().to_ascii_uppercase().as_str() {
            "GET" => Method::GET,
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "DELETE" => Method::DELETE,
            "PATCH" => Method::PATCH,
            "OPTIONS" => Method::OPTIONS,
            "HEAD" => Method::HEAD,
            "TRACE" => Method::TRACE,
            "CONNECT" => Method::CONNECT,
            _ => Method::Other(token.trim().to_string()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single `Name: Value` header line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Parse a `Name: Value` line, splitting on the first colon.
    /// Returns `None` when there is no colon or the name is blank.
    pub fn parse_line(line: &str) -> Option<Header> {
        let (name, value) = line.split_once(':')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some(Header::new(name, value.trim()))
    }

    pub fn is_named(&self, name: &str) -> bool {
        self.name.trim().eq_ignore_ascii_case(name.trim())
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a Header> {
    headers.iter().find(|h| h.is_named(name))
}

/// Decode a message body for text matching. UTF-8 bodies are used as-is,
/// anything else is mapped byte-for-char so no byte is lost.
pub fn body_to_text(body: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(body) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => Cow::Owned(body.iter().map(|&b| b as char).collect()),
    }
}

/// Inverse of [`body_to_text`] for a body that was not valid UTF-8.
pub(crate) fn latin1_to_bytes(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for ch in text.chars() {
        if (ch as u32) <= 0xFF {
            out.push(ch as u32 as u8);
        } else {
            let mut buf = [0u8; 4];
            out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
        }
    }
    out
}

/// Target host of a request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HttpService {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl HttpService {
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            host: host.into(),
            port,
            secure,
        }
    }

    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    fn is_default_port(&self) -> bool {
        (self.secure && self.port == 443) || (!self.secure && self.port == 80)
    }
}

/// An HTTP request. `target` is the request-target: path plus query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub service: HttpService,
    pub method: Method,
    pub target: String,
    pub version: String,
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: Method, service: HttpService, target: impl Into<String>) -> Self {
        let target = target.into();
        Self {
            service,
            method,
            target: if target.is_empty() { "/".to_string() } else { target },
            version: "HTTP/1.1".to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Build a request from an absolute URL. The fragment is dropped.
    pub fn from_url(method: Method, url: &str) -> Result<Self, url::ParseError> {
        let parsed = Url::parse(url)?;
        let host = parsed.host_str().ok_or(url::ParseError::EmptyHost)?;
        let port = parsed
            .port_or_known_default()
            .ok_or(url::ParseError::InvalidPort)?;
        let service = HttpService::new(host, port, parsed.scheme() == "https");
        let target = &parsed[Position::BeforePath..Position::AfterQuery];
        Ok(Self::new(method, service, target))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_header(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn url(&self) -> String {
        if self.service.is_default_port() {
            format!("{}://{}{}", self.service.scheme(), self.service.host, self.target)
        } else {
            format!(
                "{}://{}:{}{}",
                self.service.scheme(),
                self.service.host,
                self.service.port,
                self.target
            )
        }
    }

    pub fn has_header(&self, name: &str) -> bool {
        find_header(&self.headers, name).is_some()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name).map(|h| h.value.as_str())
    }

    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|h| h.is_named(name))
            .map(|h| h.value.as_str())
            .collect()
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push(Header::new(name, value));
    }

    /// Remove every header with this name. Returns whether any was present.
    pub fn remove_header(&mut self, name: &str) -> bool {
        let before = self.headers.len();
        self.headers.retain(|h| !h.is_named(name));
        self.headers.len() != before
    }

    /// Replace all headers of this name with a single instance.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.remove_header(name);
        self.add_header(name, value);
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        body_to_text(&self.body)
    }

    /// Swap the body, keeping an existing Content-Length header accurate.
    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
        let len = self.body.len().to_string();
        for header in self.headers.iter_mut().filter(|h| h.is_named("Content-Length")) {
            header.value = len.clone();
        }
    }
}

/// An HTTP response as received from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        let reason = reqwest::StatusCode::from_u16(status)
            .ok()
            .and_then(|code| code.canonical_reason())
            .unwrap_or("")
            .to_string();
        Self {
            version: "HTTP/1.1".to_string(),
            status,
            reason,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name).map(|h| h.value.as_str())
    }

    /// Every header line followed by CRLF.
    pub fn header_block(&self) -> String {
        let mut block = String::new();
        for header in &self.headers {
            block.push_str(&header.to_string());
            block.push_str("\r\n");
        }
        block
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        body_to_text(&self.body)
    }

    fn status_line(&self) -> String {
        if self.reason.is_empty() {
            format!("{} {}", self.version, self.status)
        } else {
            format!("{} {} {}", self.version, self.status, self.reason)
        }
    }

    /// The full response on the wire: status line, headers, blank line, body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 256);
        out.extend_from_slice(self.status_line().as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(self.header_block().as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    pub fn rendered_text(&self) -> String {
        body_to_text(&self.to_bytes()).into_owned()
    }
}

/// Tool that produced a captured exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ToolKind {
    #[default]
    Proxy,
    Repeater,
    Target,
    Scanner,
    Intruder,
    Extension,
    Other,
}

impl ToolKind {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "proxy" => ToolKind::Proxy,
            "repeater" => ToolKind::Repeater,
            "target" => ToolKind::Target,
            "scanner" => ToolKind::Scanner,
            "intruder" => ToolKind::Intruder,
            "extension" | "extensions" => ToolKind::Extension,
            _ => ToolKind::Other,
        }
    }
}

/// A request/response pair observed by the capturing proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedExchange {
    pub request: HttpRequest,
    pub response: Option<HttpResponse>,
    pub tool: ToolKind,
    /// Port of the proxy listener the request arrived on, when known
    pub listener_port: Option<u16>,
}

impl CapturedExchange {
    pub fn new(request: HttpRequest, response: Option<HttpResponse>) -> Self {
        Self {
            request,
            response,
            tool: ToolKind::Proxy,
            listener_port: None,
        }
    }

    pub fn with_tool(mut self, tool: ToolKind) -> Self {
        self.tool = tool;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_url_splits_service_and_target() {
        let req = HttpRequest::from_url(Method::GET, "https://api.example.com/v1/users?id=7#top").unwrap();
        assert_eq!(req.service, HttpService::new("api.example.com", 443, true));
        assert_eq!(req.target, "/v1/users?id=7");
        assert_eq!(req.url(), "https://api.example.com/v1/users?id=7");
    }

    #[test]
    fn url_keeps_non_default_port() {
        let req = HttpRequest::from_url(Method::GET, "http://localhost:8080/").unwrap();
        assert_eq!(req.url(), "http://localhost:8080/");
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut req = HttpRequest::from_url(Method::GET, "http://a/")
            .unwrap()
            .with_header("Cookie", "a=1")
            .with_header("cookie", "b=2");
        assert!(req.has_header("COOKIE"));
        assert_eq!(req.header_values("Cookie"), vec!["a=1", "b=2"]);
        req.set_header("Cookie", "c=3");
        assert_eq!(req.header_values("cookie"), vec!["c=3"]);
    }

    #[test]
    fn parse_line_requires_a_name() {
        assert_eq!(Header::parse_line("X-A:  1 "), Some(Header::new("X-A", "1")));
        assert_eq!(Header::parse_line(": value"), None);
        assert_eq!(Header::parse_line("no colon"), None);
    }

    #[test]
    fn set_body_updates_content_length() {
        let mut req = HttpRequest::from_url(Method::POST, "http://a/")
            .unwrap()
            .with_header("Content-Length", "3")
            .with_body("abc");
        req.set_body(b"abcdef".to_vec());
        assert_eq!(req.header("content-length"), Some("6"));
    }

    #[test]
    fn rendered_response_contains_status_headers_and_body() {
        let res = HttpResponse::new(403)
            .with_header("Content-Type", "text/plain")
            .with_body("nope");
        assert_eq!(
            res.rendered_text(),
            "HTTP/1.1 403 Forbidden\r\nContent-Type: text/plain\r\n\r\nnope"
        );
    }

    #[test]
    fn non_utf8_body_round_trips_through_text() {
        let raw = vec![0x66, 0xff, 0x00, 0x80];
        let text = body_to_text(&raw).into_owned();
        assert_eq!(latin1_to_bytes(&text), raw);
    }

    #[test]
    fn method_tokens_compare_case_insensitively() {
        assert_eq!(Method::from("post"), Method::POST);
        assert!(Method::GET.matches_token(" get "));
        assert_eq!(Method::from("PROPFIND").to_string(), "PROPFIND");
    }
}
