// Async HTTP engine for Surrogate
// The transport that executes replays, and the scope oracle gating traffic

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;
use url::Url;
use wildmatch::WildMatch;

use crate::models::{Header, HttpRequest, HttpResponse};

/// Marks a request as one of our own replays. Never replayed again.
pub const REPLAY_MARKER_HEADER: &str = "X-Autorize-Replay";
/// Carries the name of the profile a replay was sent as.
pub const PROFILE_HEADER: &str = "X-Autorize-User";

/// Headers the HTTP client computes itself.
const CLIENT_MANAGED_HEADERS: [&str; 4] = ["Host", "Content-Length", "Transfer-Encoding", "Connection"];

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request cannot be sent: {0}")]
    InvalidRequest(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Executes one HTTP request and returns the server's response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    /// Accept invalid TLS certificates (intercepting setups)
    pub accept_invalid_certs: bool,
    /// Overall request timeout; none when unset
    pub timeout: Option<Duration>,
}

/// `Transport` backed by a pooled reqwest client. Redirects are not followed
/// so the verdict sees the server's first answer.
pub struct ReqwestTransport {
    pub client: Client,
}

impl ReqwestTransport {
    pub fn new(options: &TransportOptions) -> Result<Self, TransportError> {
        let mut builder = Client::builder()
            .pool_max_idle_per_host(10)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(options.accept_invalid_certs);
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        let url = request.url();
        let mut builder = self.client.request(method, &url);
        for header in &request.headers {
            if CLIENT_MANAGED_HEADERS.iter().any(|name| header.is_named(name)) {
                continue;
            }
            builder = builder.header(header.name.as_str(), header.value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        debug!("Sending {} {}", request.method, url);
        let response = builder.send().await?;

        let status = response.status();
        let version = format!("{:?}", response.version());
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| Header::new(name.as_str(), String::from_utf8_lossy(value.as_bytes())))
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(HttpResponse {
            version,
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body,
        })
    }
}

/// Answers whether a URL is inside the user's testing scope.
pub trait ScopeOracle: Send + Sync {
    fn in_scope(&self, url: &str) -> bool;
}

impl<F> ScopeOracle for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn in_scope(&self, url: &str) -> bool {
        self(url)
    }
}

/// Host-based scope from wildcard allow and block lists
#[derive(Debug, Clone, Default)]
pub struct ScopeMatcher {
    allow_list: Vec<String>,
    block_list: Vec<String>,
}

impl ScopeMatcher {
    pub fn new(allow_list: Vec<String>, block_list: Vec<String>) -> Self {
        Self {
            allow_list,
            block_list,
        }
    }

    /// Block list wins; an empty allow list allows every host.
    pub fn is_allowed(&self, host: &str) -> bool {
        if self.block_list.iter().any(|p| WildMatch::new(p).matches(host)) {
            return false;
        }
        self.allow_list.is_empty() || self.allow_list.iter().any(|p| WildMatch::new(p).matches(host))
    }
}

impl ScopeOracle for ScopeMatcher {
    fn in_scope(&self, url: &str) -> bool {
        match Url::parse(url) {
            Ok(parsed) => parsed.host_str().map_or(false, |host| self.is_allowed(host)),
            Err(e) => {
                debug!("Unparseable URL '{}' treated as out of scope: {}", url, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_matching() {
        let matcher = ScopeMatcher::new(vec![], vec![]);
        assert!(matcher.in_scope("https://anything.test/x"));

        let matcher = ScopeMatcher::new(vec!["*.example.com".to_string()], vec!["ads.example.com".to_string()]);
        assert!(matcher.in_scope("https://api.example.com:8443/v1"));
        assert!(!matcher.in_scope("https://ads.example.com/"));
        assert!(!matcher.in_scope("https://example.org/"));
        assert!(!matcher.in_scope("not a url"));
    }

    #[test]
    fn closures_are_oracles() {
        let oracle = |url: &str| url.contains("/api/");
        let dyn_oracle: &dyn ScopeOracle = &oracle;
        assert!(dyn_oracle.in_scope("https://a/api/x"));
        assert!(!dyn_oracle.in_scope("https://a/static"));
    }

    #[test]
    fn client_builds_with_options() {
        let options = TransportOptions {
            accept_invalid_certs: true,
            timeout: Some(Duration::from_secs(5)),
        };
        assert!(ReqwestTransport::new(&options).is_ok());
    }
}
