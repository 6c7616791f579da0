// Replay orchestrator
//
// Every accepted exchange becomes one task on a bounded worker pool. A task
// replays the request without credentials (when enabled), records the entry,
// then replays it once per profile in parallel and merges each result into the
// entry as it arrives. Must be driven from inside a Tokio runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::engine::{ScopeOracle, Transport, PROFILE_HEADER, REPLAY_MARKER_HEADER};
use crate::error::{Error, Result};
use crate::filter::{drops_listener_port, eligible, is_not_modified, tool_accepted, tool_ignored};
use crate::log::{LogEntry, ReplayResult, ResultLog};
use crate::models::{CapturedExchange, HttpRequest, ToolKind};
use crate::rules::{CombineMode, EnforcementRule};
use crate::state::{ConfigSnapshot, ReplayState};
use crate::transform::{strip_identity, transform};
use crate::verdict::{classify, Baseline};

/// Parallel replay tasks when not configured otherwise.
pub const DEFAULT_WORKERS: usize = 10;

struct Inner {
    state: Arc<ReplayState>,
    log: Arc<ResultLog>,
    transport: Arc<dyn Transport>,
    scope: Arc<dyn ScopeOracle>,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
    accepting: AtomicBool,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        state: Arc<ReplayState>,
        log: Arc<ResultLog>,
        transport: Arc<dyn Transport>,
        scope: Arc<dyn ScopeOracle>,
    ) -> Self {
        Self::with_workers(state, log, transport, scope, DEFAULT_WORKERS)
    }

    pub fn with_workers(
        state: Arc<ReplayState>,
        log: Arc<ResultLog>,
        transport: Arc<dyn Transport>,
        scope: Arc<dyn ScopeOracle>,
        workers: usize,
    ) -> Self {
        // Closed up front so waiting returns as soon as the tracker drains.
        let tasks = TaskTracker::new();
        tasks.close();
        Self {
            inner: Arc::new(Inner {
                state,
                log,
                transport,
                scope,
                permits: Arc::new(Semaphore::new(workers.max(1))),
                tasks,
                accepting: AtomicBool::new(true),
            }),
        }
    }

    pub fn state(&self) -> &Arc<ReplayState> {
        &self.inner.state
    }

    pub fn log(&self) -> &Arc<ResultLog> {
        &self.inner.log
    }

    /// Live traffic entry point. Runs the full gating pipeline and returns
    /// the sequence number when the exchange was dispatched.
    pub fn observe(&self, exchange: CapturedExchange) -> Option<u64> {
        let snapshot = self.inner.state.snapshot();
        let settings = &snapshot.settings;
        let request = &exchange.request;

        if !settings.enabled {
            return None;
        }
        if request.has_header(REPLAY_MARKER_HEADER) {
            trace!("Skipping own replay {}", request.url());
            return None;
        }
        if drops_listener_port(&snapshot.filters, exchange.listener_port) {
            debug!("Dropping {} from listener port {:?}", request.url(), exchange.listener_port);
            return None;
        }
        if !self.inner.scope.in_scope(&request.url()) {
            trace!("Out of scope: {}", request.url());
            return None;
        }
        if !tool_accepted(exchange.tool, settings.intercept_repeater) || tool_ignored(&snapshot.filters, exchange.tool) {
            trace!("Ignoring {:?} traffic: {}", exchange.tool, request.url());
            return None;
        }
        if settings.ignore_304 && exchange.response.as_ref().map_or(false, |r| is_not_modified(r.status)) {
            trace!("Ignoring 304/204 response for {}", request.url());
            return None;
        }
        if !eligible(Some(request), exchange.response.as_ref(), &snapshot.filters, &*self.inner.scope) {
            debug!("Filtered out: {} {}", request.method, request.url());
            return None;
        }

        match self.dispatch(exchange, snapshot) {
            Ok(sequence) => Some(sequence),
            Err(e) => {
                warn!("Exchange not dispatched: {}", e);
                None
            }
        }
    }

    /// Strip conditional caching headers from original traffic so the
    /// baseline is a full response. Returns whether the request changed.
    pub fn prepare_outgoing(&self, request: &mut HttpRequest, tool: ToolKind) -> bool {
        let snapshot = self.inner.state.snapshot();
        let settings = &snapshot.settings;
        if !settings.enabled || !settings.prevent_304 || request.has_header(REPLAY_MARKER_HEADER) {
            return false;
        }
        if !tool_accepted(tool, settings.intercept_repeater) || tool_ignored(&snapshot.filters, tool) {
            return false;
        }
        let etag = request.remove_header("If-None-Match");
        let modified = request.remove_header("If-Modified-Since");
        etag || modified
    }

    /// Submit an exchange picked by the user. Filters still apply. When the
    /// exchange has no response one is fetched first.
    pub async fn submit_external(&self, exchange: CapturedExchange) -> Result<Option<u64>> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShutDown);
        }
        let snapshot = self.inner.state.snapshot();
        if !self.inner.scope.in_scope(&exchange.request.url()) {
            debug!("External submission out of scope: {}", exchange.request.url());
            return Ok(None);
        }

        let exchange = match exchange.response {
            Some(_) => exchange,
            None => {
                let mut request = exchange.request.clone();
                request.set_header(REPLAY_MARKER_HEADER, "1");
                let response = self.inner.transport.send(&request).await?;
                CapturedExchange {
                    response: Some(response),
                    ..exchange
                }
            }
        };

        if snapshot.settings.ignore_304 && exchange.response.as_ref().map_or(false, |r| is_not_modified(r.status)) {
            return Ok(None);
        }
        if !eligible(
            Some(&exchange.request),
            exchange.response.as_ref(),
            &snapshot.filters,
            &*self.inner.scope,
        ) {
            debug!("External submission filtered out: {}", exchange.request.url());
            return Ok(None);
        }
        self.dispatch(exchange, snapshot).map(Some)
    }

    /// Replay already logged entries again. Filters are not consulted.
    /// Unknown sequence numbers are skipped.
    pub fn retest(&self, sequences: &[u64]) -> Result<Vec<u64>> {
        let mut dispatched = Vec::new();
        for &sequence in sequences {
            let Some(entry) = self.inner.log.get(sequence) else {
                debug!("Retest of unknown entry {}", sequence);
                continue;
            };
            dispatched.push(self.process(entry.original.clone())?);
        }
        Ok(dispatched)
    }

    pub fn retest_all(&self) -> Result<Vec<u64>> {
        let sequences: Vec<u64> = self.inner.log.snapshot().iter().map(|e| e.sequence).collect();
        self.retest(&sequences)
    }

    /// Queue an exchange for replay, bypassing every filter. Returns its
    /// sequence number; the entry appears in the log once the unauthenticated
    /// replay has finished.
    pub fn process(&self, exchange: CapturedExchange) -> Result<u64> {
        let snapshot = self.inner.state.snapshot();
        self.dispatch(exchange, snapshot)
    }

    fn dispatch(&self, exchange: CapturedExchange, snapshot: Arc<ConfigSnapshot>) -> Result<u64> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShutDown);
        }
        if exchange.response.is_none() {
            return Err(Error::MissingResponse);
        }
        let sequence = self.inner.state.next_sequence();
        let inner = Arc::clone(&self.inner);
        self.inner.tasks.spawn(async move {
            let Ok(_permit) = Arc::clone(&inner.permits).acquire_owned().await else {
                return;
            };
            replay_exchange(&inner, sequence, exchange, snapshot).await;
        });
        Ok(sequence)
    }

    /// Wait until every queued and running task has finished. Dropping the
    /// returned future leaves the tasks running.
    pub async fn wait_idle(&self) {
        self.inner.tasks.wait().await;
    }

    /// Tasks queued or running right now.
    pub fn pending(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Stop accepting work and let queued and running tasks finish.
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.wait_idle().await;
        info!("Replay pool stopped");
    }
}

async fn replay_exchange(inner: &Inner, sequence: u64, original: CapturedExchange, snapshot: Arc<ConfigSnapshot>) {
    let Some(response) = original.response.as_ref() else {
        return;
    };
    let baseline = Baseline::from_response(response);

    let unauthenticated = if snapshot.settings.check_unauthenticated {
        let mut request = strip_identity(&original.request);
        request.set_header(REPLAY_MARKER_HEADER, "1");
        let transport = Arc::clone(&inner.transport);
        Some(replay(transport, request, &baseline, &snapshot.unauth_rules, snapshot.unauth_mode).await)
    } else {
        None
    };

    let expected = snapshot.profiles.iter().map(|p| p.id()).collect();
    let entry = inner
        .log
        .insert(LogEntry::new(sequence, original, unauthenticated, expected));
    debug!("#{} {} {} unauthenticated: {}", sequence, entry.method, entry.url, entry.unauth_label());

    let query_override = snapshot.query_override();
    let mut replays = Vec::with_capacity(snapshot.profiles.len());
    for profile in &snapshot.profiles {
        let mut request = transform(&entry.original.request, profile, query_override);
        request.set_header(REPLAY_MARKER_HEADER, "1");
        request.set_header(PROFILE_HEADER, profile.name.clone());

        let transport = Arc::clone(&inner.transport);
        let log = Arc::clone(&inner.log);
        let baseline = baseline.clone();
        let rules = profile.enforcement.clone();
        let (id, mode) = (profile.id(), profile.mode);
        replays.push(tokio::spawn(async move {
            let result = replay(transport, request, &baseline, &rules, mode).await;
            trace!("#{} profile {}: {}", sequence, id, result.label());
            log.record(sequence, id, result);
        }));
    }

    for handle in replays {
        if let Err(e) = handle.await {
            warn!("#{} profile replay task failed: {}", sequence, e);
        }
    }
}

async fn replay(
    transport: Arc<dyn Transport>,
    request: HttpRequest,
    baseline: &Baseline,
    rules: &[EnforcementRule],
    mode: CombineMode,
) -> ReplayResult {
    match transport.send(&request).await {
        Ok(response) => {
            let verdict = classify(baseline, &response, rules, mode);
            ReplayResult::completed(request, response, verdict)
        }
        Err(e) => {
            warn!("Replay of {} {} failed: {}", request.method, request.url(), e);
            ReplayResult::failed(request, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TransportError;
    use crate::models::{HttpResponse, Method};
    use crate::profile::Profile;
    use crate::verdict::Verdict;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Answers 200 to requests with the admin cookie, 401 otherwise.
    struct CookieGate;

    #[async_trait]
    impl Transport for CookieGate {
        async fn send(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
            if request.header("Cookie") == Some("role=admin") {
                Ok(HttpResponse::new(200).with_body("secret"))
            } else {
                Ok(HttpResponse::new(401))
            }
        }
    }

    fn orchestrator() -> Orchestrator {
        let state = Arc::new(ReplayState::new());
        state.set_enabled(true);
        let scope: Arc<dyn ScopeOracle> = Arc::new(|_: &str| true);
        Orchestrator::new(state, Arc::new(ResultLog::new()), Arc::new(CookieGate), scope)
    }

    fn exchange(url: &str) -> CapturedExchange {
        let request = HttpRequest::from_url(Method::GET, url).unwrap().with_header("Cookie", "role=user");
        CapturedExchange::new(request, Some(HttpResponse::new(200)))
    }

    #[tokio::test]
    async fn observe_replays_and_classifies() {
        let orch = orchestrator();
        let id = orch.state().snapshot().profiles[0].id();
        orch.state().update_profile_headers(id, "Cookie: role=admin").unwrap();

        let seq = orch.observe(exchange("https://app.test/api/me")).unwrap();
        orch.wait_idle().await;

        let entry = orch.log().get(seq).unwrap();
        assert_eq!(entry.unauth_verdict(), Verdict::Enforced);
        assert_eq!(entry.profile_verdict(id), Some(Verdict::Bypassed));
        assert!(entry.is_complete());
        let sent = entry.profile_result(id).unwrap().request;
        assert_eq!(sent.header(REPLAY_MARKER_HEADER), Some("1"));
        assert_eq!(sent.header(PROFILE_HEADER), Some("User 1"));
    }

    #[tokio::test]
    async fn observe_skips_own_replays_and_disabled_engine() {
        let orch = orchestrator();
        let mut own = exchange("https://app.test/api/me");
        own.request.add_header(REPLAY_MARKER_HEADER, "1");
        assert_eq!(orch.observe(own), None);

        orch.state().set_enabled(false);
        assert_eq!(orch.observe(exchange("https://app.test/api/me")), None);
    }

    #[tokio::test]
    async fn static_assets_are_filtered_by_default() {
        let orch = orchestrator();
        assert_eq!(orch.observe(exchange("https://app.test/app.js")), None);
    }

    #[tokio::test]
    async fn process_requires_a_response() {
        let orch = orchestrator();
        let request = HttpRequest::from_url(Method::GET, "https://app.test/").unwrap();
        let result = orch.process(CapturedExchange::new(request, None));
        assert!(matches!(result, Err(Error::MissingResponse)));
    }

    #[tokio::test]
    async fn unauthenticated_check_can_be_disabled() {
        let orch = orchestrator();
        orch.state().update_settings(|s| s.check_unauthenticated = false);
        let seq = orch.process(exchange("https://app.test/x")).unwrap();
        orch.wait_idle().await;
        let entry = orch.log().get(seq).unwrap();
        assert!(entry.unauthenticated.is_none());
        assert_eq!(entry.unauth_verdict(), Verdict::Disabled);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work() {
        let orch = orchestrator();
        orch.shutdown().await;
        assert!(matches!(orch.process(exchange("https://app.test/x")), Err(Error::ShutDown)));
    }

    #[tokio::test]
    async fn prevent_304_strips_conditional_headers() {
        let orch = orchestrator();
        orch.state().update_settings(|s| s.prevent_304 = true);
        let mut request = HttpRequest::from_url(Method::GET, "https://app.test/")
            .unwrap()
            .with_header("If-None-Match", "\"abc\"")
            .with_header("If-Modified-Since", "yesterday");
        assert!(orch.prepare_outgoing(&mut request, ToolKind::Proxy));
        assert!(request.headers.is_empty());

        let mut repeater = request.clone().with_header("If-None-Match", "\"abc\"");
        assert!(!orch.prepare_outgoing(&mut repeater, ToolKind::Repeater));
    }

    /// Answers 200 after a delay.
    struct Slow(Duration);

    #[async_trait]
    impl Transport for Slow {
        async fn send(&self, _request: &HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
            tokio::time::sleep(self.0).await;
            Ok(HttpResponse::new(200))
        }
    }

    fn slow_orchestrator(delay: Duration) -> Orchestrator {
        let state = Arc::new(ReplayState::new());
        state.set_enabled(true);
        let scope: Arc<dyn ScopeOracle> = Arc::new(|_: &str| true);
        Orchestrator::new(state, Arc::new(ResultLog::new()), Arc::new(Slow(delay)), scope)
    }

    #[tokio::test]
    async fn abandoned_wait_does_not_cancel_replays() {
        let orch = slow_orchestrator(Duration::from_millis(200));
        let seq = orch.process(exchange("https://app.test/x")).unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(50), orch.wait_idle()).await;
        assert!(waited.is_err());

        tokio::time::sleep(Duration::from_millis(600)).await;
        let entry = orch.log().get(seq).expect("entry should be recorded");
        assert!(entry.is_complete());

        orch.wait_idle().await;
        assert_eq!(orch.pending(), 0);
    }

    #[tokio::test]
    async fn finished_tasks_are_released_without_waiting() {
        let orch = orchestrator();
        for i in 0..100 {
            assert!(orch.observe(exchange(&format!("https://app.test/api/{}", i))).is_some());
        }
        for _ in 0..100 {
            if orch.pending() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(orch.pending(), 0);
        assert_eq!(orch.log().len(), 100);
    }

    #[tokio::test]
    async fn concurrent_waiters_all_return() {
        let orch = slow_orchestrator(Duration::from_millis(30));
        orch.process(exchange("https://app.test/x")).unwrap();
        let (a, b) = (orch.clone(), orch.clone());
        let both = async move { tokio::join!(a.wait_idle(), b.wait_idle()) };
        assert!(tokio::time::timeout(Duration::from_secs(5), both).await.is_ok());
        assert_eq!(orch.log().len(), 1);
    }

    #[tokio::test]
    async fn profiles_added_later_do_not_join_in_flight_work() {
        let orch = orchestrator();
        let seq = orch.process(exchange("https://app.test/x")).unwrap();
        orch.state().add_profile(Profile::new("Late"));
        orch.wait_idle().await;
        assert_eq!(orch.log().get(seq).unwrap().expected.len(), 1);
    }
}
