// Result log
// One entry per processed exchange, keyed by sequence number. Profile results
// land in each entry concurrently and in no particular order.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::models::{CapturedExchange, HttpRequest, HttpResponse, Method};
use crate::profile::ProfileId;
use crate::state::StateEvent;
use crate::verdict::Verdict;

#[derive(Debug, Clone, PartialEq)]
pub enum ReplayOutcome {
    Completed { response: HttpResponse, verdict: Verdict },
    /// The transport failed; no response to classify
    Failed { error: String },
}

/// One replay: what was sent and what came back.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayResult {
    pub request: HttpRequest,
    pub outcome: ReplayOutcome,
}

impl ReplayResult {
    pub fn completed(request: HttpRequest, response: HttpResponse, verdict: Verdict) -> Self {
        Self {
            request,
            outcome: ReplayOutcome::Completed { response, verdict },
        }
    }

    pub fn failed(request: HttpRequest, error: impl Into<String>) -> Self {
        Self {
            request,
            outcome: ReplayOutcome::Failed { error: error.into() },
        }
    }

    pub fn verdict(&self) -> Option<Verdict> {
        match &self.outcome {
            ReplayOutcome::Completed { verdict, .. } => Some(*verdict),
            ReplayOutcome::Failed { .. } => None,
        }
    }

    pub fn response(&self) -> Option<&HttpResponse> {
        match &self.outcome {
            ReplayOutcome::Completed { response, .. } => Some(response),
            ReplayOutcome::Failed { .. } => None,
        }
    }

    /// Verdict label, or "Error" when the replay never got a response.
    pub fn label(&self) -> &'static str {
        self.verdict().map_or("Error", |v| v.label())
    }
}

#[derive(Debug)]
pub struct LogEntry {
    pub sequence: u64,
    pub method: Method,
    pub url: String,
    pub original: CapturedExchange,
    /// `None` when the unauthenticated check was off for this exchange
    pub unauthenticated: Option<ReplayResult>,
    /// Profiles in the snapshot this entry was processed with
    pub expected: Vec<ProfileId>,
    profiles: DashMap<ProfileId, ReplayResult>,
}

impl LogEntry {
    pub fn new(
        sequence: u64,
        original: CapturedExchange,
        unauthenticated: Option<ReplayResult>,
        expected: Vec<ProfileId>,
    ) -> Self {
        Self {
            sequence,
            method: original.request.method.clone(),
            url: original.request.url(),
            original,
            unauthenticated,
            expected,
            profiles: DashMap::new(),
        }
    }

    pub fn unauth_verdict(&self) -> Verdict {
        match &self.unauthenticated {
            Some(result) => result.verdict().unwrap_or(Verdict::Unknown),
            None => Verdict::Disabled,
        }
    }

    pub fn unauth_label(&self) -> &'static str {
        self.unauthenticated
            .as_ref()
            .map_or(Verdict::Disabled.label(), |r| r.label())
    }

    pub fn put_profile_result(&self, profile: ProfileId, result: ReplayResult) {
        self.profiles.insert(profile, result);
    }

    pub fn profile_result(&self, profile: ProfileId) -> Option<ReplayResult> {
        self.profiles.get(&profile).map(|r| r.value().clone())
    }

    pub fn profile_verdict(&self, profile: ProfileId) -> Option<Verdict> {
        self.profiles.get(&profile).and_then(|r| r.verdict())
    }

    /// Verdicts of every profile that got a response, in no particular order.
    pub fn profile_verdicts(&self) -> Vec<Verdict> {
        self.profiles.iter().filter_map(|r| r.value().verdict()).collect()
    }

    pub fn result_count(&self) -> usize {
        self.profiles.len()
    }

    /// Every profile of the processing snapshot has reported.
    pub fn is_complete(&self) -> bool {
        self.expected.iter().all(|id| self.profiles.contains_key(id))
    }

    pub fn original_status(&self) -> Option<u16> {
        self.original.response.as_ref().map(|r| r.status)
    }

    pub fn original_len(&self) -> usize {
        self.original.response.as_ref().map_or(0, |r| r.body.len())
    }
}

/// Concurrent log of processed exchanges
#[derive(Debug, Default)]
pub struct ResultLog {
    entries: DashMap<u64, Arc<LogEntry>>,
    events: Option<broadcast::Sender<StateEvent>>,
}

impl ResultLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A log that publishes `LogChanged` on every change.
    pub fn with_notifier(events: broadcast::Sender<StateEvent>) -> Self {
        Self {
            entries: DashMap::new(),
            events: Some(events),
        }
    }

    fn changed(&self) {
        if let Some(events) = &self.events {
            let _ = events.send(StateEvent::LogChanged);
        }
    }

    pub fn insert(&self, entry: LogEntry) -> Arc<LogEntry> {
        let entry = Arc::new(entry);
        self.entries.insert(entry.sequence, Arc::clone(&entry));
        self.changed();
        entry
    }

    pub fn get(&self, sequence: u64) -> Option<Arc<LogEntry>> {
        self.entries.get(&sequence).map(|e| Arc::clone(e.value()))
    }

    /// Merge one profile result into an existing entry.
    pub fn record(&self, sequence: u64, profile: ProfileId, result: ReplayResult) -> bool {
        let Some(entry) = self.get(sequence) else {
            return false;
        };
        entry.put_profile_result(profile, result);
        self.changed();
        true
    }

    /// Entries ordered by sequence number, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<LogEntry>> {
        let mut entries: Vec<_> = self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        entries.sort_by_key(|e| e.sequence);
        entries
    }

    pub fn newest_first(&self) -> Vec<Arc<LogEntry>> {
        let mut entries = self.snapshot();
        entries.reverse();
        entries
    }

    /// Remove entries by sequence number; returns how many existed.
    pub fn remove(&self, sequences: &[u64]) -> usize {
        let removed = sequences
            .iter()
            .filter(|seq| self.entries.remove(*seq).is_some())
            .count();
        if removed > 0 {
            self.changed();
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.changed();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sequence: u64, expected: Vec<ProfileId>) -> LogEntry {
        let request = HttpRequest::from_url(Method::GET, "https://app.test/a").unwrap();
        let original = CapturedExchange::new(request, Some(HttpResponse::new(200)));
        LogEntry::new(sequence, original, None, expected)
    }

    #[test]
    fn snapshot_orders_by_sequence_not_insertion() {
        let log = ResultLog::new();
        for seq in [3, 1, 2] {
            log.insert(entry(seq, vec![]));
        }
        let order: Vec<_> = log.snapshot().iter().map(|e| e.sequence).collect();
        assert_eq!(order, vec![1, 2, 3]);
        let order: Vec<_> = log.newest_first().iter().map(|e| e.sequence).collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn entry_completes_when_every_profile_reported() {
        let (a, b) = (ProfileId::new(), ProfileId::new());
        let log = ResultLog::new();
        log.insert(entry(1, vec![a, b]));
        let request = HttpRequest::from_url(Method::GET, "https://app.test/a").unwrap();

        assert!(log.record(1, a, ReplayResult::failed(request.clone(), "connection reset")));
        assert!(!log.get(1).unwrap().is_complete());
        assert!(log.record(1, b, ReplayResult::completed(request, HttpResponse::new(403), Verdict::Enforced)));

        let entry = log.get(1).unwrap();
        assert!(entry.is_complete());
        assert_eq!(entry.profile_result(a).unwrap().label(), "Error");
        assert_eq!(entry.profile_verdict(b), Some(Verdict::Enforced));
        assert_eq!(entry.unauth_verdict(), Verdict::Disabled);
    }

    #[test]
    fn remove_and_clear_notify() {
        let (tx, mut rx) = broadcast::channel(8);
        let log = ResultLog::with_notifier(tx);
        log.insert(entry(1, vec![]));
        log.insert(entry(2, vec![]));
        assert_eq!(log.remove(&[2, 9]), 1);
        log.clear();
        assert!(log.is_empty());
        let mut seen = 0;
        while rx.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 4);
    }

    #[test]
    fn recording_into_missing_entry_is_refused() {
        let log = ResultLog::new();
        let request = HttpRequest::from_url(Method::GET, "https://app.test/a").unwrap();
        assert!(!log.record(7, ProfileId::new(), ReplayResult::failed(request, "x")));
    }
}
