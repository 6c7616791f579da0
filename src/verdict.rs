// Verdict engine for Surrogate
// Decides whether a replay was blocked, let through, or is ambiguous

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::HttpResponse;
use crate::rules::{evaluate, CombineMode, EnforcementRule};

lazy_static! {
    /// Built-in "access denied" body signal
    static ref ENFORCED_BODY: Regex =
        Regex::new(r"(?i)(forbidden|unauthorized|access denied)").expect("built-in pattern compiles");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    /// The server refused the replay
    Enforced,
    /// The replay got the same status as the original
    Bypassed,
    /// Neither a refusal nor an identical status
    Unknown,
    /// Only used for the unauthenticated slot when that check is off
    Disabled,
}

impl Verdict {
    pub const ALL: [Verdict; 4] = [Verdict::Enforced, Verdict::Bypassed, Verdict::Unknown, Verdict::Disabled];

    /// Label shown in the results table and reports.
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Enforced => "Enforced!",
            Verdict::Bypassed => "Bypassed!",
            Verdict::Unknown => "Is enforced???",
            Verdict::Disabled => "Disabled",
        }
    }

    /// Parse a label or a plain variant name, ignoring case.
    pub fn from_label(text: &str) -> Option<Verdict> {
        let text = text.trim();
        Self::ALL.into_iter().find(|v| {
            v.label().eq_ignore_ascii_case(text) || format!("{:?}", v).eq_ignore_ascii_case(text)
        })
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What the original response looked like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Baseline {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Baseline {
    pub fn from_response(response: &HttpResponse) -> Self {
        Self {
            status: response.status,
            body: response.body.clone(),
        }
    }
}

/// Classify one replay against the baseline. First match wins:
///
/// 1. 401 or 403 is `Enforced`
/// 2. a body mentioning forbidden/unauthorized/access denied is `Enforced`
/// 3. a non-empty custom rule set that evaluates true is `Enforced`
/// 4. the same status as the baseline is `Bypassed`
/// 5. anything else is `Unknown`
pub fn classify(
    baseline: &Baseline,
    replay: &HttpResponse,
    rules: &[EnforcementRule],
    mode: CombineMode,
) -> Verdict {
    if matches!(replay.status, 401 | 403) {
        return Verdict::Enforced;
    }
    if ENFORCED_BODY.is_match(&replay.body_text()) {
        return Verdict::Enforced;
    }
    if !rules.is_empty() && evaluate(rules, replay, mode) {
        return Verdict::Enforced;
    }
    if replay.status == baseline.status {
        return Verdict::Bypassed;
    }
    Verdict::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::EnforcementKind;

    fn baseline(status: u16) -> Baseline {
        Baseline::from_response(&HttpResponse::new(status).with_body("{\"id\":1}"))
    }

    #[test]
    fn denied_statuses_are_always_enforced() {
        let bypass_rule = EnforcementRule::new(EnforcementKind::StatusEquals, true, "401");
        for status in [401, 403] {
            let replay = HttpResponse::new(status).with_body("{\"id\":1}");
            assert_eq!(classify(&baseline(status), &replay, &[], CombineMode::Or), Verdict::Enforced);
            assert_eq!(
                classify(&baseline(200), &replay, &[bypass_rule.clone()], CombineMode::And),
                Verdict::Enforced
            );
        }
    }

    #[test]
    fn body_keywords_are_enforced() {
        let replay = HttpResponse::new(200).with_body("<h1>Access Denied</h1>");
        assert_eq!(classify(&baseline(200), &replay, &[], CombineMode::Or), Verdict::Enforced);
    }

    #[test]
    fn same_status_is_bypassed() {
        let replay = HttpResponse::new(200).with_body("{\"id\":1}");
        assert_eq!(classify(&baseline(200), &replay, &[], CombineMode::Or), Verdict::Bypassed);
    }

    #[test]
    fn different_status_is_unknown() {
        let replay = HttpResponse::new(302);
        assert_eq!(classify(&baseline(200), &replay, &[], CombineMode::Or), Verdict::Unknown);
    }

    #[test]
    fn empty_and_rule_set_does_not_force_enforced() {
        let replay = HttpResponse::new(200);
        assert_eq!(classify(&baseline(200), &replay, &[], CombineMode::And), Verdict::Bypassed);
    }

    #[test]
    fn custom_rules_override_the_status_comparison() {
        let rules = vec![EnforcementRule::new(EnforcementKind::HeadersContains, false, "Location: /login")];
        let replay = HttpResponse::new(200).with_header("Location", "/login");
        assert_eq!(classify(&baseline(200), &replay, &rules, CombineMode::Or), Verdict::Enforced);
    }

    #[test]
    fn labels_parse_back() {
        for verdict in Verdict::ALL {
            assert_eq!(Verdict::from_label(verdict.label()), Some(verdict));
        }
        assert_eq!(Verdict::from_label("bypassed"), Some(Verdict::Bypassed));
        assert_eq!(Verdict::from_label("nope"), None);
    }
}
