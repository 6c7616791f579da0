// Persisted settings
//
// Compact on-disk form of the configuration. Each rule or filter is a single
// string with base64 encoded text fields:
//
//   match/replace   t=<kind>;m=<b64>;r=<b64>
//   enforcement     t=<kind>;inv=<0|1>;c=<b64>
//   filter          t=<kind>;c=<b64>
//
// Strings that fail to decode are dropped one by one; a bad entry never fails
// the whole load. The `enabled` switch is not persisted.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::profile::Profile;
use crate::rules::{
    CombineMode, EnforcementKind, EnforcementRule, FilterKind, InterceptionFilter, MatchReplaceKind, MatchReplaceRule,
};
use crate::state::{ConfigSnapshot, ReplayState, StateEvent};

pub const PERSISTENCE_VERSION: u32 = 1;

fn b64(text: &str) -> String {
    general_purpose::STANDARD.encode(text.as_bytes())
}

/// Invalid base64 or UTF-8 decodes to an empty string.
fn unb64(text: &str) -> String {
    general_purpose::STANDARD
        .decode(text)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_default()
}

/// Value after the first `=` of the first `;` separated part named `key`.
fn field<'a>(encoded: &'a str, key: &str) -> &'a str {
    encoded
        .split(';')
        .filter_map(|part| part.split_once('='))
        .find(|(k, _)| !k.is_empty() && *k == key)
        .map_or("", |(_, v)| v)
}

pub fn encode_match_rule(rule: &MatchReplaceRule) -> String {
    format!("t={};m={};r={}", rule.kind(), b64(rule.pattern()), b64(rule.replacement()))
}

pub fn decode_match_rule(encoded: &str) -> Option<MatchReplaceRule> {
    let kind: MatchReplaceKind = field(encoded, "t").parse().ok()?;
    Some(MatchReplaceRule::new(
        kind,
        unb64(field(encoded, "m")),
        unb64(field(encoded, "r")),
    ))
}

pub fn encode_enforcement_rule(rule: &EnforcementRule) -> String {
    format!(
        "t={};inv={};c={}",
        rule.kind(),
        if rule.inverse() { "1" } else { "0" },
        b64(rule.content())
    )
}

pub fn decode_enforcement_rule(encoded: &str) -> Option<EnforcementRule> {
    let kind: EnforcementKind = field(encoded, "t").parse().ok()?;
    Some(EnforcementRule::new(
        kind,
        field(encoded, "inv") == "1",
        unb64(field(encoded, "c")),
    ))
}

pub fn encode_filter(filter: &InterceptionFilter) -> String {
    format!("t={};c={}", filter.kind(), b64(filter.content()))
}

pub fn decode_filter(encoded: &str) -> Option<InterceptionFilter> {
    let kind: FilterKind = field(encoded, "t").parse().ok()?;
    Some(InterceptionFilter::new(kind, unb64(field(encoded, "c"))))
}

fn decode_all<T>(encoded: &[String], decode: fn(&str) -> Option<T>) -> Vec<T> {
    encoded
        .iter()
        .filter_map(|s| {
            let decoded = decode(s);
            if decoded.is_none() {
                warn!("Dropping undecodable persisted entry '{}'", s);
            }
            decoded
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedProfile {
    pub name: String,
    pub headers: String,
    pub mode: String,
    /// Encoded match/replace rules
    pub mr: Vec<String>,
    /// Encoded enforcement rules
    pub ed: Vec<String>,
}

/// Settings file contents. Absent values keep the current setting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedSettings {
    pub version: u32,
    pub intercept_repeater: Option<bool>,
    pub check_unauth: Option<bool>,
    #[serde(rename = "ignore304")]
    pub ignore_304: Option<bool>,
    #[serde(rename = "prevent304")]
    pub prevent_304: Option<bool>,
    pub replace_query: Option<bool>,
    pub replace_query_text: Option<String>,
    pub show_bypassed: Option<bool>,
    pub show_enforced: Option<bool>,
    pub show_unknown: Option<bool>,
    pub interception_filters: Vec<String>,
    pub unauth_mode: Option<String>,
    pub unauth_rules: Vec<String>,
    pub profiles: Vec<PersistedProfile>,
}

impl PersistedSettings {
    pub fn capture(snapshot: &ConfigSnapshot) -> Self {
        let s = &snapshot.settings;
        Self {
            version: PERSISTENCE_VERSION,
            intercept_repeater: Some(s.intercept_repeater),
            check_unauth: Some(s.check_unauthenticated),
            ignore_304: Some(s.ignore_304),
            prevent_304: Some(s.prevent_304),
            replace_query: Some(s.replace_query_param),
            replace_query_text: Some(s.replace_query_param_text.clone()),
            show_bypassed: Some(s.show_bypassed),
            show_enforced: Some(s.show_enforced),
            show_unknown: Some(s.show_unknown),
            interception_filters: snapshot.filters.iter().map(encode_filter).collect(),
            unauth_mode: Some(snapshot.unauth_mode.as_str().to_string()),
            unauth_rules: snapshot.unauth_rules.iter().map(encode_enforcement_rule).collect(),
            profiles: snapshot
                .profiles
                .iter()
                .map(|p| PersistedProfile {
                    name: p.name.clone(),
                    headers: p.headers_text.clone(),
                    mode: p.mode.as_str().to_string(),
                    mr: p.match_replace.iter().map(encode_match_rule).collect(),
                    ed: p.enforcement.iter().map(encode_enforcement_rule).collect(),
                })
                .collect(),
        }
    }

    /// Overlay these settings on `base`. Empty filter or profile lists keep
    /// what `base` has. The result is always disabled.
    pub fn apply_to(&self, base: &ConfigSnapshot) -> ConfigSnapshot {
        let mut next = base.clone();
        let s = &mut next.settings;
        s.enabled = false;
        if let Some(v) = self.intercept_repeater {
            s.intercept_repeater = v;
        }
        if let Some(v) = self.check_unauth {
            s.check_unauthenticated = v;
        }
        if let Some(v) = self.ignore_304 {
            s.ignore_304 = v;
        }
        if let Some(v) = self.prevent_304 {
            s.prevent_304 = v;
        }
        if let Some(v) = self.replace_query {
            s.replace_query_param = v;
        }
        if let Some(v) = &self.replace_query_text {
            s.replace_query_param_text = v.clone();
        }
        if let Some(v) = self.show_bypassed {
            s.show_bypassed = v;
        }
        if let Some(v) = self.show_enforced {
            s.show_enforced = v;
        }
        if let Some(v) = self.show_unknown {
            s.show_unknown = v;
        }

        let filters = decode_all(&self.interception_filters, decode_filter);
        if !filters.is_empty() {
            next.filters = filters;
        }

        if let Some(mode) = &self.unauth_mode {
            next.unauth_mode = CombineMode::parse_or_default(mode);
        }
        let unauth_rules = decode_all(&self.unauth_rules, decode_enforcement_rule);
        if !unauth_rules.is_empty() {
            next.unauth_rules = unauth_rules;
        }

        let profiles: Vec<Profile> = self
            .profiles
            .iter()
            .map(|pp| {
                let name = if pp.name.is_empty() { "User" } else { pp.name.as_str() };
                let mut profile = Profile::new(name).with_headers(pp.headers.as_str());
                profile.mode = CombineMode::parse_or_default(&pp.mode);
                profile.match_replace = decode_all(&pp.mr, decode_match_rule);
                profile.enforcement = decode_all(&pp.ed, decode_enforcement_rule);
                profile
            })
            .collect();
        if !profiles.is_empty() {
            next.profiles = profiles;
        }
        next
    }
}

/// Settings file on disk
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply the stored settings to `state`. A missing file leaves it as is.
    pub fn load(&self, state: &ReplayState) -> Result<bool> {
        if !self.path.exists() {
            debug!("No settings file at {}", self.path.display());
            return Ok(false);
        }
        let json = fs::read_to_string(&self.path)?;
        let persisted: PersistedSettings = serde_json::from_str(&json)?;
        state.replace(persisted.apply_to(&state.snapshot()));
        info!("Loaded settings from {}", self.path.display());
        Ok(true)
    }

    /// Write the current settings, replacing the file atomically.
    pub fn save(&self, state: &ReplayState) -> Result<()> {
        let json = serde_json::to_string_pretty(&PersistedSettings::capture(&state.snapshot()))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        debug!("Saved settings to {}", self.path.display());
        Ok(())
    }

    /// Save on every profile or configuration change until the state's
    /// event channel closes. Log changes are ignored.
    pub fn spawn_autosave(self, state: Arc<ReplayState>) -> JoinHandle<()> {
        let mut events = state.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(StateEvent::LogChanged) => continue,
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        if let Err(e) = self.save(&state) {
                            error!("Failed to save settings: {}", e);
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_survive_encoding() {
        let rule = MatchReplaceRule::new(MatchReplaceKind::BodyRegex, r#"user_id":\s*(\d+)"#, "user_id\": 2;=");
        assert_eq!(decode_match_rule(&encode_match_rule(&rule)), Some(rule));

        let rule = EnforcementRule::new(EnforcementKind::HeadersContains, true, "Location: /login");
        assert_eq!(decode_enforcement_rule(&encode_enforcement_rule(&rule)), Some(rule));

        let filter = InterceptionFilter::new(FilterKind::OnlyMethods, "GET,POST");
        assert_eq!(decode_filter(&encode_filter(&filter)), Some(filter));
    }

    #[test]
    fn invalid_regex_decodes_to_inert_rule() {
        let encoded = encode_match_rule(&MatchReplaceRule::new(MatchReplaceKind::PathRegex, "([", "x"));
        let decoded = decode_match_rule(&encoded).unwrap();
        assert_eq!(decoded.pattern(), "([");
        assert!(decoded.regex().is_none());
    }

    #[test]
    fn malformed_strings_decode_leniently() {
        assert_eq!(decode_filter("t=teleport;c="), None);
        assert_eq!(decode_filter("garbage"), None);
        let filter = decode_filter("t=url-contains;c=%%%").unwrap();
        assert_eq!(filter.content(), "");
    }

    #[test]
    fn empty_lists_keep_current_values() {
        let base = ConfigSnapshot::default();
        let next = PersistedSettings::default().apply_to(&base);
        assert_eq!(next.filters, base.filters);
        assert_eq!(next.profiles, base.profiles);
    }
}
