// JSON configuration import/export
// A versioned document holding settings, filters, the unauthenticated
// detector and every profile. The runtime `enabled` switch is never exported
// and an import always leaves the engine disabled.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::profile::Profile;
use crate::rules::{
    CombineMode, EnforcementKind, EnforcementRule, FilterKind, InterceptionFilter, MatchReplaceKind, MatchReplaceRule,
};
use crate::state::{ConfigSnapshot, ReplayState, Settings, DEFAULT_QUERY_OVERRIDE};

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigDocument {
    pub version: u32,
    pub intercept_repeater: bool,
    pub check_unauthenticated: bool,
    #[serde(rename = "ignore304")]
    pub ignore_304: bool,
    #[serde(rename = "prevent304")]
    pub prevent_304: bool,
    pub replace_query_param: bool,
    pub replace_query_param_text: Option<String>,
    pub show_bypassed: bool,
    pub show_enforced: bool,
    pub show_unknown: bool,
    pub interception_filters: Vec<FilterConfig>,
    pub unauth_detector: UnauthDetectorConfig,
    pub profiles: Vec<ProfileConfig>,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            version: CONFIG_VERSION,
            intercept_repeater: settings.intercept_repeater,
            check_unauthenticated: settings.check_unauthenticated,
            ignore_304: settings.ignore_304,
            prevent_304: settings.prevent_304,
            replace_query_param: settings.replace_query_param,
            replace_query_param_text: Some(settings.replace_query_param_text),
            show_bypassed: settings.show_bypassed,
            show_enforced: settings.show_enforced,
            show_unknown: settings.show_unknown,
            interception_filters: Vec::new(),
            unauth_detector: UnauthDetectorConfig::default(),
            profiles: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub inverse: bool,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchReplaceConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "match")]
    pub pattern: String,
    #[serde(rename = "replace")]
    pub replacement: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnauthDetectorConfig {
    pub mode: String,
    pub rules: Vec<RuleConfig>,
}

impl Default for UnauthDetectorConfig {
    fn default() -> Self {
        Self {
            mode: CombineMode::Or.as_str().to_string(),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProfileConfig {
    pub name: String,
    pub headers_text: String,
    pub enforcement_mode: String,
    pub match_replace: Vec<MatchReplaceConfig>,
    pub enforcement_rules: Vec<RuleConfig>,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            headers_text: String::new(),
            enforcement_mode: CombineMode::Or.as_str().to_string(),
            match_replace: Vec::new(),
            enforcement_rules: Vec::new(),
        }
    }
}

fn rule_config(rule: &EnforcementRule) -> RuleConfig {
    RuleConfig {
        kind: rule.kind().as_str().to_string(),
        inverse: rule.inverse(),
        content: rule.content().to_string(),
    }
}

fn enforcement_rules(configs: &[RuleConfig]) -> Vec<EnforcementRule> {
    configs
        .iter()
        .filter_map(|rc| match rc.kind.parse::<EnforcementKind>() {
            Ok(kind) => Some(EnforcementRule::new(kind, rc.inverse, rc.content.as_str())),
            Err(e) => {
                warn!("Skipping enforcement rule: {}", e);
                None
            }
        })
        .collect()
}

impl ConfigDocument {
    pub fn from_snapshot(snapshot: &ConfigSnapshot) -> Self {
        let s = &snapshot.settings;
        Self {
            version: CONFIG_VERSION,
            intercept_repeater: s.intercept_repeater,
            check_unauthenticated: s.check_unauthenticated,
            ignore_304: s.ignore_304,
            prevent_304: s.prevent_304,
            replace_query_param: s.replace_query_param,
            replace_query_param_text: Some(s.replace_query_param_text.clone()),
            show_bypassed: s.show_bypassed,
            show_enforced: s.show_enforced,
            show_unknown: s.show_unknown,
            interception_filters: snapshot
                .filters
                .iter()
                .map(|f| FilterConfig {
                    kind: f.kind().as_str().to_string(),
                    content: f.content().to_string(),
                })
                .collect(),
            unauth_detector: UnauthDetectorConfig {
                mode: snapshot.unauth_mode.as_str().to_string(),
                rules: snapshot.unauth_rules.iter().map(rule_config).collect(),
            },
            profiles: snapshot
                .profiles
                .iter()
                .map(|p| ProfileConfig {
                    name: p.name.clone(),
                    headers_text: p.headers_text.clone(),
                    enforcement_mode: p.mode.as_str().to_string(),
                    match_replace: p
                        .match_replace
                        .iter()
                        .map(|r| MatchReplaceConfig {
                            kind: r.kind().as_str().to_string(),
                            pattern: r.pattern().to_string(),
                            replacement: r.replacement().to_string(),
                        })
                        .collect(),
                    enforcement_rules: p.enforcement.iter().map(rule_config).collect(),
                })
                .collect(),
        }
    }

    /// Build a snapshot from this document. Unknown kinds are skipped; only
    /// an unsupported version fails.
    pub fn into_snapshot(self) -> Result<ConfigSnapshot> {
        if self.version != CONFIG_VERSION {
            return Err(Error::UnsupportedVersion(self.version));
        }

        let settings = Settings {
            enabled: false,
            intercept_repeater: self.intercept_repeater,
            check_unauthenticated: self.check_unauthenticated,
            ignore_304: self.ignore_304,
            prevent_304: self.prevent_304,
            replace_query_param: self.replace_query_param,
            replace_query_param_text: self
                .replace_query_param_text
                .unwrap_or_else(|| DEFAULT_QUERY_OVERRIDE.to_string()),
            show_bypassed: self.show_bypassed,
            show_enforced: self.show_enforced,
            show_unknown: self.show_unknown,
        };

        let filters = self
            .interception_filters
            .iter()
            .filter_map(|fc| match fc.kind.parse::<FilterKind>() {
                Ok(kind) => Some(InterceptionFilter::new(kind, fc.content.as_str())),
                Err(e) => {
                    warn!("Skipping interception filter: {}", e);
                    None
                }
            })
            .collect();

        let profiles = self
            .profiles
            .iter()
            .map(|pc| {
                let mut profile = Profile::new(pc.name.as_str()).with_headers(pc.headers_text.as_str());
                profile.mode = CombineMode::parse_or_default(&pc.enforcement_mode);
                profile.match_replace = pc
                    .match_replace
                    .iter()
                    .filter_map(|mc| match mc.kind.parse::<MatchReplaceKind>() {
                        Ok(kind) => Some(MatchReplaceRule::new(kind, mc.pattern.as_str(), mc.replacement.as_str())),
                        Err(e) => {
                            warn!("Skipping match/replace rule: {}", e);
                            None
                        }
                    })
                    .collect();
                profile.enforcement = enforcement_rules(&pc.enforcement_rules);
                profile
            })
            .collect();

        let mut snapshot = ConfigSnapshot {
            settings,
            profiles,
            filters,
            unauth_rules: enforcement_rules(&self.unauth_detector.rules),
            unauth_mode: CombineMode::parse_or_default(&self.unauth_detector.mode),
        };
        snapshot.ensure_profile();
        Ok(snapshot)
    }
}

pub fn export_json(state: &ReplayState) -> Result<String> {
    Ok(serde_json::to_string_pretty(&ConfigDocument::from_snapshot(&state.snapshot()))?)
}

/// Replace the live configuration with `json`. Nothing changes on error.
pub fn import_json(state: &ReplayState, json: &str) -> Result<()> {
    let document: ConfigDocument = serde_json::from_str(json)?;
    let snapshot = document.into_snapshot()?;
    info!(
        "Imported configuration: {} profiles, {} filters",
        snapshot.profiles.len(),
        snapshot.filters.len()
    );
    state.replace(snapshot);
    Ok(())
}

pub fn load_file(state: &ReplayState, path: &Path) -> Result<()> {
    let json = fs::read_to_string(path)?;
    import_json(state, &json)
}

pub fn save_file(state: &ReplayState, path: &Path) -> Result<()> {
    fs::write(path, export_json(state)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kinds_are_skipped_and_modes_default() {
        let json = r#"{
            "version": 1,
            "interceptionFilters": [
                {"type": "url-contains", "content": "/api"},
                {"type": "teleport", "content": "x"}
            ],
            "profiles": [{
                "name": "Viewer",
                "enforcementMode": "bogus",
                "matchReplace": [{"type": "cookie-replace", "match": "sid", "replace": "v"}],
                "enforcementRules": [{"type": "status-equals", "content": "302"}, {"type": "nope"}]
            }]
        }"#;
        let snapshot = serde_json::from_str::<ConfigDocument>(json)
            .unwrap()
            .into_snapshot()
            .unwrap();
        assert_eq!(snapshot.filters.len(), 1);
        let profile = &snapshot.profiles[0];
        assert_eq!(profile.name, "Viewer");
        assert_eq!(profile.mode, CombineMode::Or);
        assert_eq!(profile.match_replace.len(), 1);
        assert_eq!(profile.enforcement.len(), 1);
        assert_eq!(snapshot.settings.replace_query_param_text, "paramName=paramValue");
    }

    #[test]
    fn empty_profile_list_gets_default_profile() {
        let snapshot = ConfigDocument::default().into_snapshot().unwrap();
        assert_eq!(snapshot.profiles.len(), 1);
        assert_eq!(snapshot.profiles[0].name, "User 1");
    }

    #[test]
    fn enabled_is_not_part_of_the_document() {
        let state = ReplayState::new();
        state.set_enabled(true);
        let json = export_json(&state).unwrap();
        assert!(!json.contains("enabled"));
        import_json(&state, &json).unwrap();
        assert!(!state.is_enabled());
    }
}
