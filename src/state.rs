// Configuration and profile store
//
// Live configuration is an immutable `ConfigSnapshot` behind an `Arc`. Edits
// clone the current snapshot, change the copy and swap it in, so a replay
// holding an older snapshot is never affected by concurrent edits. A failed
// edit leaves the live snapshot untouched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{Error, Result};
use crate::profile::{Profile, ProfileId};
use crate::rules::{CombineMode, EnforcementRule, FilterKind, InterceptionFilter, MatchReplaceRule};

/// Name given to the profile created on a fresh or emptied state.
pub const DEFAULT_PROFILE_NAME: &str = "User 1";

/// Static asset URLs skipped by the default filter set.
pub const STATIC_ASSETS_PATTERN: &str =
    r"(\.js|\.css|\.png|\.jpg|\.svg|\.jpeg|\.gif|\.woff|\.map|\.bmp|\.ico)([^a-z\s]\S*)?$";

/// Query override text used until the user sets one.
pub const DEFAULT_QUERY_OVERRIDE: &str = "paramName=paramValue";

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub enabled: bool,
    pub intercept_repeater: bool,
    pub check_unauthenticated: bool,
    pub ignore_304: bool,
    pub prevent_304: bool,
    pub replace_query_param: bool,
    pub replace_query_param_text: String,
    pub show_bypassed: bool,
    pub show_enforced: bool,
    pub show_unknown: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: false,
            intercept_repeater: false,
            check_unauthenticated: true,
            ignore_304: true,
            prevent_304: false,
            replace_query_param: false,
            replace_query_param_text: DEFAULT_QUERY_OVERRIDE.to_string(),
            show_bypassed: true,
            show_enforced: true,
            show_unknown: true,
        }
    }
}

/// Everything a replay needs, frozen at the moment it was taken.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    pub settings: Settings,
    pub profiles: Vec<Profile>,
    pub filters: Vec<InterceptionFilter>,
    pub unauth_rules: Vec<EnforcementRule>,
    pub unauth_mode: CombineMode,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            profiles: vec![Profile::new(DEFAULT_PROFILE_NAME)],
            filters: default_filters(),
            unauth_rules: Vec::new(),
            unauth_mode: CombineMode::Or,
        }
    }
}

pub fn default_filters() -> Vec<InterceptionFilter> {
    vec![
        InterceptionFilter::new(FilterKind::ScopeOnly, ""),
        InterceptionFilter::new(FilterKind::UrlNotRegex, STATIC_ASSETS_PATTERN),
        InterceptionFilter::new(FilterKind::IgnoreOptions, ""),
    ]
}

impl ConfigSnapshot {
    /// The query override text, when the override is switched on.
    pub fn query_override(&self) -> Option<&str> {
        self.settings
            .replace_query_param
            .then_some(self.settings.replace_query_param_text.as_str())
    }

    pub fn profile(&self, id: ProfileId) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.id() == id)
    }

    pub fn profile_names(&self) -> Vec<(ProfileId, String)> {
        self.profiles.iter().map(|p| (p.id(), p.name.clone())).collect()
    }

    fn profile_mut(&mut self, id: ProfileId) -> Result<&mut Profile> {
        self.profiles
            .iter_mut()
            .find(|p| p.id() == id)
            .ok_or(Error::ProfileNotFound(id))
    }

    /// Keep the profile list non-empty.
    pub(crate) fn ensure_profile(&mut self) {
        if self.profiles.is_empty() {
            self.profiles.push(Profile::new(DEFAULT_PROFILE_NAME));
        }
    }
}

/// Change notifications published by the store and the result log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    ProfilesChanged,
    ConfigChanged,
    LogChanged,
}

fn check_index<T>(list: &'static str, items: &[T], index: usize) -> Result<()> {
    if index < items.len() {
        Ok(())
    } else {
        Err(Error::out_of_range(list, index, items.len()))
    }
}

pub struct ReplayState {
    config: RwLock<Arc<ConfigSnapshot>>,
    sequence: AtomicU64,
    events: broadcast::Sender<StateEvent>,
}

impl Default for ReplayState {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayState {
    pub fn new() -> Self {
        Self::with_snapshot(ConfigSnapshot::default())
    }

    pub fn with_snapshot(mut snapshot: ConfigSnapshot) -> Self {
        snapshot.ensure_profile();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config: RwLock::new(Arc::new(snapshot)),
            sequence: AtomicU64::new(1),
            events,
        }
    }

    /// Current configuration. Cheap; later edits do not affect the returned value.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.config.read())
    }

    pub fn settings(&self) -> Settings {
        self.config.read().settings.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// Sender half, for collaborators that publish their own events.
    pub fn notifier(&self) -> broadcast::Sender<StateEvent> {
        self.events.clone()
    }

    /// Next sequence number. Shared by every submission path, never reused.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn publish(&self, events: &[StateEvent]) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(*event);
        }
    }

    fn modify<F>(&self, events: &[StateEvent], edit: F) -> Result<()>
    where
        F: FnOnce(&mut ConfigSnapshot) -> Result<()>,
    {
        {
            let mut live = self.config.write();
            let mut next = ConfigSnapshot::clone(&live);
            edit(&mut next)?;
            next.ensure_profile();
            *live = Arc::new(next);
        }
        self.publish(events);
        Ok(())
    }

    fn modify_config<F>(&self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut ConfigSnapshot) -> Result<()>,
    {
        self.modify(&[StateEvent::ConfigChanged], edit)
    }

    fn modify_profiles<F>(&self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut ConfigSnapshot) -> Result<()>,
    {
        self.modify(&[StateEvent::ProfilesChanged], edit)
    }

    /// Swap in a complete configuration in one step.
    pub fn replace(&self, snapshot: ConfigSnapshot) {
        let result = self.modify(&[StateEvent::ProfilesChanged, StateEvent::ConfigChanged], |live| {
            *live = snapshot;
            Ok(())
        });
        debug_assert!(result.is_ok());
    }

    pub fn update_settings<F>(&self, edit: F)
    where
        F: FnOnce(&mut Settings),
    {
        let _ = self.modify_config(|live| {
            edit(&mut live.settings);
            Ok(())
        });
    }

    pub fn set_enabled(&self, enabled: bool) {
        debug!("Replay engine {}", if enabled { "enabled" } else { "disabled" });
        self.update_settings(|s| s.enabled = enabled);
    }

    pub fn is_enabled(&self) -> bool {
        self.config.read().settings.enabled
    }

    // Profiles

    pub fn add_profile(&self, profile: Profile) -> ProfileId {
        let id = profile.id();
        let _ = self.modify_profiles(|live| {
            live.profiles.push(profile);
            Ok(())
        });
        id
    }

    pub fn remove_profile(&self, id: ProfileId) -> Result<()> {
        self.modify_profiles(|live| {
            let index = live
                .profiles
                .iter()
                .position(|p| p.id() == id)
                .ok_or(Error::ProfileNotFound(id))?;
            if live.profiles.len() <= 1 {
                return Err(Error::LastProfile);
            }
            live.profiles.remove(index);
            Ok(())
        })
    }

    pub fn rename_profile(&self, id: ProfileId, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.modify_profiles(|live| {
            live.profile_mut(id)?.name = name;
            Ok(())
        })
    }

    /// Copy a profile as "<name> Copy" with a fresh identity.
    pub fn duplicate_profile(&self, id: ProfileId) -> Result<ProfileId> {
        let mut new_id = None;
        self.modify_profiles(|live| {
            let source = live.profile(id).ok_or(Error::ProfileNotFound(id))?;
            let copy = source.duplicate(format!("{} Copy", source.name));
            new_id = Some(copy.id());
            live.profiles.push(copy);
            Ok(())
        })?;
        new_id.ok_or(Error::ProfileNotFound(id))
    }

    pub fn update_profile_headers(&self, id: ProfileId, headers_text: impl Into<String>) -> Result<()> {
        let headers_text = headers_text.into();
        self.modify_config(|live| {
            live.profile_mut(id)?.headers_text = headers_text;
            Ok(())
        })
    }

    pub fn set_profile_mode(&self, id: ProfileId, mode: CombineMode) -> Result<()> {
        self.modify_config(|live| {
            live.profile_mut(id)?.mode = mode;
            Ok(())
        })
    }

    pub fn add_match_rule(&self, id: ProfileId, rule: MatchReplaceRule) -> Result<()> {
        self.modify_config(|live| {
            live.profile_mut(id)?.match_replace.push(rule);
            Ok(())
        })
    }

    pub fn update_match_rule(&self, id: ProfileId, index: usize, rule: MatchReplaceRule) -> Result<()> {
        self.modify_config(|live| {
            let rules = &mut live.profile_mut(id)?.match_replace;
            check_index("match/replace rule", rules, index)?;
            rules[index] = rule;
            Ok(())
        })
    }

    pub fn remove_match_rule(&self, id: ProfileId, index: usize) -> Result<()> {
        self.modify_config(|live| {
            let rules = &mut live.profile_mut(id)?.match_replace;
            check_index("match/replace rule", rules, index)?;
            rules.remove(index);
            Ok(())
        })
    }

    pub fn add_enforcement_rule(&self, id: ProfileId, rule: EnforcementRule) -> Result<()> {
        self.modify_config(|live| {
            live.profile_mut(id)?.enforcement.push(rule);
            Ok(())
        })
    }

    pub fn update_enforcement_rule(&self, id: ProfileId, index: usize, rule: EnforcementRule) -> Result<()> {
        self.modify_config(|live| {
            let rules = &mut live.profile_mut(id)?.enforcement;
            check_index("enforcement rule", rules, index)?;
            rules[index] = rule;
            Ok(())
        })
    }

    pub fn remove_enforcement_rule(&self, id: ProfileId, index: usize) -> Result<()> {
        self.modify_config(|live| {
            let rules = &mut live.profile_mut(id)?.enforcement;
            check_index("enforcement rule", rules, index)?;
            rules.remove(index);
            Ok(())
        })
    }

    // Interception filters

    pub fn add_filter(&self, filter: InterceptionFilter) {
        let _ = self.modify_config(|live| {
            live.filters.push(filter);
            Ok(())
        });
    }

    pub fn update_filter(&self, index: usize, filter: InterceptionFilter) -> Result<()> {
        self.modify_config(|live| {
            check_index("filter", &live.filters, index)?;
            live.filters[index] = filter;
            Ok(())
        })
    }

    pub fn remove_filter(&self, index: usize) -> Result<()> {
        self.modify_config(|live| {
            check_index("filter", &live.filters, index)?;
            live.filters.remove(index);
            Ok(())
        })
    }

    /// Move a filter to a new position. Order is cosmetic; every filter is
    /// evaluated regardless of position.
    pub fn move_filter(&self, from: usize, to: usize) -> Result<()> {
        self.modify_config(|live| {
            check_index("filter", &live.filters, from)?;
            check_index("filter", &live.filters, to)?;
            let filter = live.filters.remove(from);
            live.filters.insert(to, filter);
            Ok(())
        })
    }

    // Unauthenticated detector

    pub fn add_unauth_rule(&self, rule: EnforcementRule) {
        let _ = self.modify_config(|live| {
            live.unauth_rules.push(rule);
            Ok(())
        });
    }

    pub fn update_unauth_rule(&self, index: usize, rule: EnforcementRule) -> Result<()> {
        self.modify_config(|live| {
            check_index("unauthenticated rule", &live.unauth_rules, index)?;
            live.unauth_rules[index] = rule;
            Ok(())
        })
    }

    pub fn remove_unauth_rule(&self, index: usize) -> Result<()> {
        self.modify_config(|live| {
            check_index("unauthenticated rule", &live.unauth_rules, index)?;
            live.unauth_rules.remove(index);
            Ok(())
        })
    }

    pub fn set_unauth_mode(&self, mode: CombineMode) {
        let _ = self.modify_config(|live| {
            live.unauth_mode = mode;
            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{EnforcementKind, MatchReplaceKind};

    #[test]
    fn fresh_state_has_defaults() {
        let state = ReplayState::new();
        let snap = state.snapshot();
        assert_eq!(snap.profiles.len(), 1);
        assert_eq!(snap.profiles[0].name, DEFAULT_PROFILE_NAME);
        let kinds: Vec<_> = snap.filters.iter().map(|f| f.kind()).collect();
        assert_eq!(
            kinds,
            vec![FilterKind::ScopeOnly, FilterKind::UrlNotRegex, FilterKind::IgnoreOptions]
        );
        assert!(!snap.settings.enabled);
        assert!(snap.settings.check_unauthenticated);
        assert_eq!(snap.query_override(), None);
    }

    #[test]
    fn static_asset_filter_skips_assets_only() {
        let filter = InterceptionFilter::new(FilterKind::UrlNotRegex, STATIC_ASSETS_PATTERN);
        let re = filter.regex().expect("default pattern compiles");
        assert!(re.is_match("https://app.test/static/app.js"));
        assert!(re.is_match("https://app.test/logo.PNG?v=3"));
        assert!(!re.is_match("https://app.test/api/users.json"));
        assert!(!re.is_match("https://app.test/api/users"));
    }

    #[test]
    fn last_profile_cannot_be_removed() {
        let state = ReplayState::new();
        let id = state.snapshot().profiles[0].id();
        assert!(matches!(state.remove_profile(id), Err(Error::LastProfile)));
        assert_eq!(state.snapshot().profiles.len(), 1);
    }

    #[test]
    fn snapshots_are_isolated_from_later_edits() {
        let state = ReplayState::new();
        let before = state.snapshot();
        state.add_profile(Profile::new("User 2"));
        assert_eq!(before.profiles.len(), 1);
        assert_eq!(state.snapshot().profiles.len(), 2);
    }

    #[test]
    fn duplicate_adds_copy_suffix() {
        let state = ReplayState::new();
        let id = state.snapshot().profiles[0].id();
        state
            .add_match_rule(id, MatchReplaceRule::new(MatchReplaceKind::PathLiteral, "/a", "/b"))
            .unwrap();
        let copy_id = state.duplicate_profile(id).unwrap();
        let snap = state.snapshot();
        let copy = snap.profile(copy_id).unwrap();
        assert_eq!(copy.name, "User 1 Copy");
        assert_eq!(copy.match_replace.len(), 1);
    }

    #[test]
    fn failed_edit_leaves_state_untouched() {
        let state = ReplayState::new();
        let before = state.snapshot();
        assert!(matches!(
            state.remove_filter(10),
            Err(Error::IndexOutOfRange { index: 10, len: 3, .. })
        ));
        assert!(Arc::ptr_eq(&before, &state.snapshot()));
    }

    #[test]
    fn move_filter_reorders() {
        let state = ReplayState::new();
        state.move_filter(2, 0).unwrap();
        assert_eq!(state.snapshot().filters[0].kind(), FilterKind::IgnoreOptions);
    }

    #[test]
    fn edits_publish_events() {
        let state = ReplayState::new();
        let mut events = state.subscribe();
        state.add_profile(Profile::new("User 2"));
        state.add_unauth_rule(EnforcementRule::new(EnforcementKind::StatusEquals, false, "302"));
        assert_eq!(events.try_recv().unwrap(), StateEvent::ProfilesChanged);
        assert_eq!(events.try_recv().unwrap(), StateEvent::ConfigChanged);
    }

    #[test]
    fn sequence_numbers_start_at_one_and_increase() {
        let state = ReplayState::new();
        assert_eq!(state.next_sequence(), 1);
        assert_eq!(state.next_sequence(), 2);
    }
}
