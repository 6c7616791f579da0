/// Integration tests for configuration import/export and persisted settings
use std::time::Duration;
use std::sync::Arc;

use surrogate::config::{export_json, import_json, load_file, save_file};
use surrogate::error::Error;
use surrogate::persistence::SettingsStore;
use surrogate::profile::Profile;
use surrogate::rules::{
    CombineMode, EnforcementKind, EnforcementRule, FilterKind, InterceptionFilter, MatchReplaceKind, MatchReplaceRule,
};
use surrogate::state::ReplayState;

fn configured_state() -> ReplayState {
    let state = ReplayState::new();
    let first = state.snapshot().profiles[0].id();
    state.rename_profile(first, "Alice").unwrap();
    state.update_profile_headers(first, "Cookie: session=alice\nAuthorization: Bearer a").unwrap();
    state
        .add_match_rule(first, MatchReplaceRule::new(MatchReplaceKind::PathRegex, r"/users/\d+", "/users/2"))
        .unwrap();
    state
        .add_enforcement_rule(first, EnforcementRule::new(EnforcementKind::BodyContains, true, "\"ok\":true"))
        .unwrap();
    state.set_profile_mode(first, CombineMode::And).unwrap();

    state.add_profile(
        Profile::new("Guest").with_rule(MatchReplaceRule::new(MatchReplaceKind::CookieReplace, "session", "guest")),
    );
    state.add_filter(InterceptionFilter::new(FilterKind::OnlyMethods, "GET,POST"));
    state.add_unauth_rule(EnforcementRule::new(EnforcementKind::StatusEquals, false, "302"));
    state.set_unauth_mode(CombineMode::And);
    state.update_settings(|s| {
        s.prevent_304 = true;
        s.show_enforced = false;
    });
    state
}

fn same_config(a: &ReplayState, b: &ReplayState) {
    let (a, b) = (a.snapshot(), b.snapshot());
    assert_eq!(a.settings, b.settings);
    assert_eq!(a.filters, b.filters);
    assert_eq!(a.unauth_rules, b.unauth_rules);
    assert_eq!(a.unauth_mode, b.unauth_mode);
    assert_eq!(a.profiles.len(), b.profiles.len());
    for (pa, pb) in a.profiles.iter().zip(&b.profiles) {
        assert_eq!(pa.name, pb.name);
        assert_eq!(pa.headers_text, pb.headers_text);
        assert_eq!(pa.match_replace, pb.match_replace);
        assert_eq!(pa.enforcement, pb.enforcement);
        assert_eq!(pa.mode, pb.mode);
    }
}

#[test]
fn json_config_round_trips_through_a_file() {
    let source = configured_state();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    save_file(&source, &path).unwrap();

    let target = ReplayState::new();
    load_file(&target, &path).unwrap();
    same_config(&source, &target);
}

#[test]
fn unsupported_version_leaves_state_untouched() {
    let state = configured_state();
    let before = export_json(&state).unwrap();

    let newer = before.replacen("\"version\": 1", "\"version\": 2", 1);
    let err = import_json(&state, &newer).unwrap_err();
    assert!(matches!(err, Error::UnsupportedVersion(2)));
    assert_eq!(export_json(&state).unwrap(), before);

    assert!(matches!(import_json(&state, "{not json"), Err(Error::Json(_))));
    assert_eq!(export_json(&state).unwrap(), before);
}

#[test]
fn import_disables_the_engine() {
    let state = configured_state();
    state.set_enabled(true);
    let json = export_json(&state).unwrap();
    import_json(&state, &json).unwrap();
    assert!(!state.is_enabled());
}

#[test]
fn settings_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = SettingsStore::new(dir.path().join("settings.json"));

    let source = configured_state();
    source.set_enabled(true);
    store.save(&source).unwrap();

    let target = ReplayState::new();
    assert!(store.load(&target).unwrap());
    assert!(!target.is_enabled());
    source.set_enabled(false);
    same_config(&source, &target);
}

#[test]
fn missing_settings_file_is_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = SettingsStore::new(dir.path().join("absent.json"));
    let state = ReplayState::new();
    assert!(!store.load(&state).unwrap());
    assert_eq!(state.snapshot().profiles.len(), 1);
}

#[test]
fn undecodable_entries_are_dropped_individually() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    std::fs::write(
        &path,
        r#"{
            "version": 1,
            "interceptionFilters": ["t=url-contains;c=L2FwaQ==", "t=warp-drive;c=", "nonsense"],
            "profiles": [{"name": "Bob", "headers": "Cookie: s=b", "mode": "and",
                          "mr": ["t=header-replace;m=WC1Sb2xl;r=WC1Sb2xlOiBndWVzdA==", "broken"],
                          "ed": []}]
        }"#,
    )
    .unwrap();

    let state = ReplayState::new();
    SettingsStore::new(&path).load(&state).unwrap();
    let snapshot = state.snapshot();
    assert_eq!(snapshot.filters, vec![InterceptionFilter::new(FilterKind::UrlContains, "/api")]);
    let bob = &snapshot.profiles[0];
    assert_eq!(bob.name, "Bob");
    assert_eq!(bob.mode, CombineMode::And);
    assert_eq!(
        bob.match_replace,
        vec![MatchReplaceRule::new(MatchReplaceKind::HeaderReplace, "X-Role", "X-Role: guest")]
    );
}

#[tokio::test]
async fn autosave_follows_configuration_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    let state = Arc::new(ReplayState::new());
    let handle = SettingsStore::new(&path).spawn_autosave(Arc::clone(&state));

    let first = state.snapshot().profiles[0].id();
    state.rename_profile(first, "Renamed").unwrap();

    let mut saved = String::new();
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if let Ok(text) = std::fs::read_to_string(&path) {
            if text.contains("Renamed") {
                saved = text;
                break;
            }
        }
    }
    assert!(saved.contains("Renamed"), "settings were not autosaved");
    handle.abort();
}
