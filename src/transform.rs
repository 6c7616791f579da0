// Request transformer
// Turns a captured request into the replay request sent for one profile.
// Steps run in a fixed order: match/replace stages, query override,
// profile header block, stepper override.

use tracing::trace;

use crate::engine::{PROFILE_HEADER, REPLAY_MARKER_HEADER};
use crate::models::{latin1_to_bytes, Header, HttpRequest};
use crate::profile::Profile;
use crate::rules::{MatchReplaceRule, Stage};

/// Header set by stepper-header rules, read by the login stepper.
pub const STEPPER_HEADER: &str = "X-Stepper-Execute-Login";

/// Headers carrying the user's identity, removed for the unauthenticated replay.
pub const IDENTITY_HEADERS: [&str; 2] = ["Cookie", "Authorization"];

/// Build the replay request for `profile`. Pure: the same inputs always
/// produce the same request.
pub fn transform(original: &HttpRequest, profile: &Profile, query_override: Option<&str>) -> HttpRequest {
    let mut request = original.clone();
    apply_match_replace(&mut request, &profile.match_replace);
    if let Some(text) = query_override {
        apply_query_override(&mut request, text);
    }
    for header in parse_header_block(&profile.headers_text) {
        request.set_header(&header.name, header.value);
    }
    apply_stepper_rules(&mut request, &profile.match_replace);
    request
}

fn rules_in(rules: &[MatchReplaceRule], stage: Stage) -> impl Iterator<Item = &MatchReplaceRule> {
    rules.iter().filter(move |rule| rule.kind().stage() == stage)
}

/// Run the path, header, cookie, header-line and body stages in turn. Each
/// stage applies every rule of its kind before the next stage starts.
pub fn apply_match_replace(request: &mut HttpRequest, rules: &[MatchReplaceRule]) {
    if rules.is_empty() {
        return;
    }

    for rule in rules_in(rules, Stage::Path) {
        request.target = rule.apply_to(&request.target);
    }

    for rule in rules_in(rules, Stage::Header) {
        let name = rule.pattern().trim();
        if !name.is_empty() {
            request.set_header(name, rule.replacement());
        }
    }

    for rule in rules_in(rules, Stage::Cookie) {
        let name = rule.pattern().trim();
        if !name.is_empty() {
            replace_cookie(request, name, rule.replacement());
        }
    }

    let line_rules: Vec<&MatchReplaceRule> = rules_in(rules, Stage::HeaderLines).collect();
    if !line_rules.is_empty() {
        for header in request.headers.iter_mut() {
            let line = line_rules
                .iter()
                .fold(header.to_string(), |line, rule| rule.apply_to(&line));
            match Header::parse_line(&line) {
                Some(parsed) => *header = parsed,
                None => trace!("Header rewrite produced '{}', keeping {}", line, header.name),
            }
        }
    }

    let body_rules: Vec<&MatchReplaceRule> = rules_in(rules, Stage::Body).collect();
    if !body_rules.is_empty() {
        let utf8 = std::str::from_utf8(&request.body).is_ok();
        let text = body_rules
            .iter()
            .fold(request.body_text().into_owned(), |body, rule| rule.apply_to(&body));
        let bytes = if utf8 { text.into_bytes() } else { latin1_to_bytes(&text) };
        request.set_body(bytes);
    }
}

/// Set cookie `name` to `value` inside the `Cookie` header(s), keeping the
/// order of the other pairs. Appends the pair when no header holds it and
/// adds a `Cookie` header when there is none.
pub fn replace_cookie(request: &mut HttpRequest, name: &str, value: &str) {
    let pair = format!("{}={}", name, value);
    let mut found_header = false;
    let mut replaced = false;

    for header in request.headers.iter_mut().filter(|h| h.is_named("Cookie")) {
        found_header = true;
        if let Some(updated) = replace_cookie_pair(&header.value, name, &pair) {
            header.value = updated;
            replaced = true;
        }
    }

    if !found_header {
        request.add_header("Cookie", pair);
        return;
    }

    if !replaced {
        if let Some(header) = request.headers.iter_mut().find(|h| h.is_named("Cookie")) {
            let current = header.value.trim().trim_end_matches(';').trim_end();
            header.value = if current.is_empty() {
                pair
            } else {
                format!("{}; {}", current, pair)
            };
        }
    }
}

/// Replace the first pair named `name`, re-joining pairs with `; `.
/// `None` when the header does not hold that cookie.
fn replace_cookie_pair(header_value: &str, name: &str, pair: &str) -> Option<String> {
    let mut parts: Vec<&str> = header_value
        .split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();
    let position = parts.iter().position(|part| {
        part.split_once('=')
            .map_or(false, |(cookie, _)| !cookie.trim().is_empty() && cookie.trim() == name)
    })?;
    parts[position] = pair;
    Some(parts.join("; "))
}

/// Apply a `key=value` query override: every parameter named `key` gets the
/// new value, or the pair is appended when the key is absent. Text without a
/// key before `=` is ignored.
pub fn apply_query_override(request: &mut HttpRequest, override_text: &str) {
    let Some((key, value)) = override_text.split_once('=') else {
        return;
    };
    let (key, value) = (key.trim(), value.trim());
    if key.is_empty() {
        return;
    }

    let (path, query) = match request.target.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (request.target.clone(), None),
    };
    let pair = format!("{}={}", key, value);

    let query = match query {
        Some(query) if query.split('&').any(|param| !param.is_empty()) => {
            let mut present = false;
            let pairs: Vec<String> = query
                .split('&')
                .filter(|param| !param.is_empty())
                .map(|param| {
                    let name = param.split_once('=').map_or(param, |(name, _)| name);
                    if name == key {
                        present = true;
                        pair.clone()
                    } else {
                        param.to_string()
                    }
                })
                .collect();
            let mut joined = pairs.join("&");
            if !present {
                joined.push('&');
                joined.push_str(&pair);
            }
            joined
        }
        _ => pair,
    };
    request.target = format!("{}?{}", path, query);
}

/// Parse a profile's free-text header block, one `Name: Value` per line.
/// Blank and malformed lines are skipped.
pub fn parse_header_block(text: &str) -> Vec<Header> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(Header::parse_line)
        .collect()
}

/// Stepper rules run last so nothing else can shadow the stepper header.
pub fn apply_stepper_rules(request: &mut HttpRequest, rules: &[MatchReplaceRule]) {
    for rule in rules_in(rules, Stage::Stepper) {
        request.set_header(STEPPER_HEADER, rule.replacement());
    }
}

/// Copy of `request` without identity headers or replay markers.
pub fn strip_identity(request: &HttpRequest) -> HttpRequest {
    let mut stripped = request.clone();
    for name in IDENTITY_HEADERS.iter().chain([REPLAY_MARKER_HEADER, PROFILE_HEADER].iter()) {
        stripped.remove_header(name);
    }
    stripped
}
