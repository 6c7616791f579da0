// Rule value objects
//
// Each rule carries a kind tag, its text content and, for regex kinds, a
// pattern compiled once at construction. A pattern that fails to compile is
// stored as `None` and every consumer treats `None` as "never matches".
//
//   match_replace.rs  request rewriting rules (per profile)
//   enforcement.rs    "access denied" detectors and their AND/OR evaluation
//   interception.rs   filters gating which exchanges get replayed

pub mod enforcement;
pub mod interception;
pub mod match_replace;

pub use enforcement::*;
pub use interception::*;
pub use match_replace::*;

use regex::{Regex, RegexBuilder};
use tracing::debug;

/// Error returned when a kind name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown rule kind: {0}")]
pub struct UnknownKind(pub String);

pub(crate) fn compile_pattern(pattern: &str, case_insensitive: bool) -> Option<Regex> {
    match RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
    {
        Ok(re) => Some(re),
        Err(e) => {
            debug!("Invalid rule pattern '{}', rule will never match: {}", pattern, e);
            None
        }
    }
}

pub(crate) fn regex_found(regex: Option<&Regex>, text: &str) -> bool {
    regex.map_or(false, |re| re.is_match(text))
}
