// User profiles: the alternate identities a captured request is replayed as

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rules::{CombineMode, EnforcementRule, MatchReplaceRule};

/// Stable identity of a profile. Survives renames, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProfileId(Uuid);

impl ProfileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProfileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    id: ProfileId,
    pub name: String,
    /// Free text, one `Name: Value` header per line, injected into every replay
    pub headers_text: String,
    pub match_replace: Vec<MatchReplaceRule>,
    pub enforcement: Vec<EnforcementRule>,
    pub mode: CombineMode,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ProfileId::new(),
            name: name.into(),
            headers_text: String::new(),
            match_replace: Vec::new(),
            enforcement: Vec::new(),
            mode: CombineMode::Or,
        }
    }

    pub fn id(&self) -> ProfileId {
        self.id
    }

    pub fn with_headers(mut self, headers_text: impl Into<String>) -> Self {
        self.headers_text = headers_text.into();
        self
    }

    pub fn with_rule(mut self, rule: MatchReplaceRule) -> Self {
        self.match_replace.push(rule);
        self
    }

    pub fn with_enforcement(mut self, rule: EnforcementRule, mode: CombineMode) -> Self {
        self.enforcement.push(rule);
        self.mode = mode;
        self
    }

    /// Copy of this profile under a new name and a fresh identity.
    pub fn duplicate(&self, name: impl Into<String>) -> Self {
        Self {
            id: ProfileId::new(),
            name: name.into(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::MatchReplaceKind;

    #[test]
    fn duplicate_keeps_rules_but_not_identity() {
        let original = Profile::new("Admin")
            .with_headers("Cookie: session=abc")
            .with_rule(MatchReplaceRule::new(MatchReplaceKind::PathLiteral, "/me", "/1"));
        let copy = original.duplicate("Admin Copy");
        assert_ne!(copy.id(), original.id());
        assert_eq!(copy.name, "Admin Copy");
        assert_eq!(copy.headers_text, original.headers_text);
        assert_eq!(copy.match_replace, original.match_replace);
    }
}
