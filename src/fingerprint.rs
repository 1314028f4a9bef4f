//! Condition keys: the cache fingerprint for generated events.
//!
//! A key is a plain string composite of the world, node, truth stage, the
//! player's dominant trait and at most three context flags. Flags are
//! truncated to the first three *before* sorting, so surplus flags never
//! reach the key and the order the caller passes them in does not matter.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum number of context flags folded into a key.
pub const MAX_KEY_FLAGS: usize = 3;

/// Placeholder used when the player has no dominant trait.
pub const NO_TRAIT: &str = "none";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionKey(String);

impl ConditionKey {
    /// Build the key. Empty `world_id`/`node_id` are the caller's problem;
    /// the resolver rejects them before getting here.
    pub fn build<S: AsRef<str>>(
        world_id: &str,
        node_id: &str,
        truth_stage: i64,
        top_trait: &str,
        flags: &[S],
    ) -> Self {
        let mut kept: Vec<&str> = flags
            .iter()
            .take(MAX_KEY_FLAGS)
            .map(|f| f.as_ref())
            .collect();
        kept.sort_unstable();

        let top_trait = if top_trait.is_empty() {
            NO_TRAIT
        } else {
            top_trait
        };

        Self(format!(
            "{world_id}:{node_id}:ts{truth_stage}:t_{top_trait}:f_{}",
            kept.join(",")
        ))
    }

    /// Wrap a key read back from storage.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ConditionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ConditionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let key = ConditionKey::build("medieval", "shrine_01", 2, "cautious", &["b", "a"]);
        assert_eq!(key.as_str(), "medieval:shrine_01:ts2:t_cautious:f_a,b");
    }

    #[test]
    fn empty_trait_becomes_none() {
        let key = ConditionKey::build::<&str>("future", "lab", 0, "", &[]);
        assert_eq!(key.as_str(), "future:lab:ts0:t_none:f_");
    }

    #[test]
    fn flag_order_does_not_matter() {
        let a = ConditionKey::build("w", "n", 1, "bold", &["c", "a", "b"]);
        let b = ConditionKey::build("w", "n", 1, "bold", &["b", "c", "a"]);
        assert_eq!(a, b);
    }

    #[test]
    fn only_first_three_flags_count() {
        let a = ConditionKey::build("w", "n", 1, "bold", &["b", "a", "c", "d"]);
        let b = ConditionKey::build("w", "n", 1, "bold", &["a", "b", "c"]);
        assert_eq!(a, b);

        // Truncation happens before sorting: "a" is the fourth flag here.
        let c = ConditionKey::build("w", "n", 1, "bold", &["d", "c", "b", "a"]);
        assert_eq!(c.as_str(), "w:n:ts1:t_bold:f_b,c,d");
    }
}
