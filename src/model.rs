//! Domain types shared by the store, the orchestrator and the resolver.

use serde::{Deserialize, Serialize};

use crate::fingerprint::ConditionKey;

// =============================================================================
// Choice schema
// =============================================================================

/// Inclusive bounds on a choice's effect magnitude.
pub const MIN_EFFECT_MAGNITUDE: u32 = 5;
pub const MAX_EFFECT_MAGNITUDE: u32 = 20;

/// Inclusive bounds on the number of choices per event.
pub const MIN_CHOICES: usize = 2;
pub const MAX_CHOICES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    Damage,
    Heal,
    Gold,
}

impl EffectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Damage => "damage",
            Self::Heal => "heal",
            Self::Gold => "gold",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "damage" => Some(Self::Damage),
            "heal" => Some(Self::Heal),
            "gold" => Some(Self::Gold),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceEffect {
    pub kind: EffectKind,
    pub magnitude: u32,
}

impl ChoiceEffect {
    /// Builds an effect with the magnitude clamped into the allowed band.
    pub fn clamped(kind: EffectKind, magnitude: i64) -> Self {
        let magnitude = magnitude.clamp(
            i64::from(MIN_EFFECT_MAGNITUDE),
            i64::from(MAX_EFFECT_MAGNITUDE),
        ) as u32;
        Self { kind, magnitude }
    }
}

/// Fixed personality vocabulary used to tag choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonalityTag {
    Merciful,
    Cruel,
    Curious,
    Cautious,
    Bold,
    Reckless,
    Fearless,
    Defiant,
    Obedient,
    Pragmatic,
    Empathetic,
    Thorough,
    Hasty,
    Greedy,
}

impl PersonalityTag {
    pub const ALL: [PersonalityTag; 14] = [
        Self::Merciful,
        Self::Cruel,
        Self::Curious,
        Self::Cautious,
        Self::Bold,
        Self::Reckless,
        Self::Fearless,
        Self::Defiant,
        Self::Obedient,
        Self::Pragmatic,
        Self::Empathetic,
        Self::Thorough,
        Self::Hasty,
        Self::Greedy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Merciful => "merciful",
            Self::Cruel => "cruel",
            Self::Curious => "curious",
            Self::Cautious => "cautious",
            Self::Bold => "bold",
            Self::Reckless => "reckless",
            Self::Fearless => "fearless",
            Self::Defiant => "defiant",
            Self::Obedient => "obedient",
            Self::Pragmatic => "pragmatic",
            Self::Empathetic => "empathetic",
            Self::Thorough => "thorough",
            Self::Hasty => "hasty",
            Self::Greedy => "greedy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }

    /// Comma-separated vocabulary, for prompts.
    pub fn vocabulary() -> String {
        Self::ALL
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// A player-visible option on an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub label: String,
    #[serde(default)]
    pub tags: Vec<PersonalityTag>,
    pub effect: ChoiceEffect,
    #[serde(default)]
    pub result_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sets_flag: Option<String>,
}

// =============================================================================
// Artifacts
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Active,
    Retired,
}

impl ArtifactStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Retired => "retired",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            _ => Self::Retired,
        }
    }
}

/// A generated event tied to a condition key.
///
/// Written once by the orchestrator; afterwards only `usage_count` (on cache
/// hits) and `status` (on invalidation) ever change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    pub id: String,
    pub world_id: String,
    pub node_id: String,
    pub condition_key: ConditionKey,
    pub layer: String,
    pub text: String,
    pub locale: String,
    pub choices: Vec<Choice>,
    pub effects: Option<serde_json::Value>,
    pub generated_by: String,
    pub quality_score: f64,
    pub status: ArtifactStatus,
    pub usage_count: i64,
    pub created_at: i64,
}

/// Prefix on every generated event id.
pub const ARTIFACT_ID_PREFIX: &str = "ge_";

pub fn new_artifact_id() -> String {
    short_id(ARTIFACT_ID_PREFIX)
}

/// `prefix` + 16 hex chars of a v4 uuid.
pub(crate) fn short_id(prefix: &str) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}{}", &hex[..16])
}

// =============================================================================
// Inspiration
// =============================================================================

/// One reference work summarized by the research call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspirationSource {
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "synopsis")]
    pub summary: String,
    /// Models return either a string or a list; lists are joined.
    #[serde(default, alias = "reusable_elements", deserialize_with = "string_or_list")]
    pub usable_elements: String,
}

fn string_or_list<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Elements {
        One(String),
        Many(Vec<String>),
        Other(serde_json::Value),
    }

    Ok(match Elements::deserialize(deserializer)? {
        Elements::One(s) => s,
        Elements::Many(items) => items.join(", "),
        Elements::Other(_) => String::new(),
    })
}

/// Cached research output for one condition key. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspirationDocument {
    pub doc_id: String,
    pub condition_key: ConditionKey,
    pub world_id: String,
    pub node_id: String,
    /// Raw research text as returned by the model.
    pub raw: String,
    pub created_at: i64,
}

impl InspirationDocument {
    /// Parsed sources; empty when the raw text holds no JSON array.
    pub fn sources(&self) -> Vec<InspirationSource> {
        crate::extract::parse_json::<Vec<InspirationSource>>(&self.raw)
            .map(|sources| {
                sources
                    .into_iter()
                    .filter(|s| !s.title.trim().is_empty() || !s.summary.trim().is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Inspiration handed to the plot stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Inspiration {
    #[default]
    None,
    Sources(Vec<InspirationSource>),
    /// Research text that did not parse as a source list.
    Unstructured(String),
}

impl Inspiration {
    pub fn from_document(doc: &InspirationDocument) -> Self {
        let sources = doc.sources();
        if !sources.is_empty() {
            Self::Sources(sources)
        } else if doc.raw.trim().is_empty() {
            Self::None
        } else {
            Self::Unstructured(doc.raw.trim().to_string())
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn render(&self) -> String {
        match self {
            Self::None => "(none)".to_string(),
            Self::Sources(sources) => sources
                .iter()
                .map(|s| {
                    format!(
                        "- {}: {} (usable: {})",
                        s.title.trim(),
                        s.summary.trim(),
                        s.usable_elements.trim()
                    )
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Self::Unstructured(text) => text.clone(),
        }
    }
}

// =============================================================================
// Collaborator records
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub world_id: String,
    pub node_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub player_id: String,
    #[serde(default)]
    pub play_style: Option<String>,
    #[serde(default)]
    pub total_runs: i64,
}

// =============================================================================
// Generation context
// =============================================================================

/// Narrative pacing bucket derived from the loop count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingTier {
    /// Loops 1-2: introduce the world, basic threats and choices.
    Early,
    /// Loops 3-5: traces of earlier loops surface, choices weigh more.
    Mid,
    /// Loop 6 onward: clues to the truth, meta unease, major branches.
    Late,
}

impl PacingTier {
    pub fn from_loop_count(loop_count: i64) -> Self {
        match loop_count {
            i64::MIN..=2 => Self::Early,
            3..=5 => Self::Mid,
            _ => Self::Late,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Early => "early",
            Self::Mid => "mid",
            Self::Late => "late",
        }
    }

    pub fn guidance(self) -> &'static str {
        match self {
            Self::Early => {
                "First or second loop: introduce the world, its basic threats and a clear choice."
            }
            Self::Mid => {
                "Loops three to five: traces of earlier loops begin to surface and choices carry more weight."
            }
            Self::Late => {
                "Sixth loop onward: clues toward the truth, meta-level unease, and a significant branch."
            }
        }
    }
}

/// Everything the orchestrator needs for one generation. Built per request.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub world_id: String,
    pub node_id: String,
    pub node_name: String,
    pub node_description: String,
    pub truth_stage: i64,
    pub loop_count: i64,
    pub traits: Vec<String>,
    pub play_style: String,
    pub flags: Vec<String>,
    pub player_id: Option<String>,
    pub condition_key: ConditionKey,
}

impl GenerationContext {
    pub fn pacing(&self) -> PacingTier {
        PacingTier::from_loop_count(self.loop_count)
    }
}

// =============================================================================
// Resolver payload
// =============================================================================

/// Response payload for a resolved event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedEvent {
    pub gen_event_id: String,
    pub text: String,
    pub locale: String,
    pub choices: Vec<Choice>,
    pub quality_score: f64,
    pub generated_by: String,
    pub cached: bool,
}

impl ResolvedEvent {
    pub fn from_artifact(artifact: GeneratedArtifact, cached: bool) -> Self {
        Self {
            gen_event_id: artifact.id,
            text: artifact.text,
            locale: artifact.locale,
            choices: artifact.choices,
            quality_score: artifact.quality_score,
            generated_by: artifact.generated_by,
            cached,
        }
    }
}
