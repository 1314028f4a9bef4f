//! Prompt templates for the research, plot, writer and review stages.
//!
//! Templates are plain strings with `{placeholder}` slots. Caller-supplied
//! values are escaped before substitution so they cannot open or close the
//! XML-style sections the templates use to delimit context.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::gateway::Message;

static SLOT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{(\w+)\}").expect("slot regex is valid"));

// =============================================================================
// Prompt templates
// =============================================================================

/// Rendered prompt ready for the model.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: &'static str,
    pub template_hash: String,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// Escape the characters that could break a `<section>` delimiter.
///
/// Quotes are left alone so embedded JSON stays readable to the reviewer.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// A prompt template with placeholders.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    /// Substitute `{name}` slots in both system and user text.
    ///
    /// Slots without a matching variable are left as-is. Substitution is a
    /// single pass, so inserted values are never scanned for slots.
    pub fn render(&self, vars: &[(&str, &str)]) -> PromptInstance {
        let escaped: Vec<(&str, String)> = vars
            .iter()
            .map(|(name, value)| (*name, escape_xml_chars(value.trim())))
            .collect();
        let fill = |text: &str| -> String {
            SLOT.replace_all(text, |caps: &Captures<'_>| {
                escaped
                    .iter()
                    .find(|(name, _)| *name == &caps[1])
                    .map(|(_, value)| value.clone())
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
        };
        let system = fill(self.system);
        let user = fill(self.user);

        PromptInstance {
            template_slug: self.slug,
            template_hash: self.template_hash(),
            system: system.trim().to_string(),
            user: user.trim().to_string(),
        }
    }

    /// Short content hash of the unrendered template, recorded in traces so
    /// prompt edits can be correlated with quality changes.
    pub fn template_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.slug.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.system.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.user.as_bytes());
        hasher.finalize().to_hex()[..16].to_string()
    }
}

/// Display name of a locale for "write in X" instructions.
pub fn language_name(locale: &str) -> &str {
    match locale {
        "ja" => "Japanese",
        "en" => "English",
        "de" => "German",
        "fr" => "French",
        "es" => "Spanish",
        "ko" => "Korean",
        "zh" => "Chinese",
        other => other,
    }
}

// =============================================================================
// Residue prompts
// =============================================================================

const WORLD_PREMISE: &str = "A world where death loops you back to the start. Traces of earlier loops \
(residue) survive as things that were never fully erased, and accumulate. Through repetition \
the player edges closer to the truth.";

pub const RESEARCH_V1: PromptTemplate = PromptTemplate {
    slug: "research_v1",
    system: r#"You are the researcher for the dark-fantasy roguelike "Residue". You find source material that story designers can vary into new events.

<world_premise>
{premise}
</world_premise>"#,
    user: r#"<world_keywords>
{world_keywords}
</world_keywords>

<location>
{node_description}
</location>

Find story sources that fit this situation. Cover at least ten works, drawing widely from:
- tabletop RPG scenarios (Call of Cthulhu, Sword World and similar)
- web novels (dark fantasy and SF serials)
- classic literature (Dante's Divine Comedy, Kafka, Dostoevsky and similar)
- films and anime (time loops, dystopias)

For each work give the title, a summary of at most three lines, and the elements Residue could reuse.

Output a JSON array only:
[{"title": "...", "summary": "...", "usable_elements": "..."}]"#,
};

pub const PLOT_V1: PromptTemplate = PromptTemplate {
    slug: "plot_v1",
    system: r#"You are the story director for the dark-fantasy roguelike "Residue".

<world_premise>
{premise}
</world_premise>

The core of Residue: death and inheritance, what was left unerased, traces of earlier loops, the feeling that "my body remembers what I do not"."#,
    user: r#"<situation>
- World: {world_id}
- Location: {node_name} ({node_description})
- Player: loop {loop_count}, truth stage {truth_stage}
- Personality traits: {traits}
- Play style: {play_style}
- Known flags: {flags}
</situation>

<inspiration>
{inspiration}
</inspiration>
Freely combine elements of these works into a new event that fits Residue. Vary them; do not copy them.

<pacing tier="{pacing_tier}">
{pacing}
</pacing>

Write the plot of the event that happens at this location as a single paragraph: what happens, which choice the player is forced to make, and how it turns out."#,
};

pub const WRITER_V1: PromptTemplate = PromptTemplate {
    slug: "writer_v1",
    system: r#"You are the event writer for the dark-fantasy roguelike "Residue". You turn a plot into a game event in strict JSON. Write all player-facing text in {language}.

<examples>
Example 1
text: "The altar candles cast no shadow of you. You should have no memory of this place, yet your fingers know the order."
choices:
- "Rearrange the candles as memory dictates" (curious, sets_flag: altar_rearranged)
- "Study your shadowless hand" (cautious)
- "Blow out every candle" (bold, damage 10)

Example 2
text: "A stain on the wall reads like letters. A message your previous self scratched with a fingernail. It says only: run."
choices:
- "Trace the letters with a finger" (curious, sets_flag: read_wall_message)
- "Obey the message and turn back" (cautious, heal 5)
- "Smash the wall with your fist" (defiant, damage 15)
</examples>"#,
    user: r#"<plot>
{plot}
</plot>

Output only this JSON object, with no commentary:
{
  "text": "event text, 2-3 lines; short, sharp, lingering",
  "choices": [
    {
      "label": "a concrete action (never 'go forward'; think 'lick the blood from the altar')",
      "tags": ["trait_tag"],
      "effect": {"kind": "damage", "magnitude": 10},
      "result_text": "one lingering line of outcome",
      "sets_flag": null
    }
  ]
}

Constraints:
- 2 to 4 choices, each suiting a different play style
- effect.kind is one of damage, heal, gold; effect.magnitude is between 5 and 20
- tags come only from: {tag_vocabulary}
- sets_flag is snake_case; you may invent new flag names, or use null"#,
};

pub const REVIEW_V1: PromptTemplate = PromptTemplate {
    slug: "review_v1",
    system: r#"You are the quality reviewer for the dark-fantasy roguelike "Residue". Events scoring below {threshold} are sent back for rewriting."#,
    user: r#"<event>
{event_json}
</event>

Score each criterion from 0 to 1:
1. Atmosphere: does it carry the unease of dark fantasy and looping?
2. Choices: concrete and fitting, with no vague "go forward" options?
3. Effects: magnitudes within 5-20, with clear risk and reward?
4. Tags: do the tags reflect each choice's personality?
5. Consistency: nothing contradicts the world?

Return the weighted overall score and short feedback as JSON only:
{"quality_score": 0.8, "feedback": "..."}"#,
};

pub fn world_premise() -> &'static str {
    WORLD_PREMISE
}

// =============================================================================
// TESTS
// =============================================================================
