//! Three-stage event generation (plot -> writer -> review) with a bounded
//! attempt budget and a soft quality gate.
//!
//! Every attempt reruns all three stages with the same context. An attempt
//! fails when a model call fails or the writer output does not normalise into
//! a valid event. A valid event scoring under the threshold triggers another
//! attempt, but the final attempt is accepted whatever its score: low quality
//! is still usable content, a structurally broken event is not.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::extract::parse_json;
use crate::gateway::{
    Attribution, ChatGateway, ChatModel, ChatRequest, ChatResponse, ProviderError,
};
use crate::inspiration::{InspirationCollector, InspirationMode};
use crate::model::{
    new_artifact_id, ArtifactStatus, Choice, ChoiceEffect, EffectKind, GeneratedArtifact,
    GenerationContext, Inspiration, PersonalityTag, MAX_CHOICES, MIN_CHOICES,
};
use crate::prompts::{language_name, world_premise, PromptInstance, PLOT_V1, REVIEW_V1, WRITER_V1};
use crate::store::{now_epoch, ArtifactStore, GenerationTrace, StoreError};

/// Score assumed when the reviewer's output cannot be parsed.
pub const DEFAULT_REVIEW_SCORE: f64 = 0.7;

// =============================================================================
// Config
// =============================================================================

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Model id; also recorded as the artifact's `generated_by`.
    pub model: String,
    /// Extra attempts after the first.
    pub max_retries: u32,
    pub quality_threshold: f64,
    /// Layer tag written on every artifact.
    pub layer: String,
    /// Locale of generated player-facing text.
    pub locale: String,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            model: "google/gemini-2.5-flash".to_string(),
            max_retries: 2,
            quality_threshold: 0.6,
            layer: "L2_detail".to_string(),
            locale: "en".to_string(),
        }
    }
}

impl GeneratorConfig {
    /// Total pipeline attempts: the first plus `max_retries`.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("no valid event after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
    #[error("model unavailable: {0}")]
    Provider(#[from] ProviderError),
    #[error("generation cancelled")]
    Cancelled,
    #[error("failed to persist event: {0}")]
    Store(#[from] StoreError),
}

/// Why one attempt produced nothing usable.
#[derive(Debug, thiserror::Error)]
enum AttemptFailure {
    #[error("{stage} call failed: {source}")]
    Call {
        stage: Stage,
        #[source]
        source: ProviderError,
    },
    #[error("invalid stage output: {0}")]
    Structure(String),
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Plot,
    Writer,
    Review,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Stage::Plot => "plot",
            Stage::Writer => "writer",
            Stage::Review => "review",
        }
    }

    fn caller(self) -> &'static str {
        match self {
            Stage::Plot => "orchestrator::plot",
            Stage::Writer => "orchestrator::writer",
            Stage::Review => "orchestrator::review",
        }
    }

    fn temperature(self) -> f32 {
        match self {
            Stage::Plot => 0.9,
            Stage::Writer => 0.7,
            Stage::Review => 0.0,
        }
    }

    fn max_tokens(self) -> u32 {
        match self {
            Stage::Plot => 1_024,
            Stage::Writer => 2_048,
            Stage::Review => 512,
        }
    }

    fn wants_json(self) -> bool {
        !matches!(self, Stage::Plot)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Writer / reviewer output
// =============================================================================

/// An event that passed structural validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventDraft {
    pub text: String,
    pub choices: Vec<Choice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effects: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WriterOutput {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    text_ja: Option<String>,
    #[serde(default)]
    text_en: Option<String>,
    #[serde(default)]
    choices: Option<Vec<RawChoice>>,
    #[serde(default)]
    effects: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawChoice {
    #[serde(default)]
    label: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    effect: Option<RawEffect>,
    #[serde(default)]
    result_text: Option<String>,
    #[serde(default)]
    sets_flag: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEffect {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default, rename = "type")]
    type_: Option<String>,
    #[serde(default)]
    magnitude: Option<f64>,
    #[serde(default)]
    value: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ReviewOutput {
    #[serde(default, alias = "score")]
    quality_score: Option<f64>,
    #[serde(default)]
    feedback: Option<String>,
}

impl WriterOutput {
    fn normalise(self) -> Result<EventDraft, String> {
        let text = [self.text, self.text_ja, self.text_en]
            .into_iter()
            .flatten()
            .map(|t| t.trim().to_string())
            .find(|t| !t.is_empty())
            .ok_or_else(|| "missing event text".to_string())?;

        let mut raw_choices = self.choices.unwrap_or_default();
        raw_choices.truncate(MAX_CHOICES);
        if raw_choices.len() < MIN_CHOICES {
            return Err(format!(
                "expected at least {MIN_CHOICES} choices, got {}",
                raw_choices.len()
            ));
        }

        let choices = raw_choices
            .into_iter()
            .enumerate()
            .map(|(i, c)| c.normalise().map_err(|e| format!("choice {}: {e}", i + 1)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(EventDraft {
            text,
            choices,
            effects: self.effects.filter(|v| !v.is_null()),
        })
    }
}

impl RawChoice {
    fn normalise(self) -> Result<Choice, String> {
        let label = self.label.trim().to_string();
        if label.is_empty() {
            return Err("empty label".to_string());
        }

        let effect = self.effect.ok_or_else(|| "missing effect".to_string())?;
        let kind_raw = effect.kind.or(effect.type_).unwrap_or_default();
        let kind = EffectKind::parse(&kind_raw)
            .ok_or_else(|| format!("unknown effect kind '{kind_raw}'"))?;
        let magnitude = effect
            .magnitude
            .or(effect.value)
            .filter(|m| m.is_finite())
            .ok_or_else(|| "missing effect magnitude".to_string())?;

        let mut tags: Vec<PersonalityTag> = Vec::new();
        for tag in self.tags.iter().filter_map(|t| PersonalityTag::parse(t)) {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        Ok(Choice {
            label,
            tags,
            effect: ChoiceEffect::clamped(kind, magnitude.round() as i64),
            result_text: self.result_text.unwrap_or_default().trim().to_string(),
            sets_flag: self.sets_flag.as_deref().and_then(snake_case_flag),
        })
    }
}

/// Normalise a flag name to snake_case. `None` for empty or "null".
fn snake_case_flag(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut prev_lower = false;
    for c in raw.trim().chars() {
        if c.is_alphanumeric() {
            if c.is_uppercase() && prev_lower {
                out.push('_');
            }
            out.extend(c.to_lowercase());
            prev_lower = c.is_lowercase() || c.is_numeric();
        } else {
            if !out.ends_with('_') && !out.is_empty() {
                out.push('_');
            }
            prev_lower = false;
        }
    }
    let out = out.trim_matches('_').to_string();
    if out.is_empty() || out == "null" || out == "none" {
        None
    } else {
        Some(out)
    }
}

fn parse_review(raw: &str) -> (f64, Option<String>) {
    match parse_json::<ReviewOutput>(raw) {
        Ok(review) => {
            let score = review
                .quality_score
                .filter(|s| s.is_finite())
                .map(|s| s.clamp(0.0, 1.0))
                .unwrap_or(DEFAULT_REVIEW_SCORE);
            (score, review.feedback)
        }
        Err(e) => {
            tracing::debug!(error = %e, "review output unparseable; using default score");
            (DEFAULT_REVIEW_SCORE, None)
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Result of a successful generation.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub artifact: GeneratedArtifact,
    /// Attempts consumed, including the accepted one.
    pub attempts: u32,
    pub feedback: Option<String>,
    /// Accepted under the quality threshold because the budget ran out.
    pub below_threshold: bool,
}

struct ScoredDraft {
    draft: EventDraft,
    score: f64,
    feedback: Option<String>,
}

pub struct Orchestrator {
    gateway: Arc<dyn ChatGateway>,
    artifacts: Arc<dyn ArtifactStore>,
    inspiration: Option<(InspirationCollector, InspirationMode)>,
    config: GeneratorConfig,
}

impl Orchestrator {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        artifacts: Arc<dyn ArtifactStore>,
        config: GeneratorConfig,
    ) -> Self {
        Self {
            gateway,
            artifacts,
            inspiration: None,
            config,
        }
    }

    pub fn with_inspiration(mut self, collector: InspirationCollector, mode: InspirationMode) -> Self {
        self.inspiration = Some((collector, mode));
        self
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Generate, gate, and persist one event for `ctx`.
    pub async fn generate(
        &self,
        ctx: &GenerationContext,
        cancel: Option<&AtomicBool>,
    ) -> Result<GenerationOutcome, GenerationError> {
        check_cancel(cancel)?;

        let inspiration = match &self.inspiration {
            Some((collector, mode)) => collector.for_generation(*mode, ctx).await,
            None => Inspiration::None,
        };

        let max_attempts = self.config.max_attempts();
        let mut best_rejected: Option<ScoredDraft> = None;
        let mut accepted: Option<ScoredDraft> = None;
        let mut last_error = String::from("no attempts made");
        let mut attempts_used = 0;

        for attempt in 1..=max_attempts {
            check_cancel(cancel)?;
            attempts_used = attempt;

            match self.run_attempt(ctx, &inspiration, attempt, cancel).await {
                Ok(scored) => {
                    if scored.score >= self.config.quality_threshold || attempt == max_attempts {
                        accepted = Some(scored);
                        break;
                    }
                    tracing::warn!(
                        condition_key = %ctx.condition_key,
                        attempt,
                        score = scored.score,
                        threshold = self.config.quality_threshold,
                        "quality gate failed; retrying"
                    );
                    last_error = format!("quality score {:.2} below threshold", scored.score);
                    if best_rejected.as_ref().map_or(true, |b| scored.score > b.score) {
                        best_rejected = Some(scored);
                    }
                }
                Err(AttemptFailure::Cancelled) => return Err(GenerationError::Cancelled),
                Err(AttemptFailure::Call { source, .. }) if source.is_fatal() => {
                    tracing::warn!(
                        condition_key = %ctx.condition_key,
                        attempt,
                        error = %source,
                        "fatal model error; aborting generation"
                    );
                    return Err(GenerationError::Provider(source));
                }
                Err(failure) => {
                    tracing::warn!(
                        condition_key = %ctx.condition_key,
                        attempt,
                        error = %failure,
                        "generation attempt failed"
                    );
                    last_error = failure.to_string();
                }
            }
        }

        let chosen = match accepted.or(best_rejected) {
            Some(chosen) => chosen,
            None => {
                return Err(GenerationError::Exhausted {
                    attempts: max_attempts,
                    last_error,
                })
            }
        };
        let artifact = GeneratedArtifact {
            id: new_artifact_id(),
            world_id: ctx.world_id.clone(),
            node_id: ctx.node_id.clone(),
            condition_key: ctx.condition_key.clone(),
            layer: self.config.layer.clone(),
            text: chosen.draft.text,
            locale: self.config.locale.clone(),
            choices: chosen.draft.choices,
            effects: chosen.draft.effects,
            generated_by: self.config.model.clone(),
            quality_score: chosen.score,
            status: ArtifactStatus::Active,
            usage_count: 0,
            created_at: now_epoch(),
        };
        self.artifacts.insert(&artifact).await?;

        let below_threshold = chosen.score < self.config.quality_threshold;
        tracing::info!(
            condition_key = %ctx.condition_key,
            gen_event_id = %artifact.id,
            attempts = attempts_used,
            score = chosen.score,
            below_threshold,
            "event generated"
        );

        Ok(GenerationOutcome {
            artifact,
            attempts: attempts_used,
            feedback: chosen.feedback,
            below_threshold,
        })
    }

    async fn run_attempt(
        &self,
        ctx: &GenerationContext,
        inspiration: &Inspiration,
        attempt: u32,
        cancel: Option<&AtomicBool>,
    ) -> Result<ScoredDraft, AttemptFailure> {
        let plot = self
            .call_stage(ctx, attempt, Stage::Plot, self.plot_prompt(ctx, inspiration))
            .await?;
        if plot.trim().is_empty() {
            return Err(AttemptFailure::Structure("plot stage returned no text".into()));
        }

        if is_cancelled(cancel) {
            return Err(AttemptFailure::Cancelled);
        }
        let written = self
            .call_stage(ctx, attempt, Stage::Writer, self.writer_prompt(&plot))
            .await?;
        let draft = parse_json::<WriterOutput>(&written)
            .map_err(|e| e.to_string())
            .and_then(WriterOutput::normalise)
            .map_err(AttemptFailure::Structure)?;

        if is_cancelled(cancel) {
            return Err(AttemptFailure::Cancelled);
        }
        let review_prompt = self.review_prompt(&draft)?;
        let reviewed = self
            .call_stage(ctx, attempt, Stage::Review, review_prompt)
            .await?;
        let (score, feedback) = parse_review(&reviewed);

        Ok(ScoredDraft {
            draft,
            score,
            feedback,
        })
    }

    async fn call_stage(
        &self,
        ctx: &GenerationContext,
        attempt: u32,
        stage: Stage,
        prompt: PromptInstance,
    ) -> Result<String, AttemptFailure> {
        let mut req = ChatRequest::new(
            ChatModel::openrouter(&self.config.model),
            prompt.to_messages(),
            Attribution::new(stage.caller())
                .with_player(ctx.player_id.clone())
                .with_condition_key(ctx.condition_key.as_str()),
        )
        .temperature(stage.temperature())
        .max_tokens(stage.max_tokens());
        if stage.wants_json() {
            req = req.json();
        }

        let result = self.gateway.chat(req).await;
        self.trace(ctx, attempt, stage, &prompt, &result).await;

        result
            .map(|resp| resp.content)
            .map_err(|source| AttemptFailure::Call { stage, source })
    }

    async fn trace(
        &self,
        ctx: &GenerationContext,
        attempt: u32,
        stage: Stage,
        prompt: &PromptInstance,
        result: &Result<ChatResponse, ProviderError>,
    ) {
        let (raw_output, error, input_tokens, output_tokens, cost, latency_ms) = match result {
            Ok(resp) => (
                resp.content.clone(),
                None,
                resp.input_tokens,
                resp.output_tokens,
                resp.cost_nanodollars,
                resp.latency.as_millis() as u64,
            ),
            Err(e) => (String::new(), Some(e.to_string()), 0, 0, 0, 0),
        };
        let trace = GenerationTrace {
            condition_key: ctx.condition_key.as_str().to_string(),
            attempt,
            stage: stage.as_str(),
            template_slug: prompt.template_slug,
            template_hash: prompt.template_hash.clone(),
            model: self.config.model.clone(),
            raw_output,
            error,
            input_tokens,
            output_tokens,
            cost_nanodollars: cost,
            latency_ms,
        };
        if let Err(e) = self.artifacts.record_trace(trace).await {
            tracing::warn!(stage = stage.as_str(), error = %e, "failed to record generation trace");
        }
    }

    fn plot_prompt(&self, ctx: &GenerationContext, inspiration: &Inspiration) -> PromptInstance {
        let pacing = ctx.pacing();
        let loop_count = ctx.loop_count.to_string();
        let truth_stage = ctx.truth_stage.to_string();
        let traits = or_placeholder(&ctx.traits.join(", "), "none").to_string();
        let flags = or_placeholder(&ctx.flags.join(", "), "none").to_string();
        let play_style = or_placeholder(&ctx.play_style, "unknown");
        let description = or_placeholder(&ctx.node_description, "no description");
        let inspiration = inspiration.render();

        PLOT_V1.render(&[
            ("premise", world_premise()),
            ("world_id", ctx.world_id.as_str()),
            ("node_name", ctx.node_name.as_str()),
            ("node_description", description),
            ("loop_count", loop_count.as_str()),
            ("truth_stage", truth_stage.as_str()),
            ("traits", traits.as_str()),
            ("play_style", play_style),
            ("flags", flags.as_str()),
            ("inspiration", inspiration.as_str()),
            ("pacing_tier", pacing.as_str()),
            ("pacing", pacing.guidance()),
        ])
    }

    fn writer_prompt(&self, plot: &str) -> PromptInstance {
        let vocabulary = PersonalityTag::vocabulary();
        WRITER_V1.render(&[
            ("language", language_name(&self.config.locale)),
            ("plot", plot),
            ("tag_vocabulary", vocabulary.as_str()),
        ])
    }

    fn review_prompt(&self, draft: &EventDraft) -> Result<PromptInstance, AttemptFailure> {
        let event_json = serde_json::to_string_pretty(draft)
            .map_err(|e| AttemptFailure::Structure(format!("cannot serialise draft: {e}")))?;
        let threshold = format!("{:.2}", self.config.quality_threshold);
        Ok(REVIEW_V1.render(&[
            ("threshold", threshold.as_str()),
            ("event_json", event_json.as_str()),
        ]))
    }
}

fn or_placeholder<'a>(value: &'a str, placeholder: &'a str) -> &'a str {
    if value.trim().is_empty() {
        placeholder
    } else {
        value
    }
}

fn is_cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.is_some_and(|c| c.load(Ordering::Relaxed))
}

fn check_cancel(cancel: Option<&AtomicBool>) -> Result<(), GenerationError> {
    if is_cancelled(cancel) {
        Err(GenerationError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer(raw: &str) -> Result<EventDraft, String> {
        parse_json::<WriterOutput>(raw)
            .map_err(|e| e.to_string())
            .and_then(WriterOutput::normalise)
    }

    #[test]
    fn writer_output_with_legacy_aliases() {
        let draft = writer(
            r#"{"text_ja": "The wall says: run.",
                "choices": [
                  {"label": "Trace the letters", "tags": ["curious"], "effect": {"type": "heal", "value": 5}, "result_text": "Cold.", "sets_flag": "read_wall_message"},
                  {"label": "Smash the wall", "tags": ["defiant"], "effect": {"type": "damage", "value": 15}}
                ]}"#,
        )
        .unwrap();
        assert_eq!(draft.text, "The wall says: run.");
        assert_eq!(draft.choices.len(), 2);
        assert_eq!(draft.choices[0].effect.kind, EffectKind::Heal);
        assert_eq!(draft.choices[0].sets_flag.as_deref(), Some("read_wall_message"));
        assert_eq!(draft.choices[1].effect.magnitude, 15);
        assert_eq!(draft.choices[1].result_text, "");
    }

    #[test]
    fn writer_output_is_normalised() {
        let draft = writer(
            r#"```json
{"text": "t", "choices": [
  {"label": "a", "tags": ["Bold", "sneaky", "bold"], "effect": {"kind": "gold", "magnitude": 99}, "sets_flag": "Opened The Door"},
  {"label": "b", "tags": [], "effect": {"kind": "damage", "magnitude": 1}, "sets_flag": "null"},
  {"label": "c", "effect": {"kind": "heal", "magnitude": 7.4}},
  {"label": "d", "effect": {"kind": "heal", "magnitude": 8}},
  {"label": "e", "effect": {"kind": "heal", "magnitude": 9}}
]}
```"#,
        )
        .unwrap();
        assert_eq!(draft.choices.len(), 4);
        assert_eq!(draft.choices[0].tags, vec![PersonalityTag::Bold]);
        assert_eq!(draft.choices[0].effect.magnitude, 20);
        assert_eq!(draft.choices[0].sets_flag.as_deref(), Some("opened_the_door"));
        assert_eq!(draft.choices[1].effect.magnitude, 5);
        assert_eq!(draft.choices[1].sets_flag, None);
        assert_eq!(draft.choices[2].effect.magnitude, 7);
    }

    #[test]
    fn structural_failures() {
        assert!(writer(r#"{"text": "", "choices": []}"#).is_err());
        assert!(writer(r#"{"text": "t", "choices": [{"label": "a", "effect": {"kind": "heal", "magnitude": 5}}]}"#).is_err());
        assert!(writer(
            r#"{"text": "t", "choices": [
                {"label": "a", "effect": {"kind": "curse", "magnitude": 5}},
                {"label": "b", "effect": {"kind": "heal", "magnitude": 5}}]}"#
        )
        .is_err());
        assert!(writer("the model rambled instead").is_err());
    }

    #[test]
    fn attempt_budget_saturates() {
        assert_eq!(GeneratorConfig::default().max_attempts(), 3);
        let config = GeneratorConfig {
            max_retries: u32::MAX,
            ..GeneratorConfig::default()
        };
        assert_eq!(config.max_attempts(), u32::MAX);
    }

    #[test]
    fn review_parsing() {
        assert_eq!(parse_review(r#"{"quality_score": 0.42, "feedback": "flat"}"#).0, 0.42);
        assert_eq!(parse_review(r#"{"score": 1.7}"#).0, 1.0);
        assert_eq!(parse_review("looks fine to me").0, DEFAULT_REVIEW_SCORE);
        assert_eq!(parse_review(r#"{"feedback": "no score"}"#).0, DEFAULT_REVIEW_SCORE);
    }

    #[test]
    fn flag_names_become_snake_case() {
        assert_eq!(snake_case_flag("altarRearranged").as_deref(), Some("altar_rearranged"));
        assert_eq!(snake_case_flag(" read-wall message ").as_deref(), Some("read_wall_message"));
        assert_eq!(snake_case_flag("___"), None);
        assert_eq!(snake_case_flag("None"), None);
    }
}
