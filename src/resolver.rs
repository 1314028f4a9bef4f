//! Entry point: fingerprint the player's situation, serve a cached event if
//! one exists, otherwise generate, persist and return a fresh one.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::fingerprint::ConditionKey;
use crate::model::{GenerationContext, ResolvedEvent};
use crate::orchestrator::{GenerationError, Orchestrator};
use crate::store::{ArtifactStore, StoreError, WorldDirectory};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unknown node {world_id}/{node_id}")]
    UnknownNode { world_id: String, node_id: String },
    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ResolveError {
    /// HTTP status for this error on the inbound surface.
    pub fn status_code(&self) -> u16 {
        match self {
            ResolveError::InvalidInput(_) => 400,
            ResolveError::UnknownNode { .. } => 404,
            ResolveError::Generation(_) | ResolveError::Store(_) => 500,
        }
    }
}

/// One resolve call. Lists keep caller order; only the key builder sorts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolveRequest {
    pub world_id: String,
    pub node_id: String,
    pub player_id: Option<String>,
    pub truth_stage: i64,
    pub traits: Vec<String>,
    pub flags: Vec<String>,
}

impl ResolveRequest {
    pub fn new(world_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            world_id: world_id.into(),
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    pub fn player(mut self, player_id: impl Into<String>) -> Self {
        self.player_id = Some(player_id.into());
        self
    }

    pub fn truth_stage(mut self, stage: i64) -> Self {
        self.truth_stage = stage;
        self
    }

    pub fn traits<S: AsRef<str>>(mut self, traits: &[S]) -> Self {
        self.traits = clean_list(traits.iter().map(|t| t.as_ref()));
        self
    }

    pub fn flags<S: AsRef<str>>(mut self, flags: &[S]) -> Self {
        self.flags = clean_list(flags.iter().map(|f| f.as_ref()));
        self
    }

    /// Build from raw query-string values: comma-separated lists and a
    /// decimal truth stage (missing or empty means 0).
    pub fn from_query(
        world_id: Option<&str>,
        node_id: Option<&str>,
        player_id: Option<&str>,
        truth_stage: Option<&str>,
        traits: Option<&str>,
        flags: Option<&str>,
    ) -> Result<Self, ResolveError> {
        let truth_stage = match truth_stage.map(str::trim).filter(|s| !s.is_empty()) {
            None => 0,
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                ResolveError::InvalidInput(format!("truth_stage must be an integer, got '{raw}'"))
            })?,
        };
        Ok(Self {
            world_id: world_id.unwrap_or_default().trim().to_string(),
            node_id: node_id.unwrap_or_default().trim().to_string(),
            player_id: player_id
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            truth_stage,
            traits: split_list(traits.unwrap_or_default()),
            flags: split_list(flags.unwrap_or_default()),
        })
    }

    pub fn condition_key(&self) -> ConditionKey {
        let top_trait = self.traits.first().map(String::as_str).unwrap_or("");
        ConditionKey::build(
            &self.world_id,
            &self.node_id,
            self.truth_stage,
            top_trait,
            &self.flags,
        )
    }

    fn validate(&self) -> Result<(), ResolveError> {
        if self.world_id.trim().is_empty() || self.node_id.trim().is_empty() {
            return Err(ResolveError::InvalidInput(
                "world_id and node_id required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Split a comma-separated list, dropping empty entries.
pub fn split_list(raw: &str) -> Vec<String> {
    clean_list(raw.split(','))
}

fn clean_list<'a>(items: impl Iterator<Item = &'a str>) -> Vec<String> {
    items
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub struct Resolver {
    artifacts: Arc<dyn ArtifactStore>,
    directory: Arc<dyn WorldDirectory>,
    orchestrator: Arc<Orchestrator>,
    require_known_node: bool,
}

impl Resolver {
    pub fn new(
        artifacts: Arc<dyn ArtifactStore>,
        directory: Arc<dyn WorldDirectory>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            artifacts,
            directory,
            orchestrator,
            require_known_node: false,
        }
    }

    /// Reject nodes missing from the directory instead of generating for them.
    pub fn require_known_node(mut self, require: bool) -> Self {
        self.require_known_node = require;
        self
    }

    pub async fn resolve(
        &self,
        req: &ResolveRequest,
        cancel: Option<&AtomicBool>,
    ) -> Result<ResolvedEvent, ResolveError> {
        req.validate()?;
        let key = req.condition_key();

        if let Some(artifact) = self.artifacts.find_best(&key).await? {
            if let Err(e) = self.artifacts.record_hit(&artifact.id).await {
                tracing::warn!(
                    condition_key = %key,
                    gen_event_id = %artifact.id,
                    error = %e,
                    "failed to record cache hit"
                );
            }
            tracing::debug!(condition_key = %key, gen_event_id = %artifact.id, "cache hit");
            return Ok(ResolvedEvent::from_artifact(artifact, true));
        }

        tracing::info!(condition_key = %key, "cache miss; generating");
        let ctx = self.context_for(req, key).await?;
        let outcome = self.orchestrator.generate(&ctx, cancel).await?;
        Ok(ResolvedEvent::from_artifact(outcome.artifact, false))
    }

    async fn context_for(
        &self,
        req: &ResolveRequest,
        key: ConditionKey,
    ) -> Result<GenerationContext, ResolveError> {
        let node = self.directory.node(&req.world_id, &req.node_id).await?;
        if node.is_none() && self.require_known_node {
            return Err(ResolveError::UnknownNode {
                world_id: req.world_id.clone(),
                node_id: req.node_id.clone(),
            });
        }

        let profile = match req.player_id.as_deref() {
            Some(player_id) => self.directory.profile(player_id).await?,
            None => None,
        };

        let (node_name, node_description) = match node {
            Some(n) if !n.name.trim().is_empty() => (n.name, n.description),
            Some(n) => (req.node_id.clone(), n.description),
            None => (req.node_id.clone(), String::new()),
        };

        let (loop_count, play_style) = match profile {
            Some(p) => (p.total_runs.max(1), p.play_style.unwrap_or_default()),
            None => (1, String::new()),
        };

        Ok(GenerationContext {
            world_id: req.world_id.clone(),
            node_id: req.node_id.clone(),
            node_name,
            node_description,
            truth_stage: req.truth_stage,
            loop_count,
            traits: req.traits.clone(),
            play_style,
            flags: req.flags.clone(),
            player_id: req.player_id.clone(),
            condition_key: key,
        })
    }
}
