//! Inspiration collection: a per-condition-key cache of reference works,
//! filled by a search-augmented research call.
//!
//! Collection failures are never fatal. The caller always gets *some*
//! [`Inspiration`], possibly [`Inspiration::None`].

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::background::BackgroundTasks;
use crate::fingerprint::ConditionKey;
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, ProviderError};
use crate::model::{short_id, GenerationContext, Inspiration, InspirationDocument};
use crate::prompts::{world_premise, RESEARCH_V1};
use crate::store::{now_epoch, InspirationStore, StoreError};

const RESEARCH_TEMPERATURE: f32 = 0.7;
const RESEARCH_MAX_TOKENS: u32 = 4_096;

/// How a cold fingerprint gets its inspiration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InspirationMode {
    /// Collect in the background; the current request goes without.
    #[default]
    Detached,
    /// The first caller waits for collection.
    Inline,
    /// Never collect; only already-cached documents are used.
    Off,
}

impl FromStr for InspirationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "detached" => Ok(Self::Detached),
            "inline" => Ok(Self::Inline),
            "off" | "none" | "disabled" => Ok(Self::Off),
            other => Err(format!(
                "unknown inspiration mode '{other}' (expected detached, inline or off)"
            )),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InspirationError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("research call returned no text")]
    Empty,
}

/// Search keywords per world. Unknown worlds use the medieval set.
pub fn world_keywords(world_id: &str) -> &'static str {
    match world_id {
        "future" => {
            "SF dystopia, tabletop RPG scenario, culture vats, memory erasure, clones"
        }
        _ => "dark fantasy, tabletop RPG scenario, crypt cathedral, time loop, return by death",
    }
}

#[derive(Clone)]
pub struct InspirationCollector {
    gateway: Arc<dyn ChatGateway>,
    store: Arc<dyn InspirationStore>,
    model: String,
    tasks: Arc<BackgroundTasks>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl InspirationCollector {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        store: Arc<dyn InspirationStore>,
        model: impl Into<String>,
        tasks: Arc<BackgroundTasks>,
    ) -> Self {
        Self {
            gateway,
            store,
            model: model.into(),
            tasks,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Inspiration for one generation, honouring `mode` on a cold key.
    pub async fn for_generation(
        &self,
        mode: InspirationMode,
        ctx: &GenerationContext,
    ) -> Inspiration {
        if let Some(cached) = self.cached(&ctx.condition_key).await {
            return cached;
        }
        match mode {
            InspirationMode::Off => Inspiration::None,
            InspirationMode::Inline => {
                self.ensure(
                    &ctx.condition_key,
                    &ctx.world_id,
                    &ctx.node_id,
                    &ctx.node_description,
                )
                .await
            }
            InspirationMode::Detached => {
                self.schedule(
                    &ctx.condition_key,
                    &ctx.world_id,
                    &ctx.node_id,
                    &ctx.node_description,
                );
                Inspiration::None
            }
        }
    }

    /// Cached inspiration, or collect it now. Never fails.
    pub async fn ensure(
        &self,
        key: &ConditionKey,
        world_id: &str,
        node_id: &str,
        node_description: &str,
    ) -> Inspiration {
        if let Some(cached) = self.cached(key).await {
            return cached;
        }
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, key) else {
            tracing::debug!(condition_key = %key, "inspiration already being collected");
            return Inspiration::None;
        };
        match self.collect(key, world_id, node_id, node_description).await {
            Ok(doc) => Inspiration::from_document(&doc),
            Err(e) => {
                tracing::warn!(condition_key = %key, error = %e, "inspiration collection failed");
                Inspiration::None
            }
        }
    }

    /// Start a detached collection unless the key is cached or already in
    /// flight. Returns whether a task was spawned.
    pub fn schedule(
        &self,
        key: &ConditionKey,
        world_id: &str,
        node_id: &str,
        node_description: &str,
    ) -> bool {
        let Some(guard) = InFlightGuard::acquire(&self.in_flight, key) else {
            return false;
        };
        let this = self.clone();
        let key = key.clone();
        let world_id = world_id.to_string();
        let node_id = node_id.to_string();
        let node_description = node_description.to_string();
        self.tasks.spawn("inspiration", async move {
            let _guard = guard;
            if this.cached(&key).await.is_some() {
                return;
            }
            if let Err(e) = this.collect(&key, &world_id, &node_id, &node_description).await {
                tracing::warn!(
                    condition_key = %key,
                    error = %e,
                    "background inspiration collection failed"
                );
            }
        });
        true
    }

    /// Lookup only. Store errors are logged and read as a miss.
    pub async fn cached(&self, key: &ConditionKey) -> Option<Inspiration> {
        match self.store.find_inspiration(key).await {
            Ok(doc) => doc.map(|d| Inspiration::from_document(&d)),
            Err(e) => {
                tracing::warn!(condition_key = %key, error = %e, "inspiration lookup failed");
                None
            }
        }
    }

    async fn collect(
        &self,
        key: &ConditionKey,
        world_id: &str,
        node_id: &str,
        node_description: &str,
    ) -> Result<InspirationDocument, InspirationError> {
        let location = if node_description.trim().is_empty() {
            node_id
        } else {
            node_description
        };
        let prompt = RESEARCH_V1.render(&[
            ("premise", world_premise()),
            ("world_keywords", world_keywords(world_id)),
            ("node_description", location),
        ]);

        let req = ChatRequest::new(
            ChatModel::openrouter(&self.model),
            prompt.to_messages(),
            Attribution::new("inspiration::research").with_condition_key(key.as_str()),
        )
        .temperature(RESEARCH_TEMPERATURE)
        .max_tokens(RESEARCH_MAX_TOKENS)
        .web_search();

        let resp = self.gateway.chat(req).await?;
        if resp.content.trim().is_empty() {
            return Err(InspirationError::Empty);
        }

        let doc = InspirationDocument {
            doc_id: short_id("insp_"),
            condition_key: key.clone(),
            world_id: world_id.to_string(),
            node_id: node_id.to_string(),
            raw: resp.content,
            created_at: now_epoch(),
        };

        if self.store.insert_inspiration(&doc).await? {
            tracing::info!(
                condition_key = %key,
                doc_id = %doc.doc_id,
                sources = doc.sources().len(),
                "inspiration collected"
            );
            Ok(doc)
        } else {
            // Lost a race with another process; the stored document wins.
            Ok(self.store.find_inspiration(key).await?.unwrap_or(doc))
        }
    }
}

/// Marks a key as being collected; released on drop.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<String>>>, key: &ConditionKey) -> Option<Self> {
        let mut guard = set.lock().unwrap_or_else(|p| p.into_inner());
        if !guard.insert(key.as_str().to_string()) {
            return None;
        }
        Some(Self {
            set: Arc::clone(set),
            key: key.as_str().to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut guard = self.set.lock().unwrap_or_else(|p| p.into_inner());
        guard.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_parse() {
        assert_eq!("Inline".parse::<InspirationMode>(), Ok(InspirationMode::Inline));
        assert_eq!("off".parse::<InspirationMode>(), Ok(InspirationMode::Off));
        assert!("sometimes".parse::<InspirationMode>().is_err());
        assert_eq!(InspirationMode::default(), InspirationMode::Detached);
    }

    #[test]
    fn unknown_worlds_fall_back_to_medieval() {
        assert_eq!(world_keywords("atlantis"), world_keywords("medieval"));
        assert_ne!(world_keywords("future"), world_keywords("medieval"));
    }

    #[test]
    fn in_flight_guard_is_exclusive_until_dropped() {
        let set = Arc::new(Mutex::new(HashSet::new()));
        let key = ConditionKey::from_raw("k");
        let first = InFlightGuard::acquire(&set, &key);
        assert!(first.is_some());
        assert!(InFlightGuard::acquire(&set, &key).is_none());
        drop(first);
        assert!(InFlightGuard::acquire(&set, &key).is_some());
    }
}
