#![forbid(unsafe_code)]

//! # residue-events
//!
//! Cache-first event generation for the Residue roguelike.
//!
//! A player's situation (world, node, truth stage, dominant trait, flags) is
//! reduced to a [`ConditionKey`]. Events are stored under that key and reused
//! across players. On a miss, a three-stage chain (plot, writer, review)
//! drafts a new event, gated by a quality score with a bounded number of
//! attempts, and seeded by a per-key cache of researched reference works.

pub mod app;
pub mod background;
pub mod config;
pub mod extract;
pub mod fingerprint;
pub mod gateway;
pub mod inspiration;
pub mod model;
pub mod orchestrator;
pub mod prompts;
pub mod resolver;
pub mod server;
pub mod store;
pub mod telemetry;

pub use app::{App, AppError};
pub use background::BackgroundTasks;
pub use config::{ConfigError, ResidueConfig};
pub use fingerprint::ConditionKey;
pub use gateway::{Attribution, ChatGateway, ProviderGateway, UsageSink};
pub use inspiration::{InspirationCollector, InspirationMode};
pub use model::{Choice, ChoiceEffect, EffectKind, GeneratedArtifact, PersonalityTag, ResolvedEvent};
pub use orchestrator::{GenerationError, GenerationOutcome, GeneratorConfig, Orchestrator};
pub use resolver::{ResolveError, ResolveRequest, Resolver};
pub use store::{ArtifactStore, InspirationStore, SqliteStore, StoreError, WorldDirectory};
