//! Builds the runtime graph (store, gateway, collector, orchestrator,
//! resolver) from a [`ResidueConfig`].

use std::sync::Arc;
use std::time::Duration;

use crate::background::BackgroundTasks;
use crate::config::{ConfigError, ResidueConfig};
use crate::gateway::openrouter::OpenRouterAdapter;
use crate::gateway::{ChatGateway, GatewayConfig, ProviderError, ProviderGateway};
use crate::inspiration::InspirationCollector;
use crate::orchestrator::Orchestrator;
use crate::resolver::Resolver;
use crate::store::{SqliteStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

pub struct App {
    pub config: ResidueConfig,
    pub store: Arc<SqliteStore>,
    pub resolver: Arc<Resolver>,
    pub tasks: Arc<BackgroundTasks>,
}

impl App {
    /// Open the configured store and wire everything around it.
    pub fn open(config: ResidueConfig) -> Result<Self, AppError> {
        let store = SqliteStore::new(&config.store_path)?;
        Self::with_store(config, Arc::new(store))
    }

    pub fn with_store(config: ResidueConfig, store: Arc<SqliteStore>) -> Result<Self, AppError> {
        config.validate()?;
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| ConfigError::Invalid("api_key is required (RESIDUE_API_KEY)".into()))?;

        let adapter = OpenRouterAdapter::with_config(
            api_key,
            config.model_endpoint.clone(),
            Duration::from_secs(config.request_timeout_secs),
            config.referer.clone(),
            config.app_title.clone(),
        )?;
        let gateway: Arc<dyn ChatGateway> = Arc::new(ProviderGateway::with_config(
            adapter,
            Arc::clone(&store),
            GatewayConfig {
                daily_budget_usd: config.daily_budget_usd,
                ..GatewayConfig::default()
            },
        ));

        let tasks = Arc::new(BackgroundTasks::new());
        let collector = InspirationCollector::new(
            Arc::clone(&gateway),
            store.clone(),
            config.research_model(),
            Arc::clone(&tasks),
        );
        let orchestrator = Orchestrator::new(gateway, store.clone(), config.generator())
            .with_inspiration(collector, config.inspiration_mode);
        let resolver = Resolver::new(store.clone(), store.clone(), Arc::new(orchestrator))
            .require_known_node(config.require_known_node);

        Ok(Self {
            config,
            store,
            resolver: Arc::new(resolver),
            tasks,
        })
    }
}
