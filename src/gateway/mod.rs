//! Provider gateway for chat completions.

pub mod error;
pub mod openrouter;
pub mod pricing;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use openrouter::{ChatProvider, OpenRouterAdapter};
use usage::{CallStatus, ProviderCallRecord};

pub use error::{ErrorContext, ProviderError};
pub use pricing::{chat_cost, get_pricing, nanos_to_usd, ModelPricing};
pub use types::*;
pub use usage::{NoopUsageSink, UsageSink};

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Transport-level retries for retryable errors. Zero by default: the
    /// orchestrator owns the attempt budget for generation.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Refuse new calls once today's recorded spend reaches this many USD.
    pub daily_budget_usd: Option<f64>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_base_delay: Duration::from_secs(1),
            daily_budget_usd: None,
        }
    }
}

pub struct ProviderGateway<U: UsageSink> {
    openrouter: OpenRouterAdapter,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<U: UsageSink> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<U: UsageSink> ProviderGateway<U> {
    pub fn with_config(
        openrouter: OpenRouterAdapter,
        usage_sink: Arc<U>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            openrouter,
            usage_sink,
            config,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.check_budget().await?;

        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..=self.config.max_retries {
            match self.openrouter.chat(&req).await {
                Ok(resp) => {
                    self.record_usage(&req, &resp, CallStatus::Success, None)
                        .await;
                    return Ok(resp);
                }
                Err(err) => {
                    let code = err.code().to_string();
                    let mut failed = ChatResponse::empty();
                    failed.request_id = err.request_id().map(str::to_string);
                    self.record_usage(&req, &failed, CallStatus::Error, Some(code))
                        .await;

                    if !err.is_retryable() || attempt == self.config.max_retries {
                        return Err(err);
                    }

                    let delay = match &err {
                        ProviderError::RateLimited { retry_after, .. } => {
                            (*retry_after).min(backoff_delay(self.config.retry_base_delay, 5))
                        }
                        _ => backoff_delay(self.config.retry_base_delay, attempt),
                    };
                    tracing::warn!(
                        caller = req.attribution.caller,
                        attempt = attempt + 1,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "retrying provider call"
                    );
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ProviderError::provider("openrouter", "unknown error", false)))
    }

    async fn check_budget(&self) -> Result<(), ProviderError> {
        let Some(limit) = self.config.daily_budget_usd else {
            return Ok(());
        };
        if let Some(spend) = self.usage_sink.daily_spend_usd().await {
            if spend >= limit {
                tracing::warn!(spend_usd = spend, limit_usd = limit, "daily budget exhausted");
                return Err(ProviderError::budget_exceeded(limit, spend));
            }
        }
        Ok(())
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        resp: &ChatResponse,
        status: CallStatus,
        error_code: Option<String>,
    ) {
        let record = ProviderCallRecord::new(
            req.model.provider(),
            "chat/completions",
            req.model.model_id(),
            req.attribution.caller,
        )
        .tokens(resp.input_tokens as i32, resp.output_tokens as i32)
        .cost(resp.cost_nanodollars)
        .upstream_cost(resp.upstream_cost_nanodollars)
        .player(req.attribution.player_id.clone())
        .condition_key(req.attribution.condition_key.clone())
        .request_id(resp.request_id.clone())
        .latency(resp.latency.as_millis() as i32);

        let record = if status == CallStatus::Error {
            record.error(error_code.unwrap_or_else(|| "provider_error".to_string()))
        } else {
            record
        };

        self.usage_sink.record(record).await;
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u64.pow(attempt.min(5));
    base * multiplier as u32
}
