//! Inbound HTTP surface for the resolver.

use std::future::Future;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::background::BackgroundTasks;
use crate::model::ResolvedEvent;
use crate::resolver::{ResolveError, ResolveRequest, Resolver};

#[derive(Clone)]
struct ServerState {
    resolver: Arc<Resolver>,
}

/// Raw query string of a resolve call. Everything arrives as text and is
/// validated by [`ResolveRequest::from_query`].
#[derive(Debug, Default, Deserialize)]
pub struct ResolveQuery {
    pub world_id: Option<String>,
    pub node_id: Option<String>,
    pub player_id: Option<String>,
    pub truth_stage: Option<String>,
    pub traits: Option<String>,
    pub flags: Option<String>,
}

impl ResolveQuery {
    pub fn into_request(self) -> Result<ResolveRequest, ResolveError> {
        ResolveRequest::from_query(
            self.world_id.as_deref(),
            self.node_id.as_deref(),
            self.player_id.as_deref(),
            self.truth_stage.as_deref(),
            self.traits.as_deref(),
            self.flags.as_deref(),
        )
    }
}

pub fn router(resolver: Arc<Resolver>) -> Router {
    Router::new()
        .route("/api/v1/events/resolve", get(resolve_event))
        .route("/api/health", get(health))
        .with_state(ServerState { resolver })
}

/// Serve until `shutdown` resolves, then wait for detached background work.
pub async fn serve<F>(
    listener: TcpListener,
    resolver: Arc<Resolver>,
    tasks: Arc<BackgroundTasks>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "listening");
    }
    let result = axum::serve(listener, router(resolver))
        .with_graceful_shutdown(shutdown)
        .await;
    tasks.drain().await;
    result
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn resolve_event(
    State(state): State<ServerState>,
    Query(query): Query<ResolveQuery>,
) -> Result<Json<ResolvedEvent>, (StatusCode, Json<Value>)> {
    let req = query.into_request().map_err(error_response)?;
    // A dropped connection drops this future, which cancels in-flight calls.
    state
        .resolver
        .resolve(&req, None)
        .await
        .map(Json)
        .map_err(error_response)
}

fn error_response(err: ResolveError) -> (StatusCode, Json<Value>) {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = match &err {
        ResolveError::InvalidInput(message) => json!({ "error": message }),
        ResolveError::UnknownNode { .. } => json!({
            "error": "Unknown node",
            "detail": err.to_string(),
        }),
        ResolveError::Generation(_) => {
            tracing::error!(error = %err, "resolve failed");
            json!({
                "error": "Generation failed",
                "detail": err.to_string(),
            })
        }
        ResolveError::Store(_) => {
            tracing::error!(error = %err, "store unavailable");
            json!({
                "error": "Store unavailable",
                "detail": err.to_string(),
            })
        }
    };
    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;

    #[test]
    fn error_bodies_follow_status() {
        let (status, Json(body)) =
            error_response(ResolveError::InvalidInput("world_id and node_id required".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "world_id and node_id required");
        assert!(body.get("detail").is_none());

        let (status, Json(body)) = error_response(ResolveError::UnknownNode {
            world_id: "medieval".into(),
            node_id: "nowhere".into(),
        });
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["detail"], "unknown node medieval/nowhere");

        let (status, Json(body)) = error_response(ResolveError::Store(StoreError::Closed));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Store unavailable");
        assert_eq!(body["detail"], "store error: store is shut down");
    }

    #[test]
    fn query_converts_to_request() {
        let query = ResolveQuery {
            world_id: Some("future".into()),
            node_id: Some("lab_03".into()),
            truth_stage: Some("1".into()),
            flags: Some("met_clone".into()),
            ..Default::default()
        };
        let req = query.into_request().unwrap();
        assert_eq!(req.condition_key().as_str(), "future:lab_03:ts1:t_none:f_met_clone");
    }
}
