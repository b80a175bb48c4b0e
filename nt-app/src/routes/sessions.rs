use crate::server::AgentState;
use axum::routing::get;
use axum::{Extension, Json};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/agent/sessions", get(list_sessions))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_sessions(Extension(state): Extension<Arc<AgentState>>) -> Json<serde_json::Value> {
    let sessions = state.agent.sessions().list();
    Json(serde_json::json!({ "sessions": sessions }))
}
