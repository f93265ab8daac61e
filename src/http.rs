//! Diagnostics HTTP endpoint: read-only views of the job table, summary
//! eligibility and recent delivery attempts.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

use emojournal_scheduler::ScheduleService;

pub struct AppState {
    pub service: Arc<ScheduleService>,
    pub start_time: Instant,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeliveryQuery {
    pub user_id: Option<i64>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/jobs", get(list_jobs))
        .route("/summary/due", get(summary_due))
        .route("/deliveries", get(deliveries))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr` and serve until the listener fails.
pub async fn serve(addr: &str, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("🌐 Diagnostics listening on http://{}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "emojournal",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let scheduler = state.service.scheduler();
    Json(serde_json::json!({
        "stats": scheduler.stats(),
        "jobs": scheduler.jobs(),
    }))
}

async fn summary_due(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.service.get_users_due_for_summary().await {
        Ok(users) => (StatusCode::OK, Json(serde_json::json!({ "users": users }))),
        Err(e) => {
            tracing::error!("❌ Summary diagnostics failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
        }
    }
}

async fn deliveries(State(state): State<Arc<AppState>>, Query(query): Query<DeliveryQuery>) -> Json<serde_json::Value> {
    let log = state.service.delivery_log();
    let attempts = match query.user_id {
        Some(user_id) => log.for_user(user_id),
        None => log.history(),
    };
    Json(serde_json::json!({ "count": attempts.len(), "attempts": attempts }))
}
