//! Router configuration for the realtime supervision API

use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers;
use crate::stream;
use crate::AppState;

/// Create the main router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Service health
        .route("/health", get(handlers::health))
        // Realtime ingest
        .route("/api/realtime/events", post(handlers::ingest_event))
        .route("/api/realtime/audio/chunk", post(handlers::ingest_audio_chunk))
        // Call views
        .route(
            "/api/realtime/calls/:call_id/snapshot",
            get(handlers::call_snapshot),
        )
        .route("/api/realtime/calls/:call_id/audio", get(handlers::call_audio))
        .route(
            "/api/realtime/calls/:call_id/audio/meta",
            get(handlers::call_audio_meta),
        )
        // Alerts
        .route("/api/realtime/alerts", get(handlers::list_alerts))
        .route("/api/realtime/alerts/:alert_id/ack", post(handlers::ack_alert))
        // Live stream
        .route("/api/realtime/stream", get(stream::stream_handler))
        // Worker health probes
        .route(
            "/api/integrations/genesys/health",
            get(handlers::genesys_connector_health),
        )
        .route(
            "/api/integrations/genesys/audiohook/health",
            get(handlers::genesys_audiohook_health),
        )
        .with_state(state)
}
