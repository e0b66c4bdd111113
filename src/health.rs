//! # Health Check
//!
//! Liveness endpoint for load balancers and operators. Reports uptime, the
//! upstream model in use, stream capacity, and the recognition counters
//! (how often streaming failed and how often REST had to step in).

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /health` and `GET /api/v1/health`.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = &state.config;
    let stats = state.asr.stats();
    let active_streams = state.active_streams();
    let max_streams = config.performance.max_concurrent_sessions;

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "asr": {
            "model": config.asr.model,
            "streaming_configured": !config.asr.websocket_base().is_empty(),
            "recognitions": stats.recognitions,
            "stream_failures": stats.stream_failures,
            "rest_fallbacks": stats.rest_fallbacks,
            "fallback_failures": stats.fallback_failures
        },
        "system": load_status(active_streams, max_streams)
    }))
}

fn load_status(active: usize, max: usize) -> serde_json::Value {
    let usage = if max > 0 { active as f64 / max as f64 } else { 0.0 };

    let status = if usage > 0.9 {
        "high_load"
    } else if usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (usage * 100.0).round(),
        "max_sessions": max,
        "current_sessions": active
    })
}
