use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::state::AppState;

/// Liveness probe; also reports which optional config sections are wired.
pub async fn health_handler(state: web::Data<AppState>) -> HttpResponse {
    let config = state.config().current();
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "discovery": config.discovery_consul().is_some(),
    }))
}

pub async fn metrics_handler(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(state.telemetry().render_metrics())
}
