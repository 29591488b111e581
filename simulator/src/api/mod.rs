use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::Simulator;

mod http;
mod ws;

pub struct Api {
    simulator: Arc<Simulator>,
}

impl Api {
    pub fn new(simulator: Arc<Simulator>) -> Self {
        Self { simulator }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(http::healthz))
            .route("/mxe", get(http::mxe_key))
            .route("/submit", post(http::submit))
            .route("/round/:handle", get(http::query_round))
            .route("/computation/:offset/status", get(http::computation_status))
            .route("/log/:handle", get(http::scan_log))
            .route("/events/:round_id", get(ws::events_ws))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.simulator.clone())
    }
}
