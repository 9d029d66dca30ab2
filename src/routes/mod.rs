mod health;
mod index;
mod labels;
mod metrics;
mod predict;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/", get(index::index))
        .route("/predict", post(predict::predict_page))
        .route("/api/predict", post(predict::predict_api))
        .route("/api/labels", get(labels::labels))
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
}
