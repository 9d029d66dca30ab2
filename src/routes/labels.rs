use crate::{server::SharedState, state::LabelEntry};
use axum::{extract::State, Json};

pub async fn labels(State(state): State<SharedState>) -> Json<Vec<LabelEntry>> {
    Json(state.service_state.label_entries())
}
