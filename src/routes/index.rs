use crate::{server::SharedState, views::index_page};
use axum::{extract::State, response::Html};

pub async fn index(State(state): State<SharedState>) -> Html<String> {
    state.metrics.record_request("/");
    Html(index_page(None))
}
