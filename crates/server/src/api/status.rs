use std::sync::Arc;

use crate::state::AppState;
use axum::{
    Json,
    extract::State,
    response::{IntoResponse, Response},
};
use bsds::config::Mode;

pub async fn status(State(state): State<Arc<AppState>>) -> Response {
    if state.provider.mode() == Mode::Mint {
        state.provider.check_predictor().await;
    }
    Json(state.provider.status().await).into_response()
}
