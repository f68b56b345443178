use std::{collections::HashMap, sync::Arc};

use crate::{
    dto::{BoardDto, ErrorDto},
    state::AppState,
};
use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use tracing::error;

/// Board for `stop`, or the configured stop when absent. Stale boards are
/// still a success; only a board that cannot be produced at all is a 503.
pub async fn arrivals(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, Response> {
    let result = match params.get("stop").filter(|stop| !stop.is_empty()) {
        Some(stop) => state.provider.arrivals_for(stop).await,
        None => state.provider.arrivals().await,
    };
    match result {
        Ok(board) => Ok(Json(BoardDto::from(&board, Utc::now())).into_response()),
        Err(err) => {
            error!("Arrivals request failed: {err}");
            Err((StatusCode::SERVICE_UNAVAILABLE, Json(ErrorDto::from(&err))).into_response())
        }
    }
}
