use axum::{body::Bytes, extract::State, http::StatusCode, Json};
use serde::Serialize;
use tlm_core::{stats::StatsSnapshot, Ingestor};
use tracing::{debug, warn};

use crate::error::ApiError;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) ingestor: Ingestor,
    pub(crate) retry_after_secs: u64,
}

#[derive(Serialize, Debug)]
pub(crate) struct Accepted {
    status: &'static str,
    ids: Vec<u64>,
}

/// Takes one event object or an array of them.
pub(crate) async fn post_events(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let batch = state.ingestor.submit_batch(&body).await.map_err(|e| {
        debug!("rejected request body, {e}");
        e
    })?;
    let ids: Vec<u64> = batch.accepted.iter().map(|receipt| receipt.id).collect();
    if let Some(source) = batch.overloaded {
        warn!(
            "accepted {} of {} events before overload, {source}",
            ids.len(),
            batch.total
        );
        return Err(ApiError::Overloaded {
            source,
            accepted: ids,
            total: batch.total,
            retry_after_secs: state.retry_after_secs,
        });
    }
    debug!("accepted {} events", ids.len());
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            status: "accepted",
            ids,
        }),
    ))
}

pub(crate) async fn health(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.ingestor.pipeline().is_healthy() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "downstream unavailable")
    }
}

pub(crate) async fn stats(State(state): State<AppState>) -> Json<StatsSnapshot> {
    Json(state.ingestor.pipeline().stats())
}
