//! Cron endpoint.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use outbox_core::{Cron, NewCron};
use serde::Serialize;
use tracing::instrument;

use super::messages::MessageResponse;
use crate::{error::ApiResult, AppState};

/// A created cron with the first message of its chain.
#[derive(Debug, Serialize)]
pub struct CronResponse {
    /// The stored cron.
    #[serde(flatten)]
    pub cron: Cron,
    /// First scheduled message.
    pub first_message: MessageResponse,
}

/// `POST /crons`
///
/// An expression that does not parse, or never fires again, is rejected
/// with 400 and nothing is stored.
#[instrument(name = "create_cron", skip(state, payload))]
pub async fn create_cron(
    State(state): State<AppState>,
    payload: Result<Json<NewCron>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<CronResponse>)> {
    let Json(input) = payload?;
    let (cron, first) = state.service.create_cron(input).await?;
    Ok((StatusCode::CREATED, Json(CronResponse { cron, first_message: first.into() })))
}
