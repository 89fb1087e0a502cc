//! Queue endpoints.

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use outbox_core::{NewQueue, Queue, QueueId};
use serde::Deserialize;
use tracing::instrument;
use uuid::Uuid;

use super::messages::MessageResponse;
use crate::{error::ApiResult, AppState};

/// Messages returned when no `limit` is given.
const DEFAULT_LIST_LIMIT: usize = 100;

/// Query parameters for listing messages.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    /// Maximum number of messages to return.
    pub limit: Option<usize>,
}

/// `POST /queues`
#[instrument(name = "create_queue", skip(state, payload))]
pub async fn create_queue(
    State(state): State<AppState>,
    payload: Result<Json<NewQueue>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Queue>)> {
    let Json(input) = payload?;
    let queue = state.service.create_queue(input).await?;
    Ok((StatusCode::CREATED, Json(queue)))
}

/// `GET /queues/{id}`
#[instrument(name = "get_queue", skip(state, id))]
pub async fn get_queue(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<Queue>> {
    let Path(id) = id?;
    Ok(Json(state.service.find_queue(QueueId::from(id)).await?))
}

/// `GET /queues/{id}/messages?limit=`
#[instrument(name = "list_queue_messages", skip(state, id, params))]
pub async fn list_queue_messages(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> ApiResult<Json<Vec<MessageResponse>>> {
    let Path(id) = id?;
    let Query(params) = params?;
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT);

    let messages = state.service.messages_for_queue(QueueId::from(id), limit).await?;
    Ok(Json(messages.into_iter().map(MessageResponse::from).collect()))
}
