//! Message endpoints.

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    Json,
};
use outbox_core::{Message, MessageId, MessageStatus, NewMessage};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{error::ApiResult, AppState};

/// A single message or a batch; batches are stored atomically.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EnqueueRequest {
    /// Several messages.
    Batch(Vec<NewMessage>),
    /// One message.
    Single(NewMessage),
}

impl EnqueueRequest {
    fn into_messages(self) -> Vec<NewMessage> {
        match self {
            Self::Batch(messages) => messages,
            Self::Single(message) => vec![message],
        }
    }
}

/// A message with its derived status.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    /// The stored message.
    #[serde(flatten)]
    pub message: Message,
    /// Pending, delivered or failed.
    pub status: MessageStatus,
}

impl From<Message> for MessageResponse {
    fn from(message: Message) -> Self {
        let status = message.status();
        Self { message, status }
    }
}

/// `POST /messages`
#[instrument(name = "enqueue_messages", skip(state, payload))]
pub async fn enqueue_messages(
    State(state): State<AppState>,
    payload: Result<Json<EnqueueRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Vec<MessageResponse>>)> {
    let Json(request) = payload?;
    let messages = state.service.enqueue(request.into_messages()).await?;
    info!(count = messages.len(), "messages accepted");
    Ok((StatusCode::CREATED, Json(messages.into_iter().map(MessageResponse::from).collect())))
}

/// `GET /messages/{id}`
#[instrument(name = "get_message", skip(state, id))]
pub async fn get_message(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<MessageResponse>> {
    let Path(id) = id?;
    let message = state.service.find_message(MessageId::from(id)).await?;
    Ok(Json(message.into()))
}
