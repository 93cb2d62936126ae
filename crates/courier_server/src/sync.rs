/* Copyright 2026- The Courier team. All rights reserved.
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *     http://www.apache.org/licenses/LICENSE-2.0
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The sync and receipt HTTP surface.
//!
//! Inbox/outbox pagination reads straight from the message store with
//! monotonic-id cursors; the receipt endpoints perform the
//! recipient-scoped marks and push receipt frames back to the original
//! sender's session when one is online.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Query, State};
use axum::response::Json;
use serde_derive::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use utoipa::ToSchema;

use courier_core::envelope::EnvelopeKind;
use courier_core::messaging::{Cursor, MessageQuery, StoredMessage, DEFAULT_QUERY_LIMIT};

use crate::auth::AuthedUser;
use crate::error::ApiError;
use crate::AppState;

/// Raw, unvalidated query parameters for the list endpoints. Values are
/// kept as strings so validation failures map to 400 rather than an axum
/// rejection.
#[derive(Deserialize, Debug, Default)]
pub struct ListParams {
    limit: Option<String>,
    before_id: Option<String>,
    after_id: Option<String>,
    with_user_id: Option<String>,
    unread_only: Option<String>,
}

impl ListParams {
    /// Validate into a [`MessageQuery`]. Every present parameter must
    /// parse and be positive; the two cursors are mutually exclusive;
    /// `unread_only` is only recognized where the caller says it is.
    fn into_query(self, allow_unread: bool) -> Result<MessageQuery, ApiError> {
        let limit = match self.limit.as_deref() {
            None => DEFAULT_QUERY_LIMIT,
            Some(raw) => positive_i64(raw).ok_or_else(|| invalid("limit"))?,
        };
        let before_id = self
            .before_id
            .as_deref()
            .map(|raw| positive_i64(raw).ok_or_else(|| invalid("before_id")))
            .transpose()?;
        let after_id = self
            .after_id
            .as_deref()
            .map(|raw| positive_i64(raw).ok_or_else(|| invalid("after_id")))
            .transpose()?;
        let with_user_id = self
            .with_user_id
            .as_deref()
            .map(|raw| positive_i64(raw).ok_or_else(|| invalid("with_user_id")))
            .transpose()?;

        let cursor = match (before_id, after_id) {
            (Some(_), Some(_)) => {
                return Err(ApiError::Validation(
                    "before_id and after_id cannot be combined".to_string(),
                ))
            }
            (Some(id), None) => Some(Cursor::Before(id)),
            (None, Some(id)) => Some(Cursor::After(id)),
            (None, None) => None,
        };

        let unread_only = match self.unread_only.as_deref() {
            None => false,
            Some(_) if !allow_unread => return Err(invalid("unread_only")),
            Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            Some(_) => return Err(invalid("unread_only")),
        };

        Ok(MessageQuery {
            limit,
            cursor,
            with_user_id,
            unread_only,
        })
    }
}

fn positive_i64(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok().filter(|v| *v > 0)
}

fn invalid(param: &str) -> ApiError {
    ApiError::Validation(format!("invalid {param}"))
}

/// GET `/api/messages/inbox`: page the caller's inbox.
///
/// Parameters: `limit`, `before_id` or `after_id` (exclusive cursors over
/// the message id), `with_user_id`, `unread_only`.
#[utoipa::path(
    get,
    path = "/api/messages/inbox",
    responses(
        (status = 200, description = "OK", body = [StoredMessage]),
        (status = 400, description = "invalid parameters"),
        (status = 401, description = "missing or invalid bearer token")
    ),
)]
pub async fn get_inbox(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<StoredMessage>>, ApiError> {
    let query = params.into_query(true)?;
    let page = state.store.list_inbox(user.user_id, &query).await?;
    Ok(Json(page))
}

/// GET `/api/messages/outbox`: page the caller's sent messages.
///
/// Same parameters as the inbox, minus `unread_only`.
#[utoipa::path(
    get,
    path = "/api/messages/outbox",
    responses(
        (status = 200, description = "OK", body = [StoredMessage]),
        (status = 400, description = "invalid parameters"),
        (status = 401, description = "missing or invalid bearer token")
    ),
)]
pub async fn get_outbox(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<StoredMessage>>, ApiError> {
    let query = params.into_query(false)?;
    let page = state.store.list_outbox(user.user_id, &query).await?;
    Ok(Json(page))
}

/// The body of the receipt endpoints.
#[derive(ToSchema, Deserialize, Debug)]
pub struct ReceiptRequest {
    /// The durable server message id being acknowledged.
    pub message_id: i64,
}

/// POST `/api/messages/delivered`: recipient-scoped delivery mark.
#[utoipa::path(
    post,
    path = "/api/messages/delivered",
    request_body = ReceiptRequest,
    responses(
        (status = 200, description = "receipt recorded"),
        (status = 400, description = "invalid body"),
        (status = 401, description = "missing or invalid bearer token"),
        (status = 404, description = "no such message addressed to the caller")
    ),
)]
pub async fn mark_delivered(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    body: Result<Json<ReceiptRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    mark(state, user, body, EnvelopeKind::MessageDelivered).await
}

/// POST `/api/messages/read`: recipient-scoped read mark. Reading a
/// message that was never marked delivered also sets its delivery
/// timestamp, to the same instant.
#[utoipa::path(
    post,
    path = "/api/messages/read",
    request_body = ReceiptRequest,
    responses(
        (status = 200, description = "receipt recorded"),
        (status = 400, description = "invalid body"),
        (status = 401, description = "missing or invalid bearer token"),
        (status = 404, description = "no such message addressed to the caller")
    ),
)]
pub async fn mark_read(
    State(state): State<AppState>,
    Extension(user): Extension<AuthedUser>,
    body: Result<Json<ReceiptRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    mark(state, user, body, EnvelopeKind::MessageRead).await
}

/// Look the message up first to learn the original sender, perform the
/// recipient-scoped mark, then push the receipt frame to the sender's
/// session if one is online.
async fn mark(
    state: AppState,
    user: AuthedUser,
    body: Result<Json<ReceiptRequest>, JsonRejection>,
    kind: EnvelopeKind,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(request) =
        body.map_err(|_| ApiError::Validation("invalid request body".to_string()))?;
    if request.message_id <= 0 {
        return Err(ApiError::Validation("invalid request body".to_string()));
    }

    // Both the lookup and the mark collapse absence and scope violation
    // into the same not-found answer.
    let message = state
        .store
        .get_message_for_recipient(user.user_id, request.message_id)
        .await?;

    let now = OffsetDateTime::now_utc();
    match kind {
        EnvelopeKind::MessageRead => {
            state
                .store
                .mark_read_for_recipient(user.user_id, request.message_id, now)
                .await?;
        }
        _ => {
            state
                .store
                .mark_delivered_for_recipient(user.user_id, request.message_id, now)
                .await?;
        }
    }

    state
        .relay
        .push_receipt(message.from_user_id, kind, request.message_id)
        .await;

    Ok(Json(json!({})))
}
