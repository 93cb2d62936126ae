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

//! The error taxonomy of the HTTP surface.
//!
//! Every handler returns `Result<_, ApiError>`; the [`IntoResponse`]
//! impl renders the JSON body `{"error": "..."}` with the mapped status
//! code. Internal details are logged, never surfaced.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use courier_core::messaging::StoreError;

/// Abstraction over all errors the HTTP surface can produce, so `?`
/// error handling works everywhere in the handler layer.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Malformed input: bad JSON, wrong types, missing required fields,
    /// conflicting parameters. 400.
    #[error("{0}")]
    Validation(String),

    /// Missing or invalid bearer token. 401.
    #[error("unauthorized")]
    Unauthorized,

    /// The handshake `Origin` failed the allow-list. 403.
    #[error("origin not allowed")]
    OriginForbidden,

    /// No such resource, including recipient-scope violations. 404.
    #[error("message not found")]
    NotFound,

    /// A uniqueness violation on an extended surface. 409.
    #[error("{0}")]
    Conflict(String),

    /// Too many attempts in the current window. 429.
    #[error("rate limit exceeded")]
    RateLimited,

    /// A required collaborator is down or unconfigured. 503.
    #[error("{0}")]
    Unavailable(String),

    /// Any unexpected failure. 500 with a safe message; the detail goes to
    /// the log, tagged with the request id by the surrounding span.
    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::OriginForbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::MessageNotFound => ApiError::NotFound,
            StoreError::Storage(detail) => ApiError::Internal(detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(detail) = &self {
            error!("internal error: {detail}");
        }

        let body = Json(json!({ "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}
