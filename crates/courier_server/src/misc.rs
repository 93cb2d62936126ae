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

//! Minor services: version and health.

use axum::extract::State;
use axum::response::Json;
use serde_derive::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::AppState;

/// Reads the version defined in Cargo.toml at compile time.
#[macro_export]
macro_rules! cargo_crate_version {
    () => {
        env!("CARGO_PKG_VERSION")
    };
}

/// The running build, as reported by the version endpoint.
#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Version {
    /// The crate name.
    pub name: String,
    /// The crate version.
    pub version: String,
}

/// GET `/v1/misc/version`: the running build.
#[utoipa::path(
    get,
    path = "/v1/misc/version",
    responses((status = 200, description = "OK", body = Version)),
)]
pub async fn version() -> Json<Version> {
    Json(Version {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: cargo_crate_version!().to_string(),
    })
}

/// GET `/v1/misc/health`: liveness plus a cheap probe of the backing
/// store. A store that cannot answer makes the instance report 503.
#[utoipa::path(
    get,
    path = "/v1/misc/health",
    responses(
        (status = 200, description = "healthy"),
        (status = 503, description = "backing store unavailable")
    ),
)]
pub async fn health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&state.pool)
        .await
        .map_err(|err| ApiError::Unavailable(format!("store unavailable: {err}")))?;

    Ok(Json(json!({ "status": "ok" })))
}
