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

//! Bearer-token authentication for the HTTP surface.
//!
//! Token issuance and verification belong to the external identity
//! service; this module owns only the extraction of the token from a
//! request, the middleware that runs the injected [`SessionVerifier`], and
//! the typed [`AuthedUser`] extension handlers consume. The extension is a
//! concrete type owned here, so there is no stringly-keyed context value
//! to misspell.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use courier_core::messaging::{
    ResolveError, SessionVerifier, UserId, UserResolver, VerifiedUser, VerifyError,
};

use crate::error::ApiError;
use crate::AppState;

/// The authenticated caller, inserted by [`require_bearer`] and read by
/// handlers through `Extension<AuthedUser>`.
#[derive(Clone, Debug)]
pub struct AuthedUser {
    /// The acting user's id.
    pub user_id: UserId,
    /// The acting user's name.
    pub username: String,
}

impl From<VerifiedUser> for AuthedUser {
    fn from(user: VerifiedUser) -> Self {
        Self {
            user_id: user.user_id,
            username: user.username,
        }
    }
}

/// Extract a token from `Authorization: Bearer <token>`.
pub fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let token = raw.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Middleware guarding the plain HTTP endpoints: verifies the bearer token
/// and attaches the resolved [`AuthedUser`] to the request.
pub async fn require_bearer(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_from_headers(request.headers()).ok_or(ApiError::Unauthorized)?;
    let user = state
        .verifier
        .verify(&token)
        .await
        .map_err(|_| ApiError::Unauthorized)?;

    request.extensions_mut().insert(AuthedUser::from(user));
    Ok(next.run(request).await)
}

/// A verifier over a fixed token table.
///
/// This is the local-development and test stand-in; deployments inject the
/// identity service's own adapter through the same seam.
#[derive(Default)]
pub struct StaticTokenVerifier {
    tokens: std::collections::HashMap<String, VerifiedUser>,
}

impl StaticTokenVerifier {
    /// Build a verifier from `(token, user_id, username)` entries.
    pub fn new<I, T, U>(entries: I) -> Self
    where
        I: IntoIterator<Item = (T, UserId, U)>,
        T: Into<String>,
        U: Into<String>,
    {
        Self {
            tokens: entries
                .into_iter()
                .map(|(token, user_id, username)| {
                    (
                        token.into(),
                        VerifiedUser {
                            user_id,
                            username: username.into(),
                        },
                    )
                })
                .collect(),
        }
    }

    /// Parse `token:user_id:username` entries from a comma-separated
    /// string, skipping malformed ones.
    pub fn from_spec(raw: &str) -> Self {
        let entries = raw.split(',').filter_map(|entry| {
            let mut parts = entry.trim().splitn(3, ':');
            let token = parts.next()?.trim();
            let user_id: UserId = parts.next()?.trim().parse().ok()?;
            let username = parts.next()?.trim();
            if token.is_empty() || user_id <= 0 || username.is_empty() {
                return None;
            }
            Some((token.to_string(), user_id, username.to_string()))
        });
        Self::new(entries)
    }
}

#[async_trait::async_trait]
impl SessionVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedUser, VerifyError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(VerifyError::InvalidToken)
    }
}

/// Resolves usernames against the relay's `users` projection.
pub struct SqlUserResolver {
    pool: sqlx::SqlitePool,
}

impl SqlUserResolver {
    /// Wrap an open pool.
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl UserResolver for SqlUserResolver {
    async fn resolve_username(&self, username: &str) -> Result<UserId, ResolveError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| ResolveError::Backend(err.to_string()))?;

        match row {
            Some((id,)) => Ok(id),
            None => Err(ResolveError::UnknownUser(username.to_string())),
        }
    }
}

/// A resolver over a fixed username table, for tests and local tooling.
#[derive(Default)]
pub struct StaticUserResolver {
    users: std::collections::HashMap<String, UserId>,
}

impl StaticUserResolver {
    /// Build a resolver from `(username, user_id)` entries.
    pub fn new<I, U>(entries: I) -> Self
    where
        I: IntoIterator<Item = (U, UserId)>,
        U: Into<String>,
    {
        Self {
            users: entries
                .into_iter()
                .map(|(name, id)| (name.into(), id))
                .collect(),
        }
    }
}

#[async_trait::async_trait]
impl UserResolver for StaticUserResolver {
    async fn resolve_username(&self, username: &str) -> Result<UserId, ResolveError> {
        self.users
            .get(username)
            .copied()
            .ok_or_else(|| ResolveError::UnknownUser(username.to_string()))
    }
}

/// Convenience alias used across wiring and tests.
pub type SharedVerifier = Arc<dyn SessionVerifier>;
