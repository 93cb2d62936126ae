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

//! Process configuration, read once from the environment at startup.
//!
//! Numeric variables that are unset, unparseable, or non-positive fall back
//! to their defaults rather than failing startup.

use serde::{Deserialize, Serialize};

/// Environment variable naming the WebSocket origin allow-list.
pub const ENV_WS_ALLOWED_ORIGINS: &str = "WS_ALLOWED_ORIGINS";
/// Environment variable for the login limiter, consumed by the external
/// auth surface; parsed here so every instance agrees on the value.
pub const ENV_LOGIN_RATE_LIMIT: &str = "LOGIN_RATE_LIMIT_PER_MINUTE";
/// Environment variable for the session-handshake limiter.
pub const ENV_WS_RATE_LIMIT: &str = "WS_HANDSHAKE_RATE_LIMIT_PER_MINUTE";
/// Environment variable naming the SQLite database path.
pub const ENV_DATABASE: &str = "COURIER_DB";
/// Environment variable naming the listen address.
pub const ENV_BIND: &str = "COURIER_BIND";
/// Environment variable capping session frame and message-body size.
pub const ENV_MAX_MESSAGE_BYTES: &str = "COURIER_MAX_MESSAGE_BYTES";
/// Environment variable selecting the store-backed rate limiter.
pub const ENV_SHARED_RATE_LIMIT: &str = "COURIER_SHARED_RATE_LIMIT";

/// Everything the process reads from its environment.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Settings {
    /// SQLite database path. `sqlite::memory:` is accepted for ephemeral
    /// runs.
    pub database_url: String,

    /// The address the HTTP/WS listener binds.
    pub bind_addr: String,

    /// Allowed `Origin` values for the session handshake, lowercased
    /// `scheme://host` entries.
    pub ws_allowed_origins: Vec<String>,

    /// Per-minute cap on login attempts per client bucket.
    pub login_rate_limit_per_minute: u32,

    /// Per-minute cap on session handshakes per client bucket.
    pub ws_handshake_rate_limit_per_minute: u32,

    /// Frame read cap for session transports, and the application limit on
    /// a direct-message body.
    pub max_message_bytes: usize,

    /// When true, the handshake limiter counts hits in the backing store so
    /// the window is shared across instances; otherwise it counts
    /// in-process.
    pub shared_rate_limit: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "courier.db".to_string(),
            bind_addr: "127.0.0.1:8080".to_string(),
            ws_allowed_origins: default_allowed_origins(),
            login_rate_limit_per_minute: 60,
            ws_handshake_rate_limit_per_minute: 120,
            max_message_bytes: 1024,
            shared_rate_limit: true,
        }
    }
}

impl Settings {
    /// Read the full configuration from the process environment.
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        Self {
            database_url: string_from_env(ENV_DATABASE, &defaults.database_url),
            bind_addr: string_from_env(ENV_BIND, &defaults.bind_addr),
            ws_allowed_origins: parse_allowed_origins(
                &std::env::var(ENV_WS_ALLOWED_ORIGINS).unwrap_or_default(),
            ),
            login_rate_limit_per_minute: int_from_env(
                ENV_LOGIN_RATE_LIMIT,
                defaults.login_rate_limit_per_minute,
            ),
            ws_handshake_rate_limit_per_minute: int_from_env(
                ENV_WS_RATE_LIMIT,
                defaults.ws_handshake_rate_limit_per_minute,
            ),
            max_message_bytes: int_from_env(ENV_MAX_MESSAGE_BYTES, 1024u32) as usize,
            shared_rate_limit: bool_from_env(ENV_SHARED_RATE_LIMIT, defaults.shared_rate_limit),
        }
    }
}

/// The localhost/loopback family permitted when no allow-list is
/// configured.
pub fn default_allowed_origins() -> Vec<String> {
    [
        "http://localhost",
        "https://localhost",
        "http://127.0.0.1",
        "https://127.0.0.1",
        "http://[::1]",
        "https://[::1]",
        "http://localhost:3000",
        "http://localhost:5173",
        "http://127.0.0.1:3000",
        "http://127.0.0.1:5173",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Parse a comma-separated allow-list. Blank input or an input with no
/// usable entries yields the default list.
pub fn parse_allowed_origins(raw: &str) -> Vec<String> {
    let entries: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_lowercase)
        .collect();

    if entries.is_empty() {
        default_allowed_origins()
    } else {
        entries
    }
}

/// Whether a handshake `Origin` header value passes the allow-list.
///
/// An empty origin is permitted: non-browser clients and local tooling omit
/// the header. A non-empty origin must parse as `scheme://host` and match
/// an allowed entry exactly, case-insensitively.
pub fn origin_allowed(origin: &str, allowed: &[String]) -> bool {
    let origin = origin.trim();
    if origin.is_empty() {
        return true;
    }

    let Some((scheme, rest)) = origin.split_once("://") else {
        return false;
    };
    // An Origin header carries no path, but tolerate one rather than
    // mismatching on it.
    let host = rest.split('/').next().unwrap_or_default();
    if scheme.is_empty() || host.is_empty() {
        return false;
    }

    let normalized = format!("{}://{}", scheme.to_lowercase(), host.to_lowercase());
    allowed
        .iter()
        .any(|candidate| candidate.trim().to_lowercase() == normalized)
}

fn string_from_env(key: &str, fallback: &str) -> String {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn int_from_env(key: &str, fallback: u32) -> u32 {
    parse_positive(&std::env::var(key).unwrap_or_default(), fallback)
}

fn bool_from_env(key: &str, fallback: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => match raw.trim() {
            "true" | "1" => true,
            "false" | "0" => false,
            _ => fallback,
        },
        Err(_) => fallback,
    }
}

/// Parse a positive integer, falling back on blank, unparseable, or
/// non-positive input.
pub fn parse_positive(raw: &str, fallback: u32) -> u32 {
    let raw = raw.trim();
    if raw.is_empty() {
        return fallback;
    }
    match raw.parse::<i64>() {
        Ok(v) if v > 0 && v <= i64::from(u32::MAX) => v as u32,
        _ => fallback,
    }
}
