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

//! Request identity for the HTTP surface.
//!
//! Every response carries an `X-Request-ID`, echoed when the client
//! supplied one and minted otherwise. Every log line emitted while
//! handling the request carries the same id through the surrounding span.

use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use tracing::Instrument;

/// The header carrying the request id.
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Mint an id from 12 random bytes, hex-encoded.
fn mint_request_id() -> String {
    let bytes: [u8; 12] = rand::random();
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Echo or mint the request id, record it on the request's tracing span,
/// and stamp it on the response.
pub async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(&REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(mint_request_id);

    let span = tracing::info_span!("request", request_id = %request_id);
    let mut response = next.run(request).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod test {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use axum_test::TestServer;

    fn server() -> TestServer {
        let router = Router::new()
            .route("/health", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn(request_id_middleware));
        TestServer::new(router).expect("cannot instantiate TestServer")
    }

    #[tokio::test]
    async fn mints_an_id_when_none_is_supplied() {
        let response = server().get("/health").await;
        response.assert_status_ok();

        let id = response
            .headers()
            .get("x-request-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .expect("response carries a request id");
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn echoes_a_supplied_id() {
        let response = server()
            .get("/health")
            .add_header(
                REQUEST_ID_HEADER,
                HeaderValue::from_static("req-123"),
            )
            .await;
        response.assert_status_ok();
        assert_eq!(
            response.headers().get("x-request-id").unwrap(),
            &HeaderValue::from_static("req-123")
        );
    }

    #[test]
    fn minted_ids_are_distinct() {
        assert_ne!(mint_request_id(), mint_request_id());
    }
}
