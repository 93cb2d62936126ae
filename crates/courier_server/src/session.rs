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

//! The realtime session endpoint: handshake, upgrade, and the per-session
//! read/write/heartbeat loops.
//!
//! A live session runs exactly two long-lived tasks. The read loop parses
//! inbound envelopes and hands direct messages to the durable relay; the
//! write loop drains the session's bounded queue onto the socket and
//! carries the heartbeat. Either loop terminating tears the session down
//! and unregisters it from the hub, exactly once.
//!
//! The loops are written against the small [`FrameReader`]/[`FrameWriter`]
//! seams rather than the concrete socket, so the protocol logic is
//! exercised in tests without a network.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, Request, State};
use axum::http::header::{ORIGIN, SEC_WEBSOCKET_PROTOCOL};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use courier_core::envelope::{Envelope, EnvelopeKind};
use courier_core::messaging::{DirectSend, VerifiedUser};
use courier_core::settings;

use crate::auth::bearer_from_headers;
use crate::error::ApiError;
use crate::hub::SESSION_QUEUE_CAPACITY;
use crate::AppState;

/// How long a session may be silent (no frames, no pongs) before the read
/// loop gives up on it.
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-frame write deadline.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Ping cadence on the write loop.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// The subprotocol prefix carrying a bearer token, the browser-safe auth
/// transport. Tokens are never accepted via the URL query string, which
/// would leak them into access logs and referer headers.
const BEARER_SUBPROTOCOL_PREFIX: &str = "bearer.";

/// The authenticated handshake, attached to the request by
/// [`handshake_guard`] for the upgrade handler.
#[derive(Clone)]
pub struct SessionAuth {
    user: VerifiedUser,
    /// The `bearer.<token>` entry to echo back as the accepted
    /// subprotocol, when the token arrived that way.
    subprotocol: Option<String>,
}

/// Find a `bearer.<token>` entry among the client's advertised
/// subprotocols.
fn bearer_from_subprotocols(headers: &HeaderMap) -> Option<String> {
    for value in headers.get_all(SEC_WEBSOCKET_PROTOCOL) {
        let Ok(value) = value.to_str() else { continue };
        for proto in value.split(',') {
            if let Some(token) = proto.trim().strip_prefix(BEARER_SUBPROTOCOL_PREFIX) {
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }
    None
}

/// Middleware guarding `GET /ws`: origin allow-list, then bearer
/// authentication, all before the transport upgrade.
///
/// Exactly one token source must be present: the `Authorization` header
/// or a `bearer.<token>` subprotocol. A failed handshake returns a status
/// code and leaves no state behind.
pub async fn handshake_guard(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let headers = request.headers();

    let origin = headers
        .get(ORIGIN)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !settings::origin_allowed(origin, &state.settings.ws_allowed_origins) {
        debug!(origin, "rejected handshake from disallowed origin");
        return Err(ApiError::OriginForbidden);
    }

    let header_token = bearer_from_headers(headers);
    let proto_token = bearer_from_subprotocols(headers);
    let (token, subprotocol) = match (header_token, proto_token) {
        (Some(token), None) => (token, None),
        (None, Some(token)) => {
            let echoed = format!("{BEARER_SUBPROTOCOL_PREFIX}{token}");
            (token, Some(echoed))
        }
        _ => return Err(ApiError::Unauthorized),
    };

    let user = state
        .verifier
        .verify(&token)
        .await
        .map_err(|_| ApiError::Unauthorized)?;

    request
        .extensions_mut()
        .insert(SessionAuth { user, subprotocol });
    Ok(next.run(request).await)
}

/// `GET /ws`: upgrade an authenticated handshake into a live session.
#[utoipa::path(
    get,
    path = "/ws",
    responses(
        (status = 101, description = "switching to the session protocol"),
        (status = 401, description = "missing or invalid bearer token"),
        (status = 403, description = "origin not allowed"),
        (status = 429, description = "handshake rate limit exceeded")
    ),
)]
pub async fn ws_handshake(
    State(state): State<AppState>,
    Extension(auth): Extension<SessionAuth>,
    ws: WebSocketUpgrade,
) -> Response {
    let mut upgrade = ws
        .max_message_size(state.settings.max_message_bytes)
        .on_failed_upgrade(|err| warn!("websocket upgrade failed: {err}"));
    if let Some(protocol) = auth.subprotocol.clone() {
        upgrade = upgrade.protocols([protocol]);
    }

    upgrade.on_upgrade(move |socket| run_session(state, socket, auth.user))
}

/// Drive one live session to completion.
async fn run_session(state: AppState, socket: WebSocket, user: VerifiedUser) {
    let (queue_tx, queue_rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
    let closer = CancellationToken::new();
    let session_id = state
        .hub
        .register(user.user_id, &user.username, queue_tx.clone(), closer.clone())
        .await;
    info!(user = %user.username, "session opened");

    let (sink, stream) = socket.split();
    let write_closer = closer.clone();
    let write_task = tokio::spawn(async move {
        let mut writer = WsFrameWriter { sink };
        write_loop(&mut writer, queue_rx, write_closer, HEARTBEAT_INTERVAL).await;
    });

    let mut reader = WsFrameReader { stream };
    read_loop(
        &mut reader,
        &queue_tx,
        &state,
        &user,
        &closer,
        READ_IDLE_TIMEOUT,
    )
    .await;

    // The replaced-session case makes this a no-op; a naturally ending
    // session is removed and announced offline exactly once.
    state.hub.unregister(user.user_id, session_id).await;
    closer.cancel();
    let _ = write_task.await;
    info!(user = %user.username, "session closed");
}

#[derive(Error, Debug)]
#[error("{0}")]
struct SessionIoError(String);

/// One inbound event, decoded off the transport.
#[derive(Debug)]
enum SessionFrame {
    Envelope(Envelope),
    Ping,
    Pong,
    Close,
}

#[async_trait::async_trait]
trait FrameReader: Send {
    /// The next inbound frame; `None` when the transport is gone.
    async fn next_frame(&mut self) -> Option<Result<SessionFrame, SessionIoError>>;
}

#[async_trait::async_trait]
trait FrameWriter: Send {
    async fn write_envelope(&mut self, envelope: &Envelope) -> Result<(), SessionIoError>;
    async fn write_ping(&mut self) -> Result<(), SessionIoError>;
    async fn write_close(&mut self) -> Result<(), SessionIoError>;
}

struct WsFrameReader {
    stream: SplitStream<WebSocket>,
}

#[async_trait::async_trait]
impl FrameReader for WsFrameReader {
    async fn next_frame(&mut self) -> Option<Result<SessionFrame, SessionIoError>> {
        let message = match self.stream.next().await? {
            Ok(message) => message,
            Err(err) => return Some(Err(SessionIoError(err.to_string()))),
        };

        Some(match message {
            Message::Text(text) => serde_json::from_str::<Envelope>(&text)
                .map(SessionFrame::Envelope)
                .map_err(|err| SessionIoError(err.to_string())),
            Message::Binary(bytes) => serde_json::from_slice::<Envelope>(&bytes)
                .map(SessionFrame::Envelope)
                .map_err(|err| SessionIoError(err.to_string())),
            Message::Ping(_) => Ok(SessionFrame::Ping),
            Message::Pong(_) => Ok(SessionFrame::Pong),
            Message::Close(_) => Ok(SessionFrame::Close),
        })
    }
}

struct WsFrameWriter {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait::async_trait]
impl FrameWriter for WsFrameWriter {
    async fn write_envelope(&mut self, envelope: &Envelope) -> Result<(), SessionIoError> {
        let text =
            serde_json::to_string(envelope).map_err(|err| SessionIoError(err.to_string()))?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|err| SessionIoError(err.to_string()))
    }

    async fn write_ping(&mut self) -> Result<(), SessionIoError> {
        self.sink
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|err| SessionIoError(err.to_string()))
    }

    async fn write_close(&mut self) -> Result<(), SessionIoError> {
        self.sink
            .send(Message::Close(None))
            .await
            .map_err(|err| SessionIoError(err.to_string()))
    }
}

/// Parse inbound frames until the transport errs, the peer closes, the
/// idle deadline lapses, or the session is told to close.
///
/// Only `direct_message` frames are acted on; every other envelope kind
/// from a client is silently ignored. Pongs push the idle deadline out.
async fn read_loop<R: FrameReader>(
    reader: &mut R,
    self_queue: &mpsc::Sender<Envelope>,
    state: &AppState,
    user: &VerifiedUser,
    closer: &CancellationToken,
    idle_timeout: Duration,
) {
    let mut deadline = Instant::now() + idle_timeout;
    loop {
        let frame = tokio::select! {
            _ = closer.cancelled() => return,
            frame = timeout_at(deadline, reader.next_frame()) => frame,
        };

        let frame = match frame {
            // Idle deadline lapsed, transport ended, or read error.
            Err(_) | Ok(None) => return,
            Ok(Some(Err(err))) => {
                debug!(user = %user.username, "session read error: {err}");
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            SessionFrame::Pong => deadline = Instant::now() + idle_timeout,
            SessionFrame::Close => return,
            SessionFrame::Envelope(envelope)
                if envelope.kind == EnvelopeKind::DirectMessage =>
            {
                handle_direct_message(envelope, self_queue, state, user).await;
            }
            // Pings are answered by the transport layer; anything else
            // from a client is not part of the inbound protocol.
            SessionFrame::Ping | SessionFrame::Envelope(_) => {}
        }
    }
}

/// Resolve, relay, and answer one inbound `direct_message` frame.
///
/// Replies go through the session's own queue with a non-blocking send; a
/// sender whose queue is full simply misses the ack or error frame.
async fn handle_direct_message(
    frame: Envelope,
    self_queue: &mpsc::Sender<Envelope>,
    state: &AppState,
    user: &VerifiedUser,
) {
    let Some(to) = frame
        .to
        .as_deref()
        .map(str::trim)
        .filter(|to| !to.is_empty())
    else {
        return;
    };

    let body = frame.body.unwrap_or_default();
    if body.len() > state.settings.max_message_bytes {
        try_reply(self_queue, Envelope::error("Message too large"));
        return;
    }

    let to_user_id = match state.resolver.resolve_username(to).await {
        Ok(id) => id,
        Err(_) => {
            try_reply(self_queue, Envelope::error(format!("User not found: {to}")));
            return;
        }
    };

    let send = DirectSend {
        from_user_id: user.user_id,
        from_username: user.username.clone(),
        to_user_id,
        body,
        client_message_id: frame.id,
    };

    match state.relay.send_direct(send).await {
        Ok(receipt) if receipt.delivered => {
            try_reply(self_queue, Envelope::ack(receipt.client_message_id));
        }
        Ok(_) => {
            // Durable, but the recipient is not connected.
            try_reply(
                self_queue,
                Envelope::error(format!("User is not online: {to}")),
            );
        }
        Err(err) => {
            error!(user = %user.username, "direct send failed: {err}");
            try_reply(self_queue, Envelope::error("Message could not be stored"));
        }
    }
}

fn try_reply(self_queue: &mpsc::Sender<Envelope>, envelope: Envelope) {
    let _ = self_queue.try_send(envelope);
}

/// Drain the session queue onto the transport, pinging on a heartbeat
/// cadence.
///
/// A closed queue or a cancelled session sends a close frame and
/// terminates; a write failure just terminates. Either way the transport
/// goes away, which errors the read loop out.
async fn write_loop<W: FrameWriter>(
    writer: &mut W,
    mut queue: mpsc::Receiver<Envelope>,
    closer: CancellationToken,
    heartbeat: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    loop {
        tokio::select! {
            _ = closer.cancelled() => {
                let _ = timeout(WRITE_TIMEOUT, writer.write_close()).await;
                return;
            }
            next = queue.recv() => match next {
                Some(envelope) => {
                    match timeout(WRITE_TIMEOUT, writer.write_envelope(&envelope)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) | Err(_) => return,
                    }
                }
                None => {
                    let _ = timeout(WRITE_TIMEOUT, writer.write_close()).await;
                    return;
                }
            },
            _ = ticker.tick() => {
                match timeout(WRITE_TIMEOUT, writer.write_ping()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => return,
                }
            }
        }
    }
}
