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

//! The wire-level envelope exchanged over a realtime session.
//!
//! Envelopes are values: they are serialized to JSON text frames, copied
//! across the hub boundary, and never persisted. Only [`StoredMessage`]s
//! are durable.
//!
//! [`StoredMessage`]: crate::messaging::StoredMessage

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// The discriminant of an [`Envelope`].
#[derive(ToSchema, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// A direct message. Inbound from a client (with `to` set), or outbound
    /// to the recipient (with `from` set and `id` carrying the durable
    /// server message id).
    DirectMessage,
    /// Confirms a sender's durable send; `id` echoes the sender's own
    /// correlation id.
    MessageAck,
    /// Delivery receipt pushed to the original sender; `id` is the server
    /// message id.
    MessageDelivered,
    /// Read receipt pushed to the original sender; `id` is the server
    /// message id.
    MessageRead,
    /// Presence broadcast; `from` is the username that came online.
    UserOnline,
    /// Presence broadcast; `from` is the username that went offline.
    UserOffline,
    /// Best-effort error string in `body`.
    Error,
    /// Any frame type this build does not recognize. Inbound frames of this
    /// kind parse successfully and are ignored by the session read loop.
    #[serde(other)]
    Unknown,
}

/// One wire-level JSON object exchanged over a session.
///
/// All fields other than `kind` are optional; absent fields are omitted
/// from the encoded frame.
#[derive(ToSchema, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Correlation id. Client-chosen on inbound direct messages,
    /// server-assigned on receipt frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    /// The envelope discriminant.
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,

    /// Sender username, where applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Recipient username, on inbound direct messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    /// Opaque UTF-8 payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl Envelope {
    /// An outbound direct-message frame for the recipient's session.
    pub fn direct_message(server_message_id: i64, from: &str, body: &str) -> Self {
        Self {
            id: Some(server_message_id),
            kind: EnvelopeKind::DirectMessage,
            from: Some(from.to_string()),
            to: None,
            body: Some(body.to_string()),
        }
    }

    /// An acknowledgment of a durable send, echoing the client's own id.
    pub fn ack(client_message_id: Option<i64>) -> Self {
        Self {
            id: client_message_id,
            kind: EnvelopeKind::MessageAck,
            from: None,
            to: None,
            body: None,
        }
    }

    /// A receipt frame (`message_delivered` or `message_read`) for the
    /// original sender.
    pub fn receipt(kind: EnvelopeKind, server_message_id: i64) -> Self {
        Self {
            id: Some(server_message_id),
            kind,
            from: None,
            to: None,
            body: None,
        }
    }

    /// A presence frame (`user_online` or `user_offline`).
    pub fn presence(kind: EnvelopeKind, username: &str) -> Self {
        Self {
            id: None,
            kind,
            from: Some(username.to_string()),
            to: None,
            body: None,
        }
    }

    /// A best-effort error frame.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            id: None,
            kind: EnvelopeKind::Error,
            from: None,
            to: None,
            body: Some(message.into()),
        }
    }
}
