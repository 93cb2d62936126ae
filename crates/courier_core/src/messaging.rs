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

//! Domain types and service seams for the messaging core.
//!
//! Everything the relay consumes from the outside world (the live
//! transport, the identity verifier, the username resolver, and the durable
//! message store) is expressed here as a narrow trait. Adapters are
//! assembled at process start.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use utoipa::ToSchema;

use crate::envelope::Envelope;

/// A user identifier minted by the external identity service.
///
/// Always positive; the core never mints these.
pub type UserId = i64;

/// The default page size for inbox/outbox queries.
pub const DEFAULT_QUERY_LIMIT: i64 = 100;

/// A durable direct-message record.
///
/// `id` is monotonic across the whole message log and is assigned on
/// insert. The record is immutable after insert; the receipt timestamps are
/// denormalized onto this read model from the receipt row.
#[derive(ToSchema, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StoredMessage {
    /// Monotonic, globally unique message id.
    pub id: i64,
    /// The sender.
    pub from_user_id: UserId,
    /// The addressee.
    pub to_user_id: UserId,
    /// Opaque UTF-8 payload.
    pub body: String,
    /// Server wall clock at insert, UTC.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// When the recipient's session first received the frame, or explicitly
    /// acknowledged delivery. Never cleared once set.
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub delivered_at: Option<OffsetDateTime>,
    /// When the recipient acknowledged reading. Never cleared once set;
    /// implies `delivered_at`.
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub read_at: Option<OffsetDateTime>,
}

/// One direct send handed from a session to the durable relay.
#[derive(Clone, Debug)]
pub struct DirectSend {
    /// The authenticated sender.
    pub from_user_id: UserId,
    /// The sender's username, denormalized for the recipient's frame.
    pub from_username: String,
    /// The resolved recipient.
    pub to_user_id: UserId,
    /// The message payload.
    pub body: String,
    /// The sender's own correlation id, echoed back in the ack.
    pub client_message_id: Option<i64>,
}

/// Why a send was not delivered over the wire.
#[derive(ToSchema, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryFailure {
    /// No live session for the recipient, or its queue did not accept the
    /// frame in time.
    RecipientOffline,
}

/// The outcome of one durable direct send.
///
/// A receipt with `delivered == false` is still a *successful* send: the
/// message is in the store and the recipient catches up on reconnect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendReceipt {
    /// The sender's correlation id, if any.
    pub client_message_id: Option<i64>,
    /// The durable id assigned by the store.
    pub server_message_id: i64,
    /// Whether the frame was enqueued to a live recipient session.
    pub delivered: bool,
    /// Set when `delivered` is false.
    pub reason: Option<DeliveryFailure>,
}

/// A cursor over the monotonic message-id order.
///
/// Both bounds are exclusive: `Before(n)` selects strictly older rows
/// (`id < n`), `After(n)` strictly newer ones (`id > n`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cursor {
    /// Page backwards through history.
    Before(i64),
    /// Page forwards from a known id.
    After(i64),
}

/// Options for one inbox or outbox query.
///
/// The recognized options compose; the repository turns the present set
/// into a single query.
#[derive(Clone, Debug)]
pub struct MessageQuery {
    /// Page size cap. Always positive.
    pub limit: i64,
    /// Optional exclusive id bound. `Before` pages are returned newest
    /// first, `After` pages oldest first.
    pub cursor: Option<Cursor>,
    /// Restrict to messages whose counterparty is this user.
    pub with_user_id: Option<UserId>,
    /// Inbox only: restrict to messages with no read receipt.
    pub unread_only: bool,
}

impl Default for MessageQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_QUERY_LIMIT,
            cursor: None,
            with_user_id: None,
            unread_only: false,
        }
    }
}

/// Failures surfaced by a [`MessageStore`].
///
/// Recipient-scoped operations collapse authorization failure and absence
/// into the single [`MessageNotFound`] variant so a caller cannot probe for
/// other users' message ids.
///
/// [`MessageNotFound`]: StoreError::MessageNotFound
#[derive(Error, Debug)]
pub enum StoreError {
    /// No such message, or the acting user is not its addressee.
    #[error("message not found")]
    MessageNotFound,
    /// The backing store failed.
    #[error("storage failure: {0}")]
    Storage(String),
}

/// Failures surfaced by a [`SessionVerifier`].
#[derive(Error, Debug)]
pub enum VerifyError {
    /// The token did not verify.
    #[error("invalid bearer token")]
    InvalidToken,
    /// The identity collaborator failed.
    #[error("identity verification failure: {0}")]
    Backend(String),
}

/// Failures surfaced by a [`UserResolver`].
#[derive(Error, Debug)]
pub enum ResolveError {
    /// No user with that name.
    #[error("unknown user: {0}")]
    UnknownUser(String),
    /// The resolver's backing store failed.
    #[error("resolver failure: {0}")]
    Backend(String),
}

/// An authenticated session identity, as resolved by the verifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedUser {
    /// The external identity service's id for this user.
    pub user_id: UserId,
    /// The username, denormalized for presence frames.
    pub username: String,
}

/// The live-delivery seam: a centralized relay hub today, other transports
/// later.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Attempt to enqueue an envelope to the recipient's live session.
    ///
    /// Returns `false` when the recipient has no session, the session is
    /// closing, or its bounded queue did not accept the frame in time.
    /// Never blocks indefinitely.
    async fn deliver_direct(&self, to_user_id: UserId, envelope: Envelope) -> bool;
}

/// Validates a realtime session's bearer token.
///
/// Token issuance and the verification secret live with the external
/// identity service; the core only consumes this seam.
#[async_trait::async_trait]
pub trait SessionVerifier: Send + Sync {
    /// Verify a bearer token, resolving the acting user.
    async fn verify(&self, token: &str) -> Result<VerifiedUser, VerifyError>;
}

/// Resolves an addressable recipient name to an internal user id.
#[async_trait::async_trait]
pub trait UserResolver: Send + Sync {
    /// Resolve `username` to its user id.
    async fn resolve_username(&self, username: &str) -> Result<UserId, ResolveError>;
}

/// Durable storage of messages and receipts, and the query surface that
/// powers sync.
///
/// This is the sole seam to storage; nothing else mutates messages or
/// receipts.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a direct message, assigning its monotonic `id` and
    /// `created_at`; returns the full record.
    async fn save_direct_message(
        &self,
        from_user_id: UserId,
        to_user_id: UserId,
        body: &str,
    ) -> Result<StoredMessage, StoreError>;

    /// Set `delivered_at` if currently unset; a later call leaves the first
    /// timestamp in place.
    async fn mark_delivered(&self, message_id: i64, at: OffsetDateTime) -> Result<(), StoreError>;

    /// Set `read_at` if currently unset. If `delivered_at` is also unset it
    /// is set to the same instant.
    async fn mark_read(&self, message_id: i64, at: OffsetDateTime) -> Result<(), StoreError>;

    /// [`mark_delivered`], but fails with [`StoreError::MessageNotFound`]
    /// unless the message is addressed to `recipient_user_id`.
    ///
    /// [`mark_delivered`]: MessageStore::mark_delivered
    async fn mark_delivered_for_recipient(
        &self,
        recipient_user_id: UserId,
        message_id: i64,
        at: OffsetDateTime,
    ) -> Result<(), StoreError>;

    /// [`mark_read`], but fails with [`StoreError::MessageNotFound`] unless
    /// the message is addressed to `recipient_user_id`.
    ///
    /// [`mark_read`]: MessageStore::mark_read
    async fn mark_read_for_recipient(
        &self,
        recipient_user_id: UserId,
        message_id: i64,
        at: OffsetDateTime,
    ) -> Result<(), StoreError>;

    /// Fetch one message, scoped to its addressee. Used before receipt
    /// fan-out to learn the original sender.
    async fn get_message_for_recipient(
        &self,
        recipient_user_id: UserId,
        message_id: i64,
    ) -> Result<StoredMessage, StoreError>;

    /// Page messages addressed to `user_id`.
    async fn list_inbox(
        &self,
        user_id: UserId,
        query: &MessageQuery,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// Page messages sent by `user_id`.
    async fn list_outbox(
        &self,
        user_id: UserId,
        query: &MessageQuery,
    ) -> Result<Vec<StoredMessage>, StoreError>;
}
