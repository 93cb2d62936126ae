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

//! The persist-then-deliver path for direct messages.
//!
//! Ordering is the whole point: the store insert strictly precedes the
//! delivery attempt, so the recipient's durable inbox already contains a
//! message before its wire frame can be observed. An inbox poll after
//! receiving a frame is never behind.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::debug;

use courier_core::envelope::{Envelope, EnvelopeKind};
use courier_core::messaging::{
    DeliveryFailure, DirectSend, MessageStore, SendReceipt, StoreError, Transport, UserId,
};

/// Sequences persist → relay → mark-delivered for a single direct send,
/// and pushes explicit receipts back to senders.
pub struct DurableRelay {
    store: Arc<dyn MessageStore>,
    transport: Arc<dyn Transport>,
}

impl DurableRelay {
    /// Compose the relay from its seams.
    pub fn new(store: Arc<dyn MessageStore>, transport: Arc<dyn Transport>) -> Self {
        Self { store, transport }
    }

    /// Persist a direct message, attempt live delivery, and record the
    /// delivery receipt.
    ///
    /// An offline recipient is a *successful* send: the returned receipt
    /// reports `delivered = false` with `recipient_offline`, and the
    /// message waits in the durable inbox. Store failures propagate
    /// unchanged.
    pub async fn send_direct(&self, send: DirectSend) -> Result<SendReceipt, StoreError> {
        let stored = self
            .store
            .save_direct_message(send.from_user_id, send.to_user_id, &send.body)
            .await?;

        let frame = Envelope::direct_message(stored.id, &send.from_username, &send.body);
        let delivered = self.transport.deliver_direct(send.to_user_id, frame).await;

        if delivered {
            // A failure here may be retried later; the message itself is
            // already durable.
            self.store
                .mark_delivered(stored.id, OffsetDateTime::now_utc())
                .await?;
        }

        Ok(SendReceipt {
            client_message_id: send.client_message_id,
            server_message_id: stored.id,
            delivered,
            reason: if delivered {
                None
            } else {
                Some(DeliveryFailure::RecipientOffline)
            },
        })
    }

    /// Push a `message_delivered` / `message_read` receipt frame to the
    /// original sender's session, if online.
    ///
    /// Best effort: the receipt is already durable, so a missing sender
    /// session or a full queue is not an error.
    pub async fn push_receipt(
        &self,
        sender_user_id: UserId,
        kind: EnvelopeKind,
        server_message_id: i64,
    ) {
        let frame = Envelope::receipt(kind, server_message_id);
        if !self.transport.deliver_direct(sender_user_id, frame).await {
            debug!(
                sender_user_id,
                server_message_id, "receipt frame not pushed, sender offline"
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    use crate::repository::{connect_memory, SqliteMessageStore};
    use courier_core::messaging::MessageQuery;

    /// A transport that records deliveries and answers with a fixed
    /// verdict; optionally asserts the message is already durable when the
    /// frame arrives.
    struct RecordingTransport {
        deliver: bool,
        store: Option<Arc<dyn MessageStore>>,
        frames: Mutex<Vec<(UserId, Envelope)>>,
    }

    impl RecordingTransport {
        fn answering(deliver: bool) -> Arc<Self> {
            Arc::new(Self {
                deliver,
                store: None,
                frames: Mutex::new(Vec::new()),
            })
        }

        fn durable_checking(store: Arc<dyn MessageStore>) -> Arc<Self> {
            Arc::new(Self {
                deliver: true,
                store: Some(store),
                frames: Mutex::new(Vec::new()),
            })
        }

        fn frames(&self) -> Vec<(UserId, Envelope)> {
            self.frames.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Transport for RecordingTransport {
        async fn deliver_direct(&self, to_user_id: UserId, envelope: Envelope) -> bool {
            if let Some(store) = &self.store {
                let id = envelope.id.expect("frame carries the durable id");
                store
                    .get_message_for_recipient(to_user_id, id)
                    .await
                    .expect("message is durable before the wire frame");
            }
            self.frames.lock().unwrap().push((to_user_id, envelope));
            self.deliver
        }
    }

    async fn sqlite_store() -> Arc<SqliteMessageStore> {
        Arc::new(SqliteMessageStore::new(connect_memory().await.unwrap()))
    }

    fn send_to_bob() -> DirectSend {
        DirectSend {
            from_user_id: 1,
            from_username: "alice".to_string(),
            to_user_id: 2,
            body: "hi".to_string(),
            client_message_id: Some(99),
        }
    }

    #[tokio::test]
    async fn online_send_persists_delivers_and_marks() {
        let store = sqlite_store().await;
        let transport = RecordingTransport::answering(true);
        let relay = DurableRelay::new(store.clone(), transport.clone());

        let receipt = relay.send_direct(send_to_bob()).await.unwrap();
        assert!(receipt.delivered);
        assert_eq!(receipt.client_message_id, Some(99));
        assert!(receipt.reason.is_none());

        let frames = transport.frames();
        assert_eq!(frames.len(), 1);
        let (to, frame) = &frames[0];
        assert_eq!(*to, 2);
        assert_eq!(frame.kind, EnvelopeKind::DirectMessage);
        assert_eq!(frame.id, Some(receipt.server_message_id));
        assert_eq!(frame.from.as_deref(), Some("alice"));
        assert_eq!(frame.body.as_deref(), Some("hi"));

        let inbox = store.list_inbox(2, &MessageQuery::default()).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert!(inbox[0].delivered_at.is_some());
    }

    #[tokio::test]
    async fn offline_send_is_durable_with_no_delivery_receipt() {
        let store = sqlite_store().await;
        let transport = RecordingTransport::answering(false);
        let relay = DurableRelay::new(store.clone(), transport);

        let receipt = relay.send_direct(send_to_bob()).await.unwrap();
        assert!(!receipt.delivered);
        assert_eq!(receipt.reason, Some(DeliveryFailure::RecipientOffline));

        let inbox = store.list_inbox(2, &MessageQuery::default()).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert!(inbox[0].delivered_at.is_none());
    }

    #[tokio::test]
    async fn persistence_precedes_the_wire_frame() {
        let store = sqlite_store().await;
        let transport = RecordingTransport::durable_checking(store.clone());
        let relay = DurableRelay::new(store, transport.clone());

        let receipt = relay.send_direct(send_to_bob()).await.unwrap();
        assert!(receipt.delivered);
        assert_eq!(transport.frames().len(), 1);
    }

    #[tokio::test]
    async fn receipt_push_reaches_the_sender() {
        let store = sqlite_store().await;
        let transport = RecordingTransport::answering(true);
        let relay = DurableRelay::new(store, transport.clone());

        relay
            .push_receipt(1, EnvelopeKind::MessageRead, 7)
            .await;

        let frames = transport.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, 1);
        assert_eq!(frames[0].1.kind, EnvelopeKind::MessageRead);
        assert_eq!(frames[0].1.id, Some(7));
    }

    #[tokio::test]
    async fn receipt_push_to_an_offline_sender_is_not_an_error() {
        let store = sqlite_store().await;
        let transport = RecordingTransport::answering(false);
        let relay = DurableRelay::new(store, transport.clone());

        relay
            .push_receipt(1, EnvelopeKind::MessageDelivered, 7)
            .await;
        assert_eq!(transport.frames().len(), 1);
    }
}
