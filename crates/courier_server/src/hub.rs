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

//! The in-process registry of live sessions.
//!
//! The hub owns every live session handle, enforces the
//! one-session-per-user invariant, and is the fan-out point for presence
//! and direct delivery. The registry lock is held only for map operations;
//! bounded enqueues always run outside it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use courier_core::envelope::{Envelope, EnvelopeKind};
use courier_core::messaging::{Transport, UserId};

/// Capacity of each session's outbound queue.
pub const SESSION_QUEUE_CAPACITY: usize = 16;

/// How long a direct delivery waits on a full recipient queue before the
/// recipient is treated as offline for that send.
pub const ENQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

/// The hub's handle on one live session.
///
/// The write loop consumes the other end of `queue`; cancelling `closer`
/// tells both session loops to tear down.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: u64,
    username: String,
    queue: mpsc::Sender<Envelope>,
    closer: CancellationToken,
}

impl SessionHandle {
    fn close(&self) {
        self.closer.cancel();
    }

    fn is_closing(&self) -> bool {
        self.closer.is_cancelled()
    }
}

/// Registry of live sessions with presence fan-out.
#[derive(Default)]
pub struct Hub {
    sessions: RwLock<HashMap<UserId, SessionHandle>>,
    next_session_id: AtomicU64,
}

impl Hub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for `user_id`, returning its registration id.
    ///
    /// Any prior session for the same user is evicted: its queue and
    /// transport are closed before the registry lock is released, so no
    /// later delivery can reach the replaced queue. Replacement does not
    /// broadcast `user_offline`, since the user never left. After registration,
    /// `user_online` fans out to every *other* live session.
    pub async fn register(
        &self,
        user_id: UserId,
        username: &str,
        queue: mpsc::Sender<Envelope>,
        closer: CancellationToken,
    ) -> u64 {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = SessionHandle {
            session_id,
            username: username.to_string(),
            queue,
            closer,
        };

        let evicted = {
            let mut sessions = self.sessions.write().await;
            let prior = sessions.insert(user_id, handle);
            if let Some(prior) = &prior {
                prior.close();
            }
            prior
        };
        if evicted.is_some() {
            debug!(user_id, "replaced existing session");
        }

        self.broadcast_except(user_id, Envelope::presence(EnvelopeKind::UserOnline, username))
            .await;

        session_id
    }

    /// Drop the session registered under `(user_id, session_id)` and fan
    /// out `user_offline` to the remaining sessions.
    ///
    /// Idempotent. When the entry was already overwritten by a newer
    /// session for the same user this is a no-op: the evicted session's
    /// teardown must not remove its replacement or announce an offline
    /// user who is still online.
    pub async fn unregister(&self, user_id: UserId, session_id: u64) {
        let removed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(&user_id) {
                Some(current) if current.session_id == session_id => sessions.remove(&user_id),
                _ => None,
            }
        };

        if let Some(removed) = removed {
            removed.close();
            self.broadcast_except(
                user_id,
                Envelope::presence(EnvelopeKind::UserOffline, &removed.username),
            )
            .await;
        }
    }

    /// Close every session and empty the registry. Subsequent deliveries
    /// return `false`.
    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.write().await;
        for (_, handle) in sessions.drain() {
            handle.close();
        }
    }

    /// The number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Try to enqueue `envelope` to every live session except
    /// `excluded_user_id`.
    ///
    /// Uses try-send over a snapshot taken under the shared lock: a peer
    /// with a full queue just misses this presence frame, which is
    /// acceptable because presence is idempotent at the next reconnect.
    async fn broadcast_except(&self, excluded_user_id: UserId, envelope: Envelope) {
        let peers: Vec<SessionHandle> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(user_id, _)| **user_id != excluded_user_id)
                .map(|(_, handle)| handle.clone())
                .collect()
        };

        for peer in peers {
            if peer.is_closing() {
                continue;
            }
            if peer.queue.try_send(envelope.clone()).is_err() {
                debug!(peer = %peer.username, "presence frame dropped, queue full");
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for Hub {
    /// Look up the recipient's session and attempt a bounded enqueue.
    ///
    /// The handle is cloned out under the shared lock; the enqueue itself
    /// never holds any lock, so one slow reader cannot stall the hub.
    async fn deliver_direct(&self, to_user_id: UserId, envelope: Envelope) -> bool {
        let handle = { self.sessions.read().await.get(&to_user_id).cloned() };
        let Some(handle) = handle else {
            return false;
        };
        if handle.is_closing() {
            return false;
        }

        handle
            .queue
            .send_timeout(envelope, ENQUEUE_TIMEOUT)
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn session_channel(
        capacity: usize,
    ) -> (
        mpsc::Sender<Envelope>,
        mpsc::Receiver<Envelope>,
        CancellationToken,
    ) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, rx, CancellationToken::new())
    }

    #[tokio::test]
    async fn delivers_to_a_registered_session() {
        let hub = Hub::new();
        let (tx, mut rx, closer) = session_channel(SESSION_QUEUE_CAPACITY);
        hub.register(2, "bob", tx, closer).await;

        let delivered = hub
            .deliver_direct(2, Envelope::direct_message(1, "alice", "hi"))
            .await;
        assert!(delivered);

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.kind, EnvelopeKind::DirectMessage);
        assert_eq!(frame.from.as_deref(), Some("alice"));
        assert_eq!(frame.body.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn delivery_to_an_absent_user_fails() {
        let hub = Hub::new();
        assert!(!hub.deliver_direct(42, Envelope::ack(None)).await);
    }

    #[tokio::test]
    async fn delivery_times_out_on_a_full_queue() {
        let hub = Hub::new();
        let (tx, _rx, closer) = session_channel(1);
        hub.register(2, "bob", tx.clone(), closer).await;
        tx.try_send(Envelope::ack(None)).unwrap();

        let started = std::time::Instant::now();
        let delivered = hub
            .deliver_direct(2, Envelope::direct_message(1, "alice", "hi"))
            .await;
        assert!(!delivered);
        assert!(started.elapsed() >= ENQUEUE_TIMEOUT);
    }

    #[tokio::test]
    async fn at_most_one_session_per_user() {
        let hub = Hub::new();
        let (tx_a, mut rx_a, closer_a) = session_channel(SESSION_QUEUE_CAPACITY);
        let (tx_b, mut rx_b, closer_b) = session_channel(SESSION_QUEUE_CAPACITY);

        hub.register(1, "alice", tx_a, closer_a.clone()).await;
        hub.register(1, "alice", tx_b, closer_b.clone()).await;

        assert_eq!(hub.session_count().await, 1);
        assert!(closer_a.is_cancelled());
        assert!(!closer_b.is_cancelled());

        // Deliveries reach the replacement only.
        assert!(hub.deliver_direct(1, Envelope::ack(Some(1))).await);
        assert!(rx_b.recv().await.is_some());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn replacement_emits_online_but_never_offline() {
        let hub = Hub::new();
        let (tx_bob, mut rx_bob, closer_bob) = session_channel(SESSION_QUEUE_CAPACITY);
        hub.register(2, "bob", tx_bob, closer_bob).await;

        let (tx_a, _rx_a, closer_a) = session_channel(SESSION_QUEUE_CAPACITY);
        let first = hub.register(1, "alice", tx_a, closer_a).await;
        let (tx_b, _rx_b, closer_b) = session_channel(SESSION_QUEUE_CAPACITY);
        hub.register(1, "alice", tx_b, closer_b).await;

        // The evicted session's teardown must be a no-op.
        hub.unregister(1, first).await;
        assert_eq!(hub.session_count().await, 2);

        let mut online = 0;
        let mut offline = 0;
        while let Ok(frame) = rx_bob.try_recv() {
            match frame.kind {
                EnvelopeKind::UserOnline => online += 1,
                EnvelopeKind::UserOffline => offline += 1,
                _ => {}
            }
        }
        assert_eq!(online, 2);
        assert_eq!(offline, 0);
    }

    #[tokio::test]
    async fn unregister_broadcasts_offline_once() {
        let hub = Hub::new();
        let (tx_bob, mut rx_bob, closer_bob) = session_channel(SESSION_QUEUE_CAPACITY);
        hub.register(2, "bob", tx_bob, closer_bob).await;
        let (tx_a, _rx_a, closer_a) = session_channel(SESSION_QUEUE_CAPACITY);
        let session = hub.register(1, "alice", tx_a, closer_a).await;

        hub.unregister(1, session).await;
        hub.unregister(1, session).await;

        let mut offline = 0;
        while let Ok(frame) = rx_bob.try_recv() {
            if frame.kind == EnvelopeKind::UserOffline {
                assert_eq!(frame.from.as_deref(), Some("alice"));
                offline += 1;
            }
        }
        assert_eq!(offline, 1);
        assert_eq!(hub.session_count().await, 1);
    }

    #[tokio::test]
    async fn presence_is_dropped_for_full_peers_only() {
        let hub = Hub::new();
        let (tx_full, _rx_full, closer_full) = session_channel(1);
        hub.register(2, "bob", tx_full.clone(), closer_full).await;
        tx_full.try_send(Envelope::ack(None)).unwrap();

        let (tx_ok, mut rx_ok, closer_ok) = session_channel(SESSION_QUEUE_CAPACITY);
        hub.register(3, "charlie", tx_ok, closer_ok).await;
        let (tx_a, _rx_a, closer_a) = session_channel(SESSION_QUEUE_CAPACITY);
        hub.register(1, "alice", tx_a, closer_a).await;

        let frame = rx_ok.recv().await.unwrap();
        assert_eq!(frame.kind, EnvelopeKind::UserOnline);
        assert_eq!(frame.from.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let hub = Hub::new();
        let (tx_a, _rx_a, closer_a) = session_channel(SESSION_QUEUE_CAPACITY);
        let (tx_b, _rx_b, closer_b) = session_channel(SESSION_QUEUE_CAPACITY);
        hub.register(1, "alice", tx_a, closer_a.clone()).await;
        hub.register(2, "bob", tx_b, closer_b.clone()).await;

        hub.shutdown().await;

        assert_eq!(hub.session_count().await, 0);
        assert!(closer_a.is_cancelled());
        assert!(closer_b.is_cancelled());
        assert!(!hub.deliver_direct(1, Envelope::ack(None)).await);
    }

    #[tokio::test]
    async fn delivery_to_a_closing_session_fails() {
        let hub = Hub::new();
        let (tx, _rx, closer) = session_channel(SESSION_QUEUE_CAPACITY);
        hub.register(2, "bob", tx, closer.clone()).await;

        closer.cancel();
        assert!(!hub.deliver_direct(2, Envelope::ack(None)).await);
    }
}
