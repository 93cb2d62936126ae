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

//! SQLite-backed implementation of the message store.
//!
//! Two tables: an append-only `messages` log with a monotonic rowid, and a
//! `message_deliveries` receipt row per message upserted with a
//! first-write-wins `COALESCE` idiom. Receipt timestamps are never
//! overwritten once set.

use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use time::OffsetDateTime;

use courier_core::messaging::{
    Cursor, MessageQuery, MessageStore, StoreError, StoredMessage, UserId,
};

/// The embedded schema migrations, applied in filename-sorted order.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Open (or create) the database at `path` and bring the schema up to
/// date.
pub async fn connect(path: &str) -> Result<SqlitePool, sqlx::Error> {
    if path == ":memory:" || path == "sqlite::memory:" {
        return connect_memory().await;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

/// Open a fresh in-memory database with the schema applied.
///
/// The pool is pinned to a single connection: each SQLite `:memory:`
/// connection is its own database, so a wider pool would scatter the
/// tables.
pub async fn connect_memory() -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .in_memory(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

/// The SQLite adapter behind [`MessageStore`].
#[derive(Clone)]
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

enum Mailbox {
    Inbox,
    Outbox,
}

impl SqliteMessageStore {
    /// Wrap an open pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn get_by_id(&self, message_id: i64) -> Result<StoredMessage, StoreError> {
        let row = sqlx::query(
            "SELECT m.id, m.from_user_id, m.to_user_id, m.body, m.created_at, \
                    d.delivered_at, d.read_at \
             FROM messages m \
             LEFT JOIN message_deliveries d ON d.message_id = m.id \
             WHERE m.id = ?",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        match row {
            Some(row) => scan_message(&row),
            None => Err(StoreError::MessageNotFound),
        }
    }

    async fn list(
        &self,
        mailbox: Mailbox,
        user_id: UserId,
        query: &MessageQuery,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let mut sql = String::from(
            "SELECT m.id, m.from_user_id, m.to_user_id, m.body, m.created_at, \
                    d.delivered_at, d.read_at \
             FROM messages m \
             LEFT JOIN message_deliveries d ON d.message_id = m.id \
             WHERE ",
        );
        sql.push_str(match mailbox {
            Mailbox::Inbox => "m.to_user_id = ?",
            Mailbox::Outbox => "m.from_user_id = ?",
        });

        match query.cursor {
            Some(Cursor::Before(_)) => sql.push_str(" AND m.id < ?"),
            Some(Cursor::After(_)) => sql.push_str(" AND m.id > ?"),
            None => {}
        }
        if query.with_user_id.is_some() {
            sql.push_str(match mailbox {
                Mailbox::Inbox => " AND m.from_user_id = ?",
                Mailbox::Outbox => " AND m.to_user_id = ?",
            });
        }
        if query.unread_only {
            sql.push_str(" AND d.read_at IS NULL");
        }

        // Backward pages walk history newest-first; forward pages return
        // the canonical ascending order.
        sql.push_str(match query.cursor {
            Some(Cursor::After(_)) => " ORDER BY m.id ASC LIMIT ?",
            _ => " ORDER BY m.id DESC LIMIT ?",
        });

        let mut stmt = sqlx::query(&sql).bind(user_id);
        match query.cursor {
            Some(Cursor::Before(id)) | Some(Cursor::After(id)) => stmt = stmt.bind(id),
            None => {}
        }
        if let Some(counterparty) = query.with_user_id {
            stmt = stmt.bind(counterparty);
        }
        stmt = stmt.bind(query.limit);

        let rows = stmt.fetch_all(&self.pool).await.map_err(storage)?;
        rows.iter().map(scan_message).collect()
    }

    /// `INSERT .. ON CONFLICT` receipt upsert against any executor, so the
    /// recipient-scoped variants can run it inside their transaction.
    async fn upsert_receipt<'e, E>(
        executor: E,
        message_id: i64,
        delivered_at: OffsetDateTime,
        read_at: Option<OffsetDateTime>,
    ) -> Result<(), StoreError>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        // COALESCE keeps the first-written timestamp; a later mark never
        // moves it.
        let sql = match read_at {
            Some(_) => {
                "INSERT INTO message_deliveries (message_id, delivered_at, read_at) \
                 VALUES (?, ?, ?) \
                 ON CONFLICT(message_id) DO UPDATE SET \
                     delivered_at = COALESCE(message_deliveries.delivered_at, excluded.delivered_at), \
                     read_at = COALESCE(message_deliveries.read_at, excluded.read_at)"
            }
            None => {
                "INSERT INTO message_deliveries (message_id, delivered_at) \
                 VALUES (?, ?) \
                 ON CONFLICT(message_id) DO UPDATE SET \
                     delivered_at = COALESCE(message_deliveries.delivered_at, excluded.delivered_at)"
            }
        };

        let mut stmt = sqlx::query(sql).bind(message_id).bind(delivered_at);
        if let Some(read_at) = read_at {
            stmt = stmt.bind(read_at);
        }
        stmt.execute(executor).await.map_err(storage)?;
        Ok(())
    }

    /// Run a receipt upsert only if the message is addressed to
    /// `recipient_user_id`, atomically.
    async fn mark_for_recipient(
        &self,
        recipient_user_id: UserId,
        message_id: i64,
        delivered_at: OffsetDateTime,
        read_at: Option<OffsetDateTime>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let addressed = sqlx::query("SELECT 1 FROM messages WHERE id = ? AND to_user_id = ?")
            .bind(message_id)
            .bind(recipient_user_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?;
        if addressed.is_none() {
            // Dropping the transaction rolls back; absence and scope
            // violation are indistinguishable to the caller.
            return Err(StoreError::MessageNotFound);
        }

        Self::upsert_receipt(&mut *tx, message_id, delivered_at, read_at).await?;
        tx.commit().await.map_err(storage)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl MessageStore for SqliteMessageStore {
    async fn save_direct_message(
        &self,
        from_user_id: UserId,
        to_user_id: UserId,
        body: &str,
    ) -> Result<StoredMessage, StoreError> {
        let result = sqlx::query(
            "INSERT INTO messages (from_user_id, to_user_id, body) VALUES (?, ?, ?)",
        )
        .bind(from_user_id)
        .bind(to_user_id)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        self.get_by_id(result.last_insert_rowid()).await
    }

    async fn mark_delivered(&self, message_id: i64, at: OffsetDateTime) -> Result<(), StoreError> {
        Self::upsert_receipt(&self.pool, message_id, at, None).await
    }

    async fn mark_read(&self, message_id: i64, at: OffsetDateTime) -> Result<(), StoreError> {
        // Reading implies delivery: an unset delivered_at is filled with
        // the same instant.
        Self::upsert_receipt(&self.pool, message_id, at, Some(at)).await
    }

    async fn mark_delivered_for_recipient(
        &self,
        recipient_user_id: UserId,
        message_id: i64,
        at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        self.mark_for_recipient(recipient_user_id, message_id, at, None)
            .await
    }

    async fn mark_read_for_recipient(
        &self,
        recipient_user_id: UserId,
        message_id: i64,
        at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        self.mark_for_recipient(recipient_user_id, message_id, at, Some(at))
            .await
    }

    async fn get_message_for_recipient(
        &self,
        recipient_user_id: UserId,
        message_id: i64,
    ) -> Result<StoredMessage, StoreError> {
        let message = self.get_by_id(message_id).await?;
        if message.to_user_id != recipient_user_id {
            return Err(StoreError::MessageNotFound);
        }
        Ok(message)
    }

    async fn list_inbox(
        &self,
        user_id: UserId,
        query: &MessageQuery,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.list(Mailbox::Inbox, user_id, query).await
    }

    async fn list_outbox(
        &self,
        user_id: UserId,
        query: &MessageQuery,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.list(Mailbox::Outbox, user_id, query).await
    }
}

fn scan_message(row: &SqliteRow) -> Result<StoredMessage, StoreError> {
    Ok(StoredMessage {
        id: row.try_get("id").map_err(storage)?,
        from_user_id: row.try_get("from_user_id").map_err(storage)?,
        to_user_id: row.try_get("to_user_id").map_err(storage)?,
        body: row.try_get("body").map_err(storage)?,
        created_at: row.try_get("created_at").map_err(storage)?,
        delivered_at: row.try_get("delivered_at").map_err(storage)?,
        read_at: row.try_get("read_at").map_err(storage)?,
    })
}

fn storage(err: impl std::fmt::Display) -> StoreError {
    StoreError::Storage(err.to_string())
}
