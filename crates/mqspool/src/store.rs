//! SQLite Message Spool Implementation
//!
//! This module implements the [`MessageStore`] trait using SQLite as the
//! backend.
//!
//! ## What Does This Do?
//!
//! `SqliteMessageStore` is the durable buffer between an application
//! producer and an unreliable network link:
//!
//! - Producers store outbound messages
//! - The publisher loop drains them in priority/age order
//! - Publish / confirm callbacks advance each row's lifecycle
//! - The housekeeper purges terminal rows past the purge horizon
//!
//! ## Why SQLite?
//!
//! The spool lives on the device next to the producer. An embedded
//! database gives it zero-configuration durability, ACID transactions for
//! the store/confirm transitions, and indexed sub-millisecond next-message
//! lookups without a separate server process.
//!
//! ## Implementation Details
//!
//! ### Queries
//! Uses runtime queries (`sqlx::query` + `.bind`) rather than the
//! compile-time macros, so the crate builds without a `DATABASE_URL`.
//!
//! ### Transactions
//! Multi-statement operations (store, repair) run in an explicit
//! transaction; dropping an uncommitted transaction rolls it back on
//! every exit path. Single statements ride their own implicit
//! transaction.
//!
//! ### Serialisation
//! Every public operation holds the store's one mutex for its full
//! duration. Producers, the publisher loop and the housekeeper therefore
//! never interleave against the database, which makes the
//! count-then-insert capacity check and the purge sweeps race-free. The
//! cost is throughput; for a device-local spool that trade is fine.
//!
//! ### Message Identity
//! Ids are allocated from the `message_id_seq` side table inside the
//! insert transaction. When the sequence passes `MAX_MESSAGE_ID` the
//! store resets it to 0 and retries the insert exactly once; a retry that
//! collides with a still-extant low id fails on the unique index and
//! surfaces. Duplicate-id damage from outside interference is handled by
//! [`repair`](crate::MessageStore::repair).
//!
//! ## Thread Safety
//!
//! `SqliteMessageStore` is Send + Sync and is shared as
//! `Arc<SqliteMessageStore>` between the producer side, the publisher
//! loop and the housekeeper.

use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SpoolError};
use crate::schema;
use crate::types::{
    Message, MessageBuilder, Qos, MAX_MESSAGE_ID, MAX_PAYLOAD_BYTES, MAX_TOPIC_LENGTH,
    PRIORITY_LIFECYCLE, PRIORITY_REMOTE_MANAGEMENT,
};
use crate::MessageStore;

/// Horizon used when the requested purge age overflows the cutoff
/// arithmetic: everything older than one year is purged instead.
const ONE_YEAR_MS: i64 = 365 * 24 * 60 * 60 * 1000;

const MESSAGE_COLUMNS: &str = "id, topic, qos, retain, created_on, published_on, \
     published_message_id, confirmed_on, payload, priority, session_id, dropped_on";

const MESSAGE_COLUMNS_NO_PAYLOAD: &str = "id, topic, qos, retain, created_on, published_on, \
     published_message_id, confirmed_on, priority, session_id, dropped_on";

/// SQLite-backed message spool.
pub struct SqliteMessageStore {
    pool: SqlitePool,
    /// Row cap for priorities >= 2; lifecycle and remote-management
    /// traffic bypasses it.
    capacity: AtomicU32,
    /// Serialises every public operation.
    op_lock: Mutex<()>,
}

impl SqliteMessageStore {
    /// Opens (creating if missing) a file-backed spool and initialises
    /// its schema.
    pub async fn new<P: AsRef<Path>>(path: P, capacity: u32) -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))?
                .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        schema::initialize(&pool).await?;

        Ok(Self {
            pool,
            capacity: AtomicU32::new(capacity),
            op_lock: Mutex::new(()),
        })
    }

    /// Creates an in-memory spool (for tests and ephemeral deployments).
    ///
    /// The pool is pinned to a single never-recycled connection: each
    /// SQLite in-memory connection is its own database, so a wider pool
    /// would hand out empty databases.
    pub async fn new_in_memory(capacity: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        schema::initialize(&pool).await?;

        Ok(Self {
            pool,
            capacity: AtomicU32::new(capacity),
            op_lock: Mutex::new(()),
        })
    }

    /// Returns the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Returns the configured row cap.
    pub fn capacity(&self) -> u32 {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Applies a new row cap; takes effect on the next store.
    pub fn set_capacity(&self, capacity: u32) {
        self.capacity.store(capacity, Ordering::Relaxed);
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Inserts one row, allocating its id from `message_id_seq`, all in
    /// one transaction. Also runs the capacity check for application
    /// priorities so the count it acts on cannot go stale.
    async fn insert_message(
        &self,
        topic: &str,
        payload: &[u8],
        qos: Qos,
        retain: bool,
        priority: u32,
    ) -> Result<u32> {
        let now = Self::now_ms();
        let mut tx = self.pool.begin().await?;

        if priority != PRIORITY_LIFECYCLE && priority != PRIORITY_REMOTE_MANAGEMENT {
            let count = sqlx::query("SELECT COUNT(*) AS count FROM messages")
                .fetch_one(&mut *tx)
                .await?
                .get::<i64, _>("count") as u32;
            debug!("store message count: {}", count);

            let capacity = self.capacity.load(Ordering::Relaxed);
            if count >= capacity {
                error!("store capacity exceeded");
                return Err(SpoolError::CapacityReached { count, capacity });
            }
        }

        let next_id = sqlx::query("SELECT next_id FROM message_id_seq")
            .fetch_one(&mut *tx)
            .await?
            .get::<i64, _>("next_id");
        if next_id < 0 || next_id > MAX_MESSAGE_ID as i64 {
            return Err(SpoolError::IdentityExhausted);
        }

        sqlx::query("UPDATE message_id_seq SET next_id = ?")
            .bind(next_id + 1)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO messages (id, topic, qos, retain, created_on, published_on, \
             published_message_id, confirmed_on, payload, priority, session_id, dropped_on) \
             VALUES (?, ?, ?, ?, ?, NULL, -1, NULL, ?, ?, NULL, NULL)",
        )
        .bind(next_id)
        .bind(topic)
        .bind(i32::from(qos.as_u8()))
        .bind(retain)
        .bind(now)
        .bind(payload)
        .bind(priority as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(next_id as u32)
    }

    /// Restarts the id sequence at 0. Effective immediately: the next
    /// insert allocates id 0.
    async fn reset_identity_sequence(&self) -> Result<()> {
        sqlx::query("UPDATE message_id_seq SET next_id = 0")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_message(&self, id: u32) -> Result<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
        ))
        .bind(id as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| message_from_row(&r, true)).transpose()
    }

    async fn list_messages(&self, sql: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(|r| message_from_row(r, false)).collect()
    }

    /// Stamps `now` into the timestamp column named by `sql` for one row.
    async fn update_timestamp(&self, sql: &str, id: u32) -> Result<()> {
        sqlx::query(sql)
            .bind(Self::now_ms())
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Purges terminal rows older than `purge_age`, checking `cancel`
    /// between the three sweeps so a housekeeper shutdown is observed
    /// between statements rather than mid-sweep.
    pub(crate) async fn delete_stale_with_cancel(
        &self,
        purge_age: Duration,
        cancel: Option<&AtomicBool>,
    ) -> Result<u64> {
        let _guard = self.op_lock.lock().await;
        self.delete_stale_locked(purge_age, cancel).await
    }

    async fn delete_stale_locked(
        &self,
        purge_age: Duration,
        cancel: Option<&AtomicBool>,
    ) -> Result<u64> {
        let cutoff = purge_cutoff(Self::now_ms(), purge_age);
        let sweeps = [
            (
                "dropped",
                "DELETE FROM messages WHERE dropped_on IS NOT NULL AND dropped_on < ?",
            ),
            (
                "confirmed",
                "DELETE FROM messages WHERE confirmed_on IS NOT NULL AND confirmed_on < ?",
            ),
            (
                "fire-and-forget",
                "DELETE FROM messages WHERE qos = 0 AND published_on IS NOT NULL AND published_on < ?",
            ),
        ];

        let mut deleted = 0u64;
        for (kind, sql) in sweeps {
            if let Some(flag) = cancel {
                if flag.load(Ordering::Relaxed) {
                    debug!("purge cancelled before the {} sweep", kind);
                    return Ok(deleted);
                }
            }
            let swept = sqlx::query(sql)
                .bind(cutoff)
                .execute(&self.pool)
                .await?
                .rows_affected();
            if swept > 0 {
                info!("purged {} stale {} messages", swept, kind);
            }
            deleted += swept;
        }
        Ok(deleted)
    }

    async fn checkpoint_locked(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn defrag_locked(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    async fn repair_locked(&self) -> Result<()> {
        let duplicated_ids = sqlx::query(
            "SELECT COUNT(*) AS count FROM \
             (SELECT id FROM messages GROUP BY id HAVING COUNT(id) > 1)",
        )
        .fetch_one(&self.pool)
        .await?
        .get::<i64, _>("count");

        if duplicated_ids <= 0 {
            return Ok(());
        }

        error!(
            "found {} message ids with duplicate rows, attempting repair",
            duplicated_ids
        );

        let mut tx = self.pool.begin().await?;

        sqlx::query(schema::DROP_MESSAGES_ID_INDEX)
            .execute(&mut *tx)
            .await?;
        debug!("unique id index dropped");

        // Removes every copy of a duplicated id: once an id is ambiguous
        // the store can no longer attribute publish/confirm callbacks, so
        // every copy is suspect.
        let removed = sqlx::query(
            "DELETE FROM messages WHERE id IN \
             (SELECT id FROM messages GROUP BY id HAVING COUNT(*) > 1)",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();
        debug!("{} duplicate rows deleted", removed);

        sqlx::query(schema::CREATE_MESSAGES_ID_INDEX)
            .execute(&mut *tx)
            .await?;
        debug!("unique id index recreated");

        tx.commit().await?;

        self.defrag_locked().await?;
        info!(
            "repair complete: removed {} rows across {} duplicated ids",
            removed, duplicated_ids
        );
        Ok(())
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn store(
        &self,
        topic: &str,
        payload: &[u8],
        qos: Qos,
        retain: bool,
        priority: u32,
    ) -> Result<Message> {
        if topic.trim().is_empty() {
            return Err(SpoolError::InvalidArgument(
                "topic must not be blank".to_string(),
            ));
        }
        if topic.chars().count() > MAX_TOPIC_LENGTH {
            return Err(SpoolError::InvalidArgument(format!(
                "topic exceeds {} characters",
                MAX_TOPIC_LENGTH
            )));
        }
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(SpoolError::InvalidArgument(format!(
                "payload exceeds {} bytes",
                MAX_PAYLOAD_BYTES
            )));
        }

        let _guard = self.op_lock.lock().await;

        let id = match self.insert_message(topic, payload, qos, retain, priority).await {
            Ok(id) => id,
            Err(SpoolError::IdentityExhausted) => {
                warn!("message id space exhausted, restarting the id sequence at 0");
                self.reset_identity_sequence().await?;
                self.insert_message(topic, payload, qos, retain, priority)
                    .await?
            }
            Err(e) => return Err(e),
        };

        self.get_message(id).await?.ok_or_else(|| {
            SpoolError::Corruption(format!("stored message {} not found on readback", id))
        })
    }

    async fn get(&self, id: u32) -> Result<Option<Message>> {
        let _guard = self.op_lock.lock().await;
        self.get_message(id).await
    }

    async fn next_message(&self) -> Result<Option<Message>> {
        let _guard = self.op_lock.lock().await;
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE published_on IS NULL \
             ORDER BY priority ASC, created_on ASC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| message_from_row(&r, true)).transpose()
    }

    async fn published(&self, id: u32) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.update_timestamp("UPDATE messages SET published_on = ? WHERE id = ?", id)
            .await
    }

    async fn published_in_flight(
        &self,
        id: u32,
        published_message_id: i32,
        session_id: &str,
    ) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        sqlx::query(
            "UPDATE messages SET published_on = ?, published_message_id = ?, session_id = ? \
             WHERE id = ?",
        )
        .bind(Self::now_ms())
        .bind(published_message_id)
        .bind(session_id)
        .bind(id as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn confirmed(&self, id: u32) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.update_timestamp("UPDATE messages SET confirmed_on = ? WHERE id = ?", id)
            .await
    }

    async fn all_unpublished_no_payload(&self) -> Result<Vec<Message>> {
        let _guard = self.op_lock.lock().await;
        self.list_messages(&format!(
            "SELECT {MESSAGE_COLUMNS_NO_PAYLOAD} FROM messages WHERE published_on IS NULL \
             ORDER BY priority ASC, created_on ASC"
        ))
        .await
    }

    async fn all_in_flight_no_payload(&self) -> Result<Vec<Message>> {
        let _guard = self.op_lock.lock().await;
        self.list_messages(&format!(
            "SELECT {MESSAGE_COLUMNS_NO_PAYLOAD} FROM messages WHERE published_on IS NOT NULL \
             AND qos > 0 AND confirmed_on IS NULL AND dropped_on IS NULL \
             ORDER BY priority ASC, created_on ASC"
        ))
        .await
    }

    async fn all_dropped_no_payload(&self) -> Result<Vec<Message>> {
        let _guard = self.op_lock.lock().await;
        self.list_messages(&format!(
            "SELECT {MESSAGE_COLUMNS_NO_PAYLOAD} FROM messages WHERE dropped_on IS NOT NULL \
             ORDER BY priority ASC, created_on ASC"
        ))
        .await
    }

    async fn unpublish_all_in_flight(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        // Also clears the transport identity so an unpublished row never
        // carries a broker id or session from its previous attempt.
        sqlx::query(
            "UPDATE messages SET published_on = NULL, published_message_id = -1, \
             session_id = NULL WHERE published_on IS NOT NULL AND qos > 0 \
             AND confirmed_on IS NULL AND dropped_on IS NULL",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn drop_all_in_flight(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        sqlx::query(
            "UPDATE messages SET dropped_on = ? WHERE published_on IS NOT NULL AND qos > 0 \
             AND confirmed_on IS NULL",
        )
        .bind(Self::now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_stale_messages(&self, purge_age: Duration) -> Result<u64> {
        self.delete_stale_with_cancel(purge_age, None).await
    }

    async fn checkpoint(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.checkpoint_locked().await
    }

    async fn defrag(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.defrag_locked().await
    }

    async fn repair(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.repair_locked().await
    }
}

/// Computes the purge cutoff, falling back to the one-year horizon when
/// the requested age overflows the millisecond arithmetic.
fn purge_cutoff(now: i64, purge_age: Duration) -> i64 {
    let horizon = i64::try_from(purge_age.as_millis()).ok();
    match horizon.and_then(|h| now.checked_sub(h)) {
        Some(cutoff) => cutoff,
        None => {
            info!("purge age overflows the cutoff arithmetic, purging rows older than one year");
            now - ONE_YEAR_MS
        }
    }
}

fn message_from_row(row: &SqliteRow, with_payload: bool) -> Result<Message> {
    let qos_raw = row.get::<i64, _>("qos");
    let qos = u8::try_from(qos_raw)
        .ok()
        .and_then(Qos::from_u8)
        .ok_or_else(|| SpoolError::Corruption(format!("invalid qos {} on message row", qos_raw)))?;

    let mut builder = MessageBuilder::new(row.get::<i64, _>("id") as u32)
        .with_topic(row.get::<String, _>("topic"))
        .with_qos(qos)
        .with_retain(row.get::<bool, _>("retain"))
        .with_priority(row.get::<i64, _>("priority") as u32)
        .with_created_on(row.get::<i64, _>("created_on"))
        .with_published_on(row.get::<Option<i64>, _>("published_on"))
        .with_published_message_id(row.get::<i64, _>("published_message_id") as i32)
        .with_session_id(row.get::<Option<String>, _>("session_id"))
        .with_confirmed_on(row.get::<Option<i64>, _>("confirmed_on"))
        .with_dropped_on(row.get::<Option<i64>, _>("dropped_on"));

    if with_payload {
        if let Some(payload) = row.get::<Option<Vec<u8>>, _>("payload") {
            builder = builder.with_payload(payload);
        }
    }

    Ok(builder.build())
}
