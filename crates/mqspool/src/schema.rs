//! Spool Schema Management
//!
//! Creates and upgrades the on-disk layout on every store open. All
//! statements are idempotent (`IF [NOT] EXISTS`), so a re-run against an
//! already-initialised database is a no-op rather than an error.
//!
//! ## Layout
//!
//! - `messages`: one row per spooled message. `id` is a plain integer
//!   column; the `messages_id` unique index stands in for the primary key
//!   so the repair routine can drop and rebuild it.
//! - `messages_next_msg`: composite index serving the publisher's
//!   next-message query and the priority/age listings.
//! - `message_id_seq`: single-row table holding the next id to assign.
//!   Ids are allocated from here inside the insert transaction, which
//!   keeps the sequence restartable without a process restart.
//!
//! ## Migration
//!
//! Early builds indexed `messages` on `published_on` alone; that index is
//! dropped on startup if present, replaced by `messages_next_msg`.

use sqlx::SqlitePool;

use crate::error::Result;

const CREATE_MESSAGES_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS messages (
        id                   INTEGER NOT NULL,
        topic                TEXT    NOT NULL,
        qos                  INTEGER NOT NULL,
        retain               INTEGER NOT NULL,
        created_on           INTEGER NOT NULL,
        published_on         INTEGER,
        published_message_id INTEGER NOT NULL DEFAULT -1,
        confirmed_on         INTEGER,
        payload              BLOB,
        priority             INTEGER NOT NULL,
        session_id           TEXT,
        dropped_on           INTEGER
    )";

pub(crate) const CREATE_MESSAGES_ID_INDEX: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS messages_id ON messages (id)";

pub(crate) const DROP_MESSAGES_ID_INDEX: &str = "DROP INDEX IF EXISTS messages_id";

const DROP_LEGACY_PUBLISHED_ON_INDEX: &str = "DROP INDEX IF EXISTS messages_published_on";

const CREATE_NEXT_MSG_INDEX: &str = "CREATE INDEX IF NOT EXISTS messages_next_msg \
     ON messages (priority ASC, created_on ASC, published_on, qos)";

const CREATE_ID_SEQ_TABLE: &str =
    "CREATE TABLE IF NOT EXISTS message_id_seq (next_id INTEGER NOT NULL)";

const SEED_ID_SEQ: &str = "INSERT INTO message_id_seq (next_id) \
     SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM message_id_seq)";

/// Creates the spool tables and indexes, upgrading legacy layouts.
///
/// Any failure other than the tolerated already-exists re-runs (absorbed
/// by the `IF EXISTS` forms) aborts the open.
pub(crate) async fn initialize(pool: &SqlitePool) -> Result<()> {
    sqlx::query(CREATE_MESSAGES_TABLE).execute(pool).await?;
    sqlx::query(CREATE_MESSAGES_ID_INDEX).execute(pool).await?;
    sqlx::query(DROP_LEGACY_PUBLISHED_ON_INDEX).execute(pool).await?;
    sqlx::query(CREATE_NEXT_MSG_INDEX).execute(pool).await?;
    sqlx::query(CREATE_ID_SEQ_TABLE).execute(pool).await?;
    sqlx::query(SEED_ID_SEQ).execute(pool).await?;
    Ok(())
}
