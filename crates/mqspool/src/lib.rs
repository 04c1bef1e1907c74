//! MQSpool Message Store
//!
//! This crate implements the durable message spool that backs an
//! MQTT-style publisher: an embedded on-disk queue sitting between an
//! application producer and an unreliable network link.
//!
//! ## Purpose
//!
//! While the MQTT client owns the wire, the spool owns every outbound
//! message from the moment it is produced until it is confirmed (or given
//! up on) and purged:
//!
//! - **Store**: accept outbound messages, durably, with a capacity cap
//! - **Drain**: hand messages to the transport in priority/age order
//! - **Track**: advance each message through its publish lifecycle
//! - **Reclaim**: purge terminal rows past the purge horizon
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐
//! │   Producer   │
//! └──────┬───────┘
//!        │ store
//!        ▼
//! ┌──────────────┐   next / published    ┌─────────────────┐
//! │    Spool     │ ◄───────────────────► │ Publisher loop  │ ──▶ broker
//! │   (SQLite)   │      confirmed        └─────────────────┘
//! └──────┬───────┘
//!        │ purge / checkpoint
//! ┌──────┴───────┐
//! │ Housekeeper  │
//! └──────────────┘
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mqspool::{Housekeeper, HousekeeperConfig, MessageStore, Qos, SqliteMessageStore};
//!
//! // Open the spool (creates schema on first run)
//! let store = Arc::new(SqliteMessageStore::new("spool.db", 10_000).await?);
//!
//! // Start maintenance
//! let housekeeper = Housekeeper::start(Arc::clone(&store), HousekeeperConfig::default());
//!
//! // Producer side
//! let message = store
//!     .store("site/device/telemetry", b"23.4C", Qos::AtLeastOnce, false, 5)
//!     .await?;
//!
//! // Publisher loop
//! if let Some(next) = store.next_message().await? {
//!     // ... hand to the transport ...
//!     store.published_in_flight(next.id, 17, "session-1").await?;
//! }
//!
//! // Broker acknowledged
//! store.confirmed(message.id).await?;
//!
//! // Shutdown
//! housekeeper.stop().await;
//! ```
//!
//! ## Delivery Semantics
//!
//! The spool provides at-most-one-delivery per stored row: `next_message`
//! takes no row lock, so a publisher that crashes before calling
//! `published` sees the same message again, and a row once published is
//! never handed out again unless the session explicitly unpublishes its
//! in-flight set after a transport loss.
//!
//! ## Thread Safety
//!
//! `SqliteMessageStore` is Send + Sync and is shared via
//! `Arc<dyn MessageStore>`. Every operation is serialised on the store's
//! single mutex: producers, the publisher loop and the housekeeper never
//! interleave against the database.

pub mod error;
pub mod housekeeper;
mod schema;
pub mod store;
pub mod types;

pub use error::{Result, SpoolError};
pub use housekeeper::{Housekeeper, HousekeeperConfig};
pub use store::SqliteMessageStore;
pub use types::{
    Message, MessageBuilder, MessageState, Qos, MAX_MESSAGE_ID, MAX_PAYLOAD_BYTES,
    MAX_TOPIC_LENGTH, PRIORITY_LIFECYCLE, PRIORITY_REMOTE_MANAGEMENT,
};

use async_trait::async_trait;
use std::time::Duration;

/// Message store trait - the contract between the spool and its
/// publisher/session layer.
///
/// Implemented by [`SqliteMessageStore`]; kept as a trait so the
/// publisher loop and session glue depend on the contract, not the
/// backend, and so tests can substitute instrumented stores.
///
/// ## Thread Safety
///
/// Implementations must be Send + Sync and safe to share via
/// `Arc<dyn MessageStore>`.
///
/// ## Error Handling
///
/// All methods return `Result<T>` (`Result<T, SpoolError>`). Backend
/// faults roll back their transaction before propagating as
/// `SpoolError::Database`.
#[async_trait]
pub trait MessageStore: Send + Sync {
    // ============================================================
    // PRODUCER OPERATIONS
    // ============================================================

    /// Stores an outbound message and returns the persisted row.
    ///
    /// The row is committed with `created_on` set to the current UTC
    /// time, all lifecycle timestamps unset and `published_message_id`
    /// -1; the returned `Message` is the freshly loaded row, payload
    /// included. Once this returns, the next `next_message` call is
    /// guaranteed to observe the row.
    ///
    /// # Arguments
    ///
    /// * `topic` - Destination topic; must not be blank
    /// * `payload` - Message body, up to 16 MiB
    /// * `qos` - Requested quality of service
    /// * `retain` - MQTT retain flag
    /// * `priority` - Scheduling priority; 0 is reserved for lifecycle
    ///   traffic, 1 for remote management, applications use >= 2
    ///
    /// # Errors
    ///
    /// - `InvalidArgument`: blank topic, oversized topic or payload
    /// - `CapacityReached`: the store is at capacity and `priority >= 2`.
    ///   Priorities 0 and 1 bypass the cap - lifecycle and
    ///   remote-management traffic must flow even when the spool is full.
    /// - `IdentityExhausted`: the id sequence wrapped and the single
    ///   retry after resetting it also failed
    /// - `Database`: any other backend fault (rolled back)
    async fn store(
        &self,
        topic: &str,
        payload: &[u8],
        qos: Qos,
        retain: bool,
        priority: u32,
    ) -> Result<Message>;

    /// Gets one message by id, payload included.
    ///
    /// Returns `Ok(None)` when no row has this id.
    async fn get(&self, id: u32) -> Result<Option<Message>>;

    // ============================================================
    // PUBLISHER OPERATIONS
    // ============================================================

    /// Returns the next message to publish: the highest-priority, oldest
    /// unpublished row (payload included), or `None` when the spool has
    /// nothing to send.
    ///
    /// Lower priority numbers win; equal priority falls back to the
    /// earlier `created_on`. Messages stored within the same millisecond
    /// tie and drain in an unspecified order.
    ///
    /// # Note
    ///
    /// No row lock is taken. A caller that does not follow up with
    /// [`published`](Self::published) receives the same row on the next
    /// call.
    async fn next_message(&self) -> Result<Option<Message>>;

    /// Marks a message as handed to the transport (fire-and-forget
    /// form): sets `published_on` to the current UTC time.
    ///
    /// Calling this again overwrites the timestamp.
    async fn published(&self, id: u32) -> Result<()>;

    /// Marks a QoS >= 1 message as handed to the transport: sets
    /// `published_on`, the broker-assigned `published_message_id` and
    /// the publishing `session_id`.
    async fn published_in_flight(
        &self,
        id: u32,
        published_message_id: i32,
        session_id: &str,
    ) -> Result<()>;

    /// Records the broker's acknowledgement: sets `confirmed_on` to the
    /// current UTC time. The row is retained until the purge horizon.
    async fn confirmed(&self, id: u32) -> Result<()>;

    // ============================================================
    // SESSION OPERATIONS
    // ============================================================

    /// Returns all unpublished messages, payload stripped, ordered by
    /// `(priority, created_on)`.
    async fn all_unpublished_no_payload(&self) -> Result<Vec<Message>>;

    /// Returns all in-flight messages (published, QoS > 0, neither
    /// confirmed nor dropped), payload stripped, ordered by
    /// `(priority, created_on)`.
    async fn all_in_flight_no_payload(&self) -> Result<Vec<Message>>;

    /// Returns all dropped messages, payload stripped, ordered by
    /// `(priority, created_on)`.
    async fn all_dropped_no_payload(&self) -> Result<Vec<Message>>;

    /// Returns every in-flight message to the unpublished queue.
    ///
    /// Session-resume path: after a transport loss, unconfirmed QoS > 0
    /// messages rejoin the queue (their broker id and session cleared)
    /// and are handed out again by [`next_message`](Self::next_message)
    /// in `(priority, created_on)` order - ahead of any strictly newer
    /// row of equal priority.
    async fn unpublish_all_in_flight(&self) -> Result<()>;

    /// Marks every in-flight message as dropped.
    ///
    /// Session-abandon path: the producer has lost faith in these
    /// transmissions but keeps the rows for diagnostics until the purge
    /// horizon.
    async fn drop_all_in_flight(&self) -> Result<()>;

    // ============================================================
    // MAINTENANCE OPERATIONS
    // ============================================================

    /// Purges terminal rows older than `purge_age`, in three sweeps:
    /// dropped, confirmed, and published fire-and-forget rows. Returns
    /// the number of rows deleted.
    ///
    /// A `purge_age` too large for the cutoff arithmetic is not an
    /// error: the affected sweep falls back to purging everything older
    /// than one year.
    async fn delete_stale_messages(&self, purge_age: Duration) -> Result<u64>;

    /// Flushes backend pages to durable storage.
    async fn checkpoint(&self) -> Result<()>;

    /// Flushes and compacts the backend, reclaiming disk space.
    async fn defrag(&self) -> Result<()>;

    /// Detects and removes duplicate-id rows, then rebuilds the unique
    /// id index. Intended to run once at boot.
    ///
    /// A corruption-free store makes this a no-op. When duplicates are
    /// found, *all* rows of every duplicated id are removed - once an id
    /// is ambiguous, publish and confirm callbacks can no longer be
    /// attributed to a row, so every copy is suspect.
    async fn repair(&self) -> Result<()>;
}
