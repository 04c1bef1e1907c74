//! Message Type Definitions
//!
//! This module defines the data structures used by the spool.
//!
//! ## Types Overview
//!
//! ### Message
//! A snapshot of one stored row. Messages are immutable values: the store
//! returns fresh copies and never hands out references into its own state.
//! Listing operations strip the payload (`payload: None`) to keep large
//! blobs out of diagnostic paths.
//!
//! ### MessageBuilder
//! Builder for `Message`, seeded with the store-assigned id. Used by the
//! store when materialising rows; also convenient for tests.
//!
//! ### Qos
//! Closed MQTT quality-of-service enum. An out-of-range qos cannot enter
//! through the API; one read back from a damaged row surfaces as a
//! corruption error in the store.
//!
//! ### MessageState
//! The lifecycle state derived from the timestamp columns:
//!
//! ```text
//!             store()
//!   (none) ──────────────▶ Unpublished
//!                              │ published()
//!              qos = 0         ▼         qos > 0
//!         ┌────────── PublishedFireAndForget / InFlight ──────────┐
//!         │ purge                  confirmed() │     drop()       │
//!         ▼                                    ▼                  ▼
//!     (deleted)                            Confirmed           Dropped
//!                                              │ purge            │ purge
//!                                              ▼                  ▼
//!                                          (deleted)          (deleted)
//! ```
//!
//! ## Design Decisions
//!
//! - Timestamps are i64 milliseconds since the Unix epoch, always taken
//!   from the UTC clock; no timezone is ever persisted.
//! - All types are Serialize/Deserialize for diagnostic surfaces.

use serde::{Deserialize, Serialize};

/// Maximum accepted topic length, in characters.
pub const MAX_TOPIC_LENGTH: usize = 32_767;

/// Maximum accepted payload size, in bytes (16 MiB).
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Highest id the store assigns before restarting the id sequence at 0.
pub const MAX_MESSAGE_ID: u32 = i32::MAX as u32;

/// Priority reserved for lifecycle traffic (birth/death certificates).
pub const PRIORITY_LIFECYCLE: u32 = 0;

/// Priority reserved for remote-management traffic.
pub const PRIORITY_REMOTE_MANAGEMENT: u32 = 1;

/// MQTT quality-of-service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Qos {
    /// QoS 0: fire and forget, no broker acknowledgement.
    AtMostOnce,
    /// QoS 1: acknowledged delivery, may duplicate.
    AtLeastOnce,
    /// QoS 2: assured delivery.
    ExactlyOnce,
}

impl Qos {
    /// Parses the wire/storage representation (0, 1 or 2).
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Qos::AtMostOnce),
            1 => Some(Qos::AtLeastOnce),
            2 => Some(Qos::ExactlyOnce),
            _ => None,
        }
    }

    /// Returns the storage representation.
    pub const fn as_u8(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }

    /// True for QoS 0, which never waits for a broker acknowledgement.
    pub const fn is_fire_and_forget(self) -> bool {
        matches!(self, Qos::AtMostOnce)
    }
}

/// Lifecycle state of a stored message, derived from its timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageState {
    /// Stored, not yet handed to the transport.
    Unpublished,
    /// Published with QoS > 0, awaiting broker confirmation.
    InFlight,
    /// Published with QoS 0; retained only until the purge horizon.
    PublishedFireAndForget,
    /// Confirmed by the broker; retained only until the purge horizon.
    Confirmed,
    /// Given up on by the session; retained for diagnostics until purged.
    Dropped,
}

/// A stored message row.
///
/// Returned by value from every store operation; mutating a `Message` has
/// no effect on the spool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Store-assigned id, unique and monotonically increasing.
    pub id: u32,
    /// Destination topic.
    pub topic: String,
    /// Quality-of-service level requested by the producer.
    pub qos: Qos,
    /// MQTT retain flag.
    pub retain: bool,
    /// Scheduling priority; lower numbers drain first.
    pub priority: u32,
    /// Message body; `None` in payload-stripped listings.
    pub payload: Option<Vec<u8>>,
    /// When the message was stored (UTC ms).
    pub created_on: i64,
    /// When the message was handed to the transport (UTC ms).
    pub published_on: Option<i64>,
    /// Broker-assigned transport id, -1 until published with QoS > 0.
    pub published_message_id: i32,
    /// Transport session that published the message.
    pub session_id: Option<String>,
    /// When the broker confirmed the message (UTC ms).
    pub confirmed_on: Option<i64>,
    /// When the session gave up on the message (UTC ms).
    pub dropped_on: Option<i64>,
}

impl Message {
    /// Starts a builder seeded with the store-assigned id.
    pub fn builder(id: u32) -> MessageBuilder {
        MessageBuilder::new(id)
    }

    /// Derives the lifecycle state from the timestamp columns.
    pub fn state(&self) -> MessageState {
        if self.published_on.is_none() {
            return MessageState::Unpublished;
        }
        if self.dropped_on.is_some() {
            return MessageState::Dropped;
        }
        if self.confirmed_on.is_some() {
            return MessageState::Confirmed;
        }
        if self.qos.is_fire_and_forget() {
            MessageState::PublishedFireAndForget
        } else {
            MessageState::InFlight
        }
    }
}

/// Builder for [`Message`], seeded with the id.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    pub fn new(id: u32) -> Self {
        Self {
            message: Message {
                id,
                topic: String::new(),
                qos: Qos::AtMostOnce,
                retain: false,
                priority: 0,
                payload: None,
                created_on: 0,
                published_on: None,
                published_message_id: -1,
                session_id: None,
                confirmed_on: None,
                dropped_on: None,
            },
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.message.topic = topic.into();
        self
    }

    pub fn with_qos(mut self, qos: Qos) -> Self {
        self.message.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.message.retain = retain;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.message.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.message.payload = Some(payload);
        self
    }

    pub fn with_created_on(mut self, created_on: i64) -> Self {
        self.message.created_on = created_on;
        self
    }

    pub fn with_published_on(mut self, published_on: Option<i64>) -> Self {
        self.message.published_on = published_on;
        self
    }

    pub fn with_published_message_id(mut self, published_message_id: i32) -> Self {
        self.message.published_message_id = published_message_id;
        self
    }

    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.message.session_id = session_id;
        self
    }

    pub fn with_confirmed_on(mut self, confirmed_on: Option<i64>) -> Self {
        self.message.confirmed_on = confirmed_on;
        self
    }

    pub fn with_dropped_on(mut self, dropped_on: Option<i64>) -> Self {
        self.message.dropped_on = dropped_on;
        self
    }

    pub fn build(self) -> Message {
        self.message
    }
}
