//! Spool Error Types
//!
//! This module defines all error types that can occur during spool operations.
//!
//! ## Error Categories
//!
//! ### Caller Errors
//! - `InvalidArgument`: blank topic, oversized topic or payload
//! - `CapacityReached`: the row cap refused an application-priority store
//!
//! ### Recoverable Store Errors
//! - `IdentityExhausted`: the id sequence ran past its 32-bit ceiling.
//!   The store resets the sequence and retries once before this surfaces,
//!   so callers only see it when the retry also failed.
//!
//! ### Backend Errors
//! - `Database`: any SQLite failure (connection, statement, commit). The
//!   enclosing transaction has been rolled back before this propagates.
//!
//! ### Integrity Errors
//! - `Corruption`: a row that cannot be interpreted (e.g. an out-of-range
//!   qos) or duplicate-id damage that `repair` could not fix.
//!
//! ## Usage
//!
//! All spool operations return `Result<T>` which is aliased to
//! `Result<T, SpoolError>`, so `?` propagation works throughout.
//!
//! ```ignore
//! use mqspool::{MessageStore, Result, SpoolError};
//!
//! async fn example(store: &impl MessageStore) -> Result<()> {
//!     match store.store("a/b", b"hi", Qos::AtLeastOnce, false, 5).await {
//!         Ok(message) => println!("stored {}", message.id),
//!         Err(SpoolError::CapacityReached { count, capacity }) => {
//!             println!("spool full: {}/{}", count, capacity);
//!         }
//!         Err(e) => return Err(e),
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SpoolError>;

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Store capacity reached: {count} messages stored (capacity {capacity})")]
    CapacityReached { count: u32, capacity: u32 },

    #[error("Message id space exhausted")]
    IdentityExhausted,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store corruption: {0}")]
    Corruption(String),
}
