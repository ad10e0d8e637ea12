//! Store capability consumed by workers: lists, sorted sets, sets, expiring
//! keys, atomic write batches and publish/subscribe.

mod memory;
mod redis_store;
mod store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use store::{BatchOp, Store, Subscription, WriteBatch};

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Store connection error: {0}")]
    Connection(String),

    #[error("Store command error: {0}")]
    Command(String),

    #[error("Wrong value type at key {0}")]
    WrongType(String),
}

impl StoreError {
    /// Connectivity faults are worth retrying; command faults are not
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
            StoreError::Connection(e.to_string())
        } else {
            StoreError::Command(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
