use crate::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

/// Messages received on a subscribed channel
pub type Subscription = BoxStream<'static, String>;

/// A single write inside a `WriteBatch`
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    Set {
        key: String,
        value: Vec<u8>,
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
    Push {
        list: String,
        value: String,
    },
    ListRemove {
        list: String,
        value: String,
    },
    SortedAdd {
        key: String,
        member: String,
        score: f64,
    },
    SortedRemove {
        key: String,
        member: String,
    },
    SetAdd {
        key: String,
        member: String,
    },
    SetRemove {
        key: String,
        member: String,
    },
}

/// Writes that commit together: no reader observes a partial batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`; `ttl = None` clears any previous expiry
    pub fn set(&mut self, key: impl Into<String>, value: Vec<u8>, ttl: Option<Duration>) -> &mut Self {
        self.ops.push(BatchOp::Set {
            key: key.into(),
            value,
            ttl,
        });
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Delete { key: key.into() });
        self
    }

    pub fn push(&mut self, list: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Push {
            list: list.into(),
            value: value.into(),
        });
        self
    }

    pub fn list_remove(&mut self, list: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::ListRemove {
            list: list.into(),
            value: value.into(),
        });
        self
    }

    pub fn sorted_add(&mut self, key: impl Into<String>, member: impl Into<String>, score: f64) -> &mut Self {
        self.ops.push(BatchOp::SortedAdd {
            key: key.into(),
            member: member.into(),
            score,
        });
        self
    }

    pub fn sorted_remove(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::SortedRemove {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn set_add(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::SetAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn set_remove(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::SetRemove {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Shared key-value store capability.
///
/// Every operation is safe to call concurrently from many worker processes
/// without external locking. Lists are FIFO when written with `push` and
/// read with the pop operations.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set `key`, replacing any previous value and expiry
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Delete `key`; deleting a missing key is not an error
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Append to the tail of a list, returning the new length
    async fn push(&self, list: &str, value: &str) -> Result<usize>;

    async fn list_range(&self, list: &str) -> Result<Vec<String>>;

    async fn list_len(&self, list: &str) -> Result<usize>;

    /// Remove every occurrence of `value`
    async fn list_remove(&self, list: &str, value: &str) -> Result<usize>;

    /// Pop the head of the first non-empty list, in the given order, without blocking
    async fn pop_first(&self, lists: &[String]) -> Result<Option<(String, String)>>;

    /// Like `pop_first`, waiting at most `timeout` in total for an element
    async fn blocking_pop(&self, lists: &[String], timeout: Duration) -> Result<Option<(String, String)>>;

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// Set the score of `member` only if it is already in the set
    async fn sorted_update(&self, key: &str, member: &str, score: f64) -> Result<()>;

    async fn sorted_remove(&self, key: &str, member: &str) -> Result<bool>;

    /// Members with `min <= score <= max`, ordered by score
    async fn range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>>;

    async fn sorted_len(&self, key: &str) -> Result<usize>;

    async fn sorted_score(&self, key: &str, member: &str) -> Result<Option<f64>>;

    async fn set_add(&self, key: &str, member: &str) -> Result<bool>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Commit every operation in `batch` atomically
    async fn apply(&self, batch: WriteBatch) -> Result<()>;

    /// Publish to a channel, returning how many subscribers received it
    async fn publish(&self, channel: &str, message: &str) -> Result<usize>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Every member of a sorted set, ordered by score
    async fn sorted_members(&self, key: &str) -> Result<Vec<String>> {
        self.range_by_score(key, f64::NEG_INFINITY, f64::INFINITY).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_builder_keeps_order() {
        let mut batch = WriteBatch::new();
        batch
            .sorted_remove("wip", "a")
            .sorted_add("finished", "a", 10.0)
            .set("job:a", b"{}".to_vec(), Some(Duration::from_secs(10)));

        let ops = batch.into_ops();
        assert_eq!(ops.len(), 3);
        assert!(matches!(ops[0], BatchOp::SortedRemove { .. }));
        assert!(matches!(ops[2], BatchOp::Set { ttl: Some(_), .. }));
    }
}
