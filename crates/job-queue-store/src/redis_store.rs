//! Redis-backed store.

use crate::store::{BatchOp, Store, Subscription, WriteBatch};
use crate::Result;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tracing::{debug, info};

/// Redis store over a reconnecting connection manager.
///
/// Blocking pops go through their own connection so a long `BLPOP` never
/// stalls heartbeats or registry writes sharing the main connection.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    blocking: ConnectionManager,
}

impl RedisStore {
    /// Connect to the Redis server at `url`
    pub async fn connect(url: &str) -> Result<Self> {
        info!(url = %mask_redis_url(url), "Connecting to Redis");

        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        let blocking = ConnectionManager::new(client.clone()).await?;

        info!("Successfully connected to Redis");
        Ok(RedisStore {
            client,
            conn,
            blocking,
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

/// Score argument accepted by ZADD/ZRANGEBYSCORE, including infinities
fn score_arg(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

fn add_op(pipe: &mut redis::Pipeline, op: BatchOp) {
    match op {
        BatchOp::Set { key, value, ttl } => {
            let cmd = pipe.cmd("SET").arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
            }
            cmd.ignore();
        }
        BatchOp::Delete { key } => {
            pipe.cmd("DEL").arg(key).ignore();
        }
        BatchOp::Push { list, value } => {
            pipe.cmd("RPUSH").arg(list).arg(value).ignore();
        }
        BatchOp::ListRemove { list, value } => {
            pipe.cmd("LREM").arg(list).arg(0).arg(value).ignore();
        }
        BatchOp::SortedAdd { key, member, score } => {
            pipe.cmd("ZADD").arg(key).arg(score_arg(score)).arg(member).ignore();
        }
        BatchOp::SortedRemove { key, member } => {
            pipe.cmd("ZREM").arg(key).arg(member).ignore();
        }
        BatchOp::SetAdd { key, member } => {
            pipe.cmd("SADD").arg(key).arg(member).ignore();
        }
        BatchOp::SetRemove { key, member } => {
            pipe.cmd("SREM").arg(key).arg(member).ignore();
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let updated: bool = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(updated)
    }

    async fn push(&self, list: &str, value: &str) -> Result<usize> {
        let mut conn = self.conn();
        let len: usize = conn.rpush(list, value).await?;
        Ok(len)
    }

    async fn list_range(&self, list: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let items: Vec<String> = conn.lrange(list, 0, -1).await?;
        Ok(items)
    }

    async fn list_len(&self, list: &str) -> Result<usize> {
        let mut conn = self.conn();
        let len: usize = conn.llen(list).await?;
        Ok(len)
    }

    async fn list_remove(&self, list: &str, value: &str) -> Result<usize> {
        let mut conn = self.conn();
        let removed: usize = conn.lrem(list, 0, value).await?;
        Ok(removed)
    }

    async fn pop_first(&self, lists: &[String]) -> Result<Option<(String, String)>> {
        let mut conn = self.conn();
        for list in lists {
            let value: Option<String> = redis::cmd("LPOP").arg(list).query_async(&mut conn).await?;
            if let Some(value) = value {
                return Ok(Some((list.clone(), value)));
            }
        }
        Ok(None)
    }

    async fn blocking_pop(&self, lists: &[String], timeout: Duration) -> Result<Option<(String, String)>> {
        // BLPOP treats 0 as "forever"
        if timeout.is_zero() {
            return self.pop_first(lists).await;
        }
        let mut conn = self.blocking.clone();
        let seconds = timeout.as_secs_f64().max(0.01);
        debug!("BLPOP on {:?} for {:.2}s", lists, seconds);
        let hit: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(lists)
            .arg(seconds)
            .query_async(&mut conn)
            .await?;
        Ok(hit)
    }

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score_arg(score))
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn sorted_update(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg("XX")
            .arg(score_arg(score))
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(score_arg(min))
            .arg(score_arg(max))
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn sorted_len(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn();
        let len: usize = conn.zcard(key).await?;
        Ok(len)
    }

    async fn sorted_score(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut conn = self.conn();
        let score: Option<f64> = conn.zscore(key, member).await?;
        Ok(score)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let added: i64 = conn.sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.srem(key, member).await?;
        Ok(removed > 0)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in batch.into_ops() {
            add_op(&mut pipe, op);
        }
        let mut conn = self.conn();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        let mut conn = self.conn();
        let receivers: usize = conn.publish(channel, message).await?;
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(Box::pin(stream))
    }
}

/// Mask password in Redis URL for safe logging.
fn mask_redis_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let scheme_end = url.find("://").map(|p| p + 3).unwrap_or(0);
            if colon_pos > scheme_end {
                return format!("{}:****@{}", &url[..colon_pos], &url[at_pos + 1..]);
            }
        }
    }
    url.to_string()
}
