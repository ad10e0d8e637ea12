//! In-process store with the same semantics as the Redis backend.
//!
//! All state sits behind one mutex, which is what makes `apply` atomic.
//! Expired keys are evicted lazily when touched.

use crate::store::{BatchOp, Store, Subscription, WriteBatch};
use crate::{Result, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    List(VecDeque<String>),
    Sorted(HashMap<String, f64>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Bytes,
    List,
    Sorted,
    Set,
}

impl Value {
    fn kind(&self) -> Kind {
        match self {
            Value::Bytes(_) => Kind::Bytes,
            Value::List(_) => Kind::List,
            Value::Sorted(_) => Kind::Sorted,
            Value::Set(_) => Kind::Set,
        }
    }

    fn is_empty_collection(&self) -> bool {
        match self {
            Value::Bytes(_) => false,
            Value::List(list) => list.is_empty(),
            Value::Sorted(members) => members.is_empty(),
            Value::Set(members) => members.is_empty(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
}

impl State {
    fn evict_if_expired(&mut self, key: &str) {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            trace!("evicting expired key {}", key);
            self.entries.remove(key);
        }
    }

    fn value(&mut self, key: &str) -> Option<&Value> {
        self.evict_if_expired(key);
        self.entries.get(key).map(|e| &e.value)
    }

    /// Mutable collection at `key`, created with `empty` when missing
    fn collection_mut(&mut self, key: &str, empty: fn() -> Value) -> &mut Value {
        self.evict_if_expired(key);
        &mut self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                value: empty(),
                expires_at: None,
            })
            .value
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self.entries.get(key).is_some_and(|e| e.value.is_empty_collection()) {
            self.entries.remove(key);
        }
    }

    fn set(&mut self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Bytes(value),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    fn delete(&mut self, key: &str) -> bool {
        self.evict_if_expired(key);
        self.entries.remove(key).is_some()
    }

    fn push(&mut self, list: &str, value: &str) -> Result<usize> {
        let len = match self.collection_mut(list, || Value::List(VecDeque::new())) {
            Value::List(items) => {
                items.push_back(value.to_string());
                items.len()
            }
            _ => return Err(StoreError::WrongType(list.to_string())),
        };
        Ok(len)
    }

    fn list_remove(&mut self, list: &str, value: &str) -> Result<usize> {
        let removed = match self.entries.get_mut(list).map(|e| &mut e.value) {
            Some(Value::List(items)) => {
                let before = items.len();
                items.retain(|item| item != value);
                before - items.len()
            }
            Some(_) => return Err(StoreError::WrongType(list.to_string())),
            None => 0,
        };
        self.drop_if_empty(list);
        Ok(removed)
    }

    fn pop_first(&mut self, lists: &[String]) -> Result<Option<(String, String)>> {
        for list in lists {
            self.evict_if_expired(list);
            let popped = match self.entries.get_mut(list).map(|e| &mut e.value) {
                Some(Value::List(items)) => items.pop_front(),
                Some(_) => return Err(StoreError::WrongType(list.clone())),
                None => None,
            };
            self.drop_if_empty(list);
            if let Some(value) = popped {
                return Ok(Some((list.clone(), value)));
            }
        }
        Ok(None)
    }

    fn sorted_add(&mut self, key: &str, member: &str, score: f64) -> Result<()> {
        match self.collection_mut(key, || Value::Sorted(HashMap::new())) {
            Value::Sorted(members) => {
                members.insert(member.to_string(), score);
                Ok(())
            }
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn sorted_update(&mut self, key: &str, member: &str, score: f64) -> Result<()> {
        self.evict_if_expired(key);
        match self.entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::Sorted(members)) => {
                if let Some(current) = members.get_mut(member) {
                    *current = score;
                }
                Ok(())
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(()),
        }
    }

    fn sorted_remove(&mut self, key: &str, member: &str) -> Result<bool> {
        self.evict_if_expired(key);
        let removed = match self.entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::Sorted(members)) => members.remove(member).is_some(),
            Some(_) => return Err(StoreError::WrongType(key.to_string())),
            None => false,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    fn set_add(&mut self, key: &str, member: &str) -> Result<bool> {
        match self.collection_mut(key, || Value::Set(BTreeSet::new())) {
            Value::Set(members) => Ok(members.insert(member.to_string())),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn set_remove(&mut self, key: &str, member: &str) -> Result<bool> {
        self.evict_if_expired(key);
        let removed = match self.entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::Set(members)) => members.remove(member),
            Some(_) => return Err(StoreError::WrongType(key.to_string())),
            None => false,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    /// Reject a batch up front if any op would hit a key of the wrong type
    fn check_batch(&mut self, ops: &[BatchOp]) -> Result<()> {
        for op in ops {
            let (key, wanted) = match op {
                BatchOp::Set { .. } | BatchOp::Delete { .. } => continue,
                BatchOp::Push { list, .. } | BatchOp::ListRemove { list, .. } => (list, Kind::List),
                BatchOp::SortedAdd { key, .. } | BatchOp::SortedRemove { key, .. } => (key, Kind::Sorted),
                BatchOp::SetAdd { key, .. } | BatchOp::SetRemove { key, .. } => (key, Kind::Set),
            };
            if let Some(value) = self.value(key) {
                if value.kind() != wanted {
                    return Err(StoreError::WrongType(key.clone()));
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, ops: Vec<BatchOp>) -> Result<bool> {
        let mut pushed = false;
        for op in ops {
            match op {
                BatchOp::Set { key, value, ttl } => self.set(&key, value, ttl),
                BatchOp::Delete { key } => {
                    self.delete(&key);
                }
                BatchOp::Push { list, value } => {
                    self.push(&list, &value)?;
                    pushed = true;
                }
                BatchOp::ListRemove { list, value } => {
                    self.list_remove(&list, &value)?;
                }
                BatchOp::SortedAdd { key, member, score } => self.sorted_add(&key, &member, score)?,
                BatchOp::SortedRemove { key, member } => {
                    self.sorted_remove(&key, &member)?;
                }
                BatchOp::SetAdd { key, member } => {
                    self.set_add(&key, &member)?;
                }
                BatchOp::SetRemove { key, member } => {
                    self.set_remove(&key, &member)?;
                }
            }
        }
        Ok(pushed)
    }
}

struct Inner {
    state: Mutex<State>,
    pushed: Notify,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

/// In-memory `Store`; clones share the same data
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                pushed: Notify::new(),
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of live keys, expired ones excluded
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        let state = self.inner.state.lock();
        state
            .entries
            .values()
            .filter(|e| e.expires_at.map_or(true, |at| at > now))
            .count()
    }

    /// Remaining time to live of `key`, if it has one
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut state = self.inner.state.lock();
        state.evict_if_expired(key);
        state
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut state = self.inner.state.lock();
        match state.value(key) {
            Some(Value::Bytes(bytes)) => Ok(Some(bytes.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.inner.state.lock().set(key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.inner.state.lock().delete(key))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.inner.state.lock().value(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.inner.state.lock();
        state.evict_if_expired(key);
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn push(&self, list: &str, value: &str) -> Result<usize> {
        let len = self.inner.state.lock().push(list, value)?;
        self.inner.pushed.notify_waiters();
        Ok(len)
    }

    async fn list_range(&self, list: &str) -> Result<Vec<String>> {
        let mut state = self.inner.state.lock();
        match state.value(list) {
            Some(Value::List(items)) => Ok(items.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType(list.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn list_len(&self, list: &str) -> Result<usize> {
        let mut state = self.inner.state.lock();
        match state.value(list) {
            Some(Value::List(items)) => Ok(items.len()),
            Some(_) => Err(StoreError::WrongType(list.to_string())),
            None => Ok(0),
        }
    }

    async fn list_remove(&self, list: &str, value: &str) -> Result<usize> {
        self.inner.state.lock().list_remove(list, value)
    }

    async fn pop_first(&self, lists: &[String]) -> Result<Option<(String, String)>> {
        self.inner.state.lock().pop_first(lists)
    }

    async fn blocking_pop(&self, lists: &[String], timeout: Duration) -> Result<Option<(String, String)>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register for wakeups before probing so a push in between is not missed
            let notified = self.inner.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(hit) = self.inner.state.lock().pop_first(lists)? {
                return Ok(Some(hit));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.inner.state.lock().sorted_add(key, member, score)
    }

    async fn sorted_update(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.inner.state.lock().sorted_update(key, member, score)
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> Result<bool> {
        self.inner.state.lock().sorted_remove(key, member)
    }

    async fn range_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let mut state = self.inner.state.lock();
        match state.value(key) {
            Some(Value::Sorted(members)) => {
                let mut hits: Vec<(&String, f64)> = members
                    .iter()
                    .filter(|(_, score)| **score >= min && **score <= max)
                    .map(|(member, score)| (member, *score))
                    .collect();
                hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
                Ok(hits.into_iter().map(|(member, _)| member.clone()).collect())
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn sorted_len(&self, key: &str) -> Result<usize> {
        let mut state = self.inner.state.lock();
        match state.value(key) {
            Some(Value::Sorted(members)) => Ok(members.len()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(0),
        }
    }

    async fn sorted_score(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut state = self.inner.state.lock();
        match state.value(key) {
            Some(Value::Sorted(members)) => Ok(members.get(member).copied()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        self.inner.state.lock().set_add(key, member)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        self.inner.state.lock().set_remove(key, member)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut state = self.inner.state.lock();
        match state.value(key) {
            Some(Value::Set(members)) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        let pushed = {
            let mut state = self.inner.state.lock();
            let ops = batch.into_ops();
            state.check_batch(&ops)?;
            state.apply(ops)?
        };
        if pushed {
            self.inner.pushed.notify_waiters();
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize> {
        let channels = self.inner.channels.lock();
        match channels.get(channel) {
            Some(sender) => Ok(sender.send(message.to_string()).unwrap_or(0)),
            None => Ok(0),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let receiver = {
            let mut channels = self.inner.channels.lock();
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((message, receiver)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
