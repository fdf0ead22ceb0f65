//! ---
//! dbc_section: "02-messaging-ipc-data-model"
//! dbc_subsection: "module"
//! dbc_type: "source"
//! dbc_scope: "code"
//! dbc_description: "Shared state store capability and its Redis backend."
//! dbc_version: "v0.0.0-prealpha"
//! dbc_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::StateError;

type StateResult<T> = std::result::Result<T, StateError>;

/// Payloads received on a subscribed channel.
pub type PayloadStream = BoxStream<'static, StateResult<String>>;

/// Factory for scoped connections. Each step acquires its own connection and
/// drops it when the step ends.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn connect(&self) -> StateResult<Box<dyn StateConnection>>;
}

/// Hash-field and pub/sub operations on one connection.
#[async_trait]
pub trait StateConnection: Send {
    async fn hset(&mut self, key: &str, field: &str, value: &str) -> StateResult<()>;
    async fn hdel(&mut self, key: &str, field: &str) -> StateResult<()>;
    /// Subscribe to `channel`, resolving once the subscription is acknowledged.
    async fn subscribe(&mut self, channel: &str) -> StateResult<PayloadStream>;
}

/// Run a state store operation under its own deadline.
pub async fn with_deadline<T, F>(limit: Duration, op: F) -> StateResult<T>
where
    F: Future<Output = StateResult<T>>,
{
    tokio::time::timeout(limit, op)
        .await
        .map_err(|_| StateError::Timeout(limit))?
}

/// Redis-backed store.
#[derive(Debug, Clone)]
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    /// Parse the connection URL. No connection is made until [`StateStore::connect`].
    pub fn open(url: &str) -> StateResult<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
        })
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn connect(&self) -> StateResult<Box<dyn StateConnection>> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        debug!("state store connection acquired");
        Ok(Box::new(RedisConnection {
            client: self.client.clone(),
            conn,
        }))
    }
}

struct RedisConnection {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
}

#[async_trait]
impl StateConnection for RedisConnection {
    async fn hset(&mut self, key: &str, field: &str, value: &str) -> StateResult<()> {
        let _: () = self.conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hdel(&mut self, key: &str, field: &str) -> StateResult<()> {
        let _: () = self.conn.hdel(key, field).await?;
        Ok(())
    }

    async fn subscribe(&mut self, channel: &str) -> StateResult<PayloadStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let payloads = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload::<String>().map_err(StateError::from));
        Ok(payloads.boxed())
    }
}

#[derive(Default)]
struct MemoryState {
    hashes: HashMap<String, HashMap<String, String>>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
    writes: Vec<(String, String, Option<String>)>,
    unavailable: bool,
}

/// In-process store used by tests and local runs without the vehicle bus.
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `connect` fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unavailable = unavailable;
    }

    pub fn field(&self, key: &str, field: &str) -> Option<String> {
        self.inner
            .lock()
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned())
    }

    /// Writes to `key`/`field` in order; `None` marks a delete.
    pub fn writes_to(&self, key: &str, field: &str) -> Vec<Option<String>> {
        self.inner
            .lock()
            .writes
            .iter()
            .filter(|(k, f, _)| k == key && f == field)
            .map(|(_, _, value)| value.clone())
            .collect()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .lock()
            .subscribers
            .get(channel)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or_default()
    }

    /// Deliver `payload` to current subscribers, returning how many received it.
    pub fn publish(&self, channel: &str, payload: &str) -> usize {
        let mut state = self.inner.lock();
        let Some(subs) = state.subscribers.get_mut(channel) else {
            return 0;
        };
        subs.retain(|tx| tx.send(payload.to_owned()).is_ok());
        subs.len()
    }

    fn check_available(&self) -> StateResult<()> {
        if self.inner.lock().unavailable {
            return Err(StateError::Unavailable("in-memory store marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn connect(&self) -> StateResult<Box<dyn StateConnection>> {
        self.check_available()?;
        Ok(Box::new(InMemoryConnection {
            store: self.clone(),
        }))
    }
}

struct InMemoryConnection {
    store: InMemoryStateStore,
}

#[async_trait]
impl StateConnection for InMemoryConnection {
    async fn hset(&mut self, key: &str, field: &str, value: &str) -> StateResult<()> {
        self.store.check_available()?;
        let mut state = self.store.inner.lock();
        state
            .hashes
            .entry(key.to_owned())
            .or_default()
            .insert(field.to_owned(), value.to_owned());
        state
            .writes
            .push((key.to_owned(), field.to_owned(), Some(value.to_owned())));
        Ok(())
    }

    async fn hdel(&mut self, key: &str, field: &str) -> StateResult<()> {
        self.store.check_available()?;
        let mut state = self.store.inner.lock();
        if let Some(hash) = state.hashes.get_mut(key) {
            hash.remove(field);
        }
        state.writes.push((key.to_owned(), field.to_owned(), None));
        Ok(())
    }

    async fn subscribe(&mut self, channel: &str) -> StateResult<PayloadStream> {
        self.store.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.store
            .inner
            .lock()
            .subscribers
            .entry(channel.to_owned())
            .or_default()
            .push(tx);
        let payloads = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|payload| (Ok(payload), rx))
        });
        Ok(payloads.boxed())
    }
}
