use crate::models::BatchCreated;
use redis::AsyncCommands;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::warn;

const KEY_PREFIX: &str = "hermes:batches:idempotency:";
const PENDING: &str = "pending";
const PENDING_TTL_SECS: u64 = 60;

/// Result of claiming an `Idempotency-Key` before a batch is submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// The caller owns the key and must `complete` or `release` it.
    Acquired,
    /// The key already produced this batch.
    Replay(BatchCreated),
    /// Another request holds the key and has not finished submitting.
    InFlight,
}

#[derive(Debug, Clone)]
enum Entry {
    Pending,
    Created(BatchCreated),
}

/// Maps an `Idempotency-Key` header to the batch it created. Uses Redis when
/// `REDIS_URL` is set, otherwise a process-local map.
#[derive(Clone)]
pub struct IdempotencyStore {
    redis: Option<redis::Client>,
    memory: Arc<Mutex<HashMap<String, Entry>>>,
    ttl_secs: u64,
}

impl IdempotencyStore {
    pub fn new(redis: Option<redis::Client>, ttl_secs: u64) -> Self {
        Self {
            redis,
            memory: Arc::new(Mutex::new(HashMap::new())),
            ttl_secs,
        }
    }

    pub fn from_env() -> Self {
        let redis = std::env::var("REDIS_URL")
            .ok()
            .and_then(|u| redis::Client::open(u).ok());
        let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(3600);
        Self::new(redis, ttl)
    }

    /// Claims `key` atomically, or reports who already holds it.
    pub async fn reserve(&self, key: &str) -> Reservation {
        match &self.redis {
            Some(client) => redis_reserve(client, key).await,
            None => {
                let mut memory = self.memory.lock().await;
                match memory.get(key) {
                    Some(Entry::Created(created)) => Reservation::Replay(created.clone()),
                    Some(Entry::Pending) => Reservation::InFlight,
                    None => {
                        memory.insert(key.to_string(), Entry::Pending);
                        Reservation::Acquired
                    }
                }
            }
        }
    }

    pub async fn complete(&self, key: &str, value: &BatchCreated) {
        match &self.redis {
            Some(client) => redis_set(client, key, value, self.ttl_secs).await,
            None => {
                self.memory
                    .lock()
                    .await
                    .insert(key.to_string(), Entry::Created(value.clone()));
            }
        }
    }

    /// Drops a reservation whose submission failed so the key can be reused.
    pub async fn release(&self, key: &str) {
        match &self.redis {
            Some(client) => redis_del(client, key).await,
            None => {
                let mut memory = self.memory.lock().await;
                if matches!(memory.get(key), Some(Entry::Pending)) {
                    memory.remove(key);
                }
            }
        }
    }
}

async fn redis_reserve(client: &redis::Client, key: &str) -> Reservation {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(err) => {
            warn!(target = "hermes.api", error = %err, "idempotency_lookup_unavailable");
            return Reservation::Acquired;
        }
    };
    let redis_key = format!("{KEY_PREFIX}{key}");
    let claimed: Option<String> = redis::cmd("SET")
        .arg(&redis_key)
        .arg(PENDING)
        .arg("NX")
        .arg("EX")
        .arg(PENDING_TTL_SECS)
        .query_async(&mut conn)
        .await
        .unwrap_or(None);
    if claimed.is_some() {
        return Reservation::Acquired;
    }
    let existing: Option<String> = conn.get(&redis_key).await.unwrap_or(None);
    match existing.as_deref() {
        None | Some(PENDING) => Reservation::InFlight,
        Some(raw) => serde_json::from_str(raw)
            .map(Reservation::Replay)
            .unwrap_or(Reservation::InFlight),
    }
}

async fn redis_set(client: &redis::Client, key: &str, value: &BatchCreated, ttl_secs: u64) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(format!("{KEY_PREFIX}{key}"), json, ttl_secs).await;
    }
}

async fn redis_del(client: &redis::Client, key: &str) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await {
        let _: Result<(), _> = conn.del(format!("{KEY_PREFIX}{key}")).await;
    }
}
