//! State store abstraction: KV + pub/sub used for session persistence and
//! cross-instance signaling fan-out.
//!
//! The Redis implementation is the production path; the in-memory
//! implementation serves single-instance deployments and tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// A message delivered from a pub/sub subscription: `(channel, payload)`.
pub type PubSubMessage = (String, String);

/// Bound on any single store RPC; callers treat timeouts like any other
/// store failure and keep serving from the local cache.
const STORE_OP_TIMEOUT: Duration = Duration::from_secs(5);

async fn bounded<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(STORE_OP_TIMEOUT, fut)
        .await
        .map_err(|_| anyhow::anyhow!("store operation timed out"))?
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Returns `(key, value)` pairs for every key starting with `prefix`.
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;
    async fn publish(&self, channel: &str, msg: &str) -> Result<()>;
    /// Subscribes to a channel pattern (`*` glob). Messages arrive on the
    /// returned channel until the receiver is dropped.
    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<PubSubMessage>>;
    async fn ping(&self) -> Result<()>;
}

/// Builds a `redis://` URL from the configured address, password and db.
pub fn redis_url(addr: &str, password: Option<&str>, db: i64) -> String {
    let host = addr.trim_start_matches("redis://").trim_end_matches('/');
    match password {
        Some(pw) => format!("redis://:{}@{}/{}", pw, host, db),
        None => format!("redis://{}/{}", host, db),
    }
}

pub struct RedisStore {
    client: redis::Client,
    /// Established lazily so a store that is down at boot only degrades
    /// health instead of failing startup. After the first success the
    /// manager reconnects on its own.
    conn: tokio::sync::Mutex<Option<ConnectionManager>>,
}

impl RedisStore {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid store address")?;
        Ok(RedisStore {
            client,
            conn: tokio::sync::Mutex::new(None),
        })
    }

    async fn manager(&self) -> Result<ConnectionManager> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = ConnectionManager::new(self.client.clone())
            .await
            .context("failed to connect to state store")?;
        info!("State store connected");
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        bounded(async {
            let mut conn = self.manager().await?;
            match ttl {
                Some(ttl) => {
                    let secs = ttl.as_secs().max(1);
                    conn.set_ex::<_, _, ()>(key, value, secs)
                        .await
                        .context("store set_ex failed")?;
                }
                None => {
                    conn.set::<_, _, ()>(key, value)
                        .await
                        .context("store set failed")?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        bounded(async {
            let mut conn = self.manager().await?;
            conn.get(key).await.context("store get failed")
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        bounded(async {
            let mut conn = self.manager().await?;
            conn.del::<_, ()>(key).await.context("store del failed")?;
            Ok(())
        })
        .await
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut conn = bounded(self.manager()).await?;
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut out = Vec::new();
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .context("store scan failed")?;
            for key in keys {
                if let Some(value) = conn
                    .get::<_, Option<String>>(&key)
                    .await
                    .context("store get failed")?
                {
                    out.push((key, value));
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(out)
    }

    async fn publish(&self, channel: &str, msg: &str) -> Result<()> {
        bounded(async {
            let mut conn = self.manager().await?;
            conn.publish::<_, _, ()>(channel, msg)
                .await
                .context("store publish failed")?;
            Ok(())
        })
        .await
    }

    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<PubSubMessage>> {
        let (tx, rx) = mpsc::channel(256);
        let client = self.client.clone();
        let pattern = pattern.to_string();

        tokio::spawn(async move {
            loop {
                let mut pubsub = match client.get_async_pubsub().await {
                    Ok(ps) => ps,
                    Err(e) => {
                        warn!(error = %e, "Failed to get pub/sub connection, retrying");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        continue;
                    }
                };
                if let Err(e) = pubsub.psubscribe(&pattern).await {
                    warn!(error = %e, pattern = %pattern, "Pattern subscribe failed, retrying");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
                info!(pattern = %pattern, "Pub/sub subscriber connected");

                let mut stream = pubsub.on_message();
                while let Some(msg) = stream.next().await {
                    let channel = msg.get_channel_name().to_string();
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(error = %e, "Dropping non-UTF8 pub/sub payload");
                            continue;
                        }
                    };
                    if tx.send((channel, payload)).await.is_err() {
                        // Receiver dropped; subscription no longer wanted.
                        return;
                    }
                }
                warn!(pattern = %pattern, "Pub/sub stream ended, reconnecting");
                if tx.is_closed() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    async fn ping(&self) -> Result<()> {
        bounded(async {
            let mut conn = self.manager().await?;
            redis::cmd("PING")
                .query_async::<()>(&mut conn)
                .await
                .context("store ping failed")?;
            Ok(())
        })
        .await
    }
}

/// In-process store with the same surface. TTLs are honored lazily on read.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
    subscribers: Mutex<Vec<(String, mpsc::Sender<PubSubMessage>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn pattern_matches(pattern: &str, channel: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => channel.starts_with(prefix),
            None => pattern == channel,
        }
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expiry = ttl.map(|t| Instant::now() + t);
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_string(), expiry));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((_, Some(expiry))) if *expiry <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, (_, expiry)| expiry.map_or(true, |e| e > now));
        Ok(entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect())
    }

    async fn publish(&self, channel: &str, msg: &str) -> Result<()> {
        let subscribers = self.subscribers.lock().unwrap().clone();
        for (pattern, tx) in subscribers {
            if Self::pattern_matches(&pattern, channel) {
                let _ = tx.try_send((channel.to_string(), msg.to_string()));
            }
        }
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<PubSubMessage>> {
        let (tx, rx) = mpsc::channel(256);
        self.subscribers
            .lock()
            .unwrap()
            .push((pattern.to_string(), tx));
        Ok(rx)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
