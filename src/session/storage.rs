use super::Session;
use crate::clock::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::{self, JoinHandle};
use tokio::time::MissedTickBehavior;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session file i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("session record could not be encoded: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("session store task failed: {0}")]
    Task(#[from] task::JoinError),
    #[error("session backend failed: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Backend(Box::new(err))
    }
}

/// Persistence for sessions keyed by `session_id`.
///
/// `get` returns whatever is stored, expired or not; the session manager
/// decides what an expired record means for the caller.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError>;
    /// Inserts or fully replaces the record.
    async fn put(&self, session: &Session) -> Result<(), StoreError>;
    /// Deleting a missing id is not an error.
    async fn delete(&self, session_id: &str) -> Result<(), StoreError>;

    /// Evicts records whose `ttl` has passed. Backends with native TTL
    /// eviction keep the default.
    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(0)
    }
}

fn evict(sessions: &mut HashMap<String, Session>, now: DateTime<Utc>) -> usize {
    let before = sessions.len();
    let cutoff = now.timestamp();
    sessions.retain(|_, session| session.ttl >= cutoff);
    before - sessions.len()
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().get(session_id).cloned())
    }

    async fn put(&self, session: &Session) -> Result<(), StoreError> {
        self.sessions
            .write()
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        self.sessions.write().remove(session_id);
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(evict(&mut self.sessions.write(), now))
    }
}

/// JSON-file backed store for single-node deployments. Reads are served from
/// memory; every mutation rewrites the file.
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
    cache: RwLock<HashMap<String, Session>>,
    write_lock: Mutex<()>,
}

impl FileSessionStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let cache = if path.exists() {
            let data = fs::read_to_string(&path)?;
            if data.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str::<HashMap<String, Session>>(&data)?
            }
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            HashMap::new()
        };

        tracing::info!(path = %path.display(), sessions = cache.len(), "file session store opened");
        Ok(Self {
            path,
            cache: RwLock::new(cache),
            write_lock: Mutex::new(()),
        })
    }

    /// Writes to a sibling temp file and renames it over the target so a crash
    /// never leaves a truncated file behind.
    fn write_to_disk(path: &Path, sessions: &HashMap<String, Session>) -> Result<(), StoreError> {
        let body = serde_json::to_string_pretty(sessions)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Applies `apply` to a copy of the cache and publishes the copy only once
    /// it is on disk. A failed write leaves both cache and file untouched.
    async fn mutate<F, R>(&self, apply: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut HashMap<String, Session>) -> R,
    {
        let _guard = self.write_lock.lock().await;
        let mut next = self.cache.read().clone();
        let result = apply(&mut next);

        let path = self.path.clone();
        let next = task::spawn_blocking(move || {
            FileSessionStore::write_to_disk(&path, &next).map(|()| next)
        })
        .await??;

        *self.cache.write() = next;
        Ok(result)
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.cache.read().get(session_id).cloned())
    }

    async fn put(&self, session: &Session) -> Result<(), StoreError> {
        let session = session.clone();
        self.mutate(move |cache| {
            cache.insert(session.session_id.clone(), session);
        })
        .await
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        if !self.cache.read().contains_key(session_id) {
            return Ok(());
        }
        self.mutate(|cache| {
            cache.remove(session_id);
        })
        .await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = now.timestamp();
        if !self.cache.read().values().any(|s| s.ttl < cutoff) {
            return Ok(0);
        }
        self.mutate(|cache| evict(cache, now)).await
    }
}

/// Periodically purges expired sessions from stores without native TTL.
pub fn spawn_sweeper(
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match store.purge_expired(clock.now()).await {
                Ok(0) => {}
                Ok(removed) => tracing::info!(removed, "expired sessions purged"),
                Err(err) => tracing::warn!(error = %err, "session sweep failed"),
            }
        }
    })
}
