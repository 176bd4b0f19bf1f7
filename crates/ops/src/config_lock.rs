//! Single-writer lock for read-modify-write updates of a shared config document.
//!
//! One holder per key; later requests wait in FIFO order. The holder's token is
//! checked again right before the write, and a mismatch is a `Forbidden` failure.
//! State lives in this process only.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use fabrik_core::{FabrikError, FabrikResult};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::director::Director;

/// Where the locked documents live.
#[async_trait::async_trait]
pub trait ConfigDocumentStore: Send + Sync {
    /// Current document; empty when none exists yet.
    async fn read(&self, key: &str) -> FabrikResult<String>;
    async fn write(&self, key: &str, document: &str) -> FabrikResult<()>;
}

/// The director's named cloud config, keyed by config name.
pub struct DirectorCloudConfig {
    director: Arc<dyn Director>,
}

impl DirectorCloudConfig {
    pub fn new(director: Arc<dyn Director>) -> Self { Self { director } }
}

#[async_trait::async_trait]
impl ConfigDocumentStore for DirectorCloudConfig {
    async fn read(&self, key: &str) -> FabrikResult<String> {
        Ok(self.director.get_config("cloud", key).await?.unwrap_or_default())
    }

    async fn write(&self, key: &str, document: &str) -> FabrikResult<()> {
        self.director.update_config("cloud", key, document).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub token: String,
    pub acquired_at: DateTime<Utc>,
}

enum Acquire {
    Held(String),
    Wait(oneshot::Receiver<String>),
}

struct KeyState {
    holder: LockHolder,
    waiters: VecDeque<oneshot::Sender<String>>,
}

fn new_holder() -> LockHolder {
    LockHolder { token: uuid::Uuid::new_v4().to_string(), acquired_at: Utc::now() }
}

pub struct ConfigLockManager {
    locks: Mutex<FxHashMap<String, KeyState>>,
    store: Arc<dyn ConfigDocumentStore>,
}

/// Releases the key on drop, handing it to the next waiter if any.
struct LockGuard<'a> {
    manager: &'a ConfigLockManager,
    key: &'a str,
    token: String,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) { self.manager.release(self.key, &self.token); }
}

impl ConfigLockManager {
    pub fn new(store: Arc<dyn ConfigDocumentStore>) -> Self { Self { locks: Mutex::new(FxHashMap::default()), store } }

    fn with<R>(&self, f: impl FnOnce(&mut FxHashMap<String, KeyState>) -> R) -> R {
        let mut guard = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    pub fn holder(&self, key: &str) -> Option<LockHolder> { self.with(|m| m.get(key).map(|s| s.holder.clone())) }

    pub fn queued(&self, key: &str) -> usize { self.with(|m| m.get(key).map(|s| s.waiters.len()).unwrap_or(0)) }

    /// Drop the current holder of `key` without running its update.
    /// The holder's pending write then fails `Forbidden`.
    pub fn force_release(&self, key: &str) {
        let token = self.with(|m| m.get(key).map(|s| s.holder.token.clone()));
        if let Some(token) = token {
            info!(key = %key, "config lock force-released");
            self.release(key, &token);
        }
    }

    async fn acquire(&self, key: &str) -> FabrikResult<String> {
        let step = self.with(|m| match m.get_mut(key) {
            None => {
                let holder = new_holder();
                let token = holder.token.clone();
                m.insert(key.to_string(), KeyState { holder, waiters: VecDeque::new() });
                Acquire::Held(token)
            }
            Some(state) => {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Acquire::Wait(rx)
            }
        });
        match step {
            Acquire::Held(token) => Ok(token),
            Acquire::Wait(rx) => {
                counter!("config_lock_wait_total", 1u64);
                debug!(key = %key, "waiting for config lock");
                rx.await.map_err(|_| FabrikError::InternalServerError(format!("config lock for '{}' abandoned", key)))
            }
        }
    }

    /// Release only if `token` still holds the key; the next live waiter takes over.
    fn release(&self, key: &str, token: &str) {
        self.with(|m| {
            let Some(state) = m.get_mut(key) else { return };
            if state.holder.token != token {
                return;
            }
            while let Some(tx) = state.waiters.pop_front() {
                let next = new_holder();
                let next_token = next.token.clone();
                state.holder = next;
                if tx.send(next_token).is_ok() {
                    return;
                }
            }
            m.remove(key);
        });
    }

    /// Run `update` against the current document of `key` under the lock and write
    /// the modified document back.
    pub async fn with_lock<R, F>(&self, key: &str, update: F) -> FabrikResult<R>
    where
        F: FnOnce(String) -> FabrikResult<(String, R)> + Send,
        R: Send,
    {
        let token = self.acquire(key).await?;
        let guard = LockGuard { manager: self, key, token };
        let current = self.store.read(key).await?;
        let (modified, result) = update(current)?;
        if self.holder(key).map(|h| h.token) != Some(guard.token.clone()) {
            error!(key = %key, "config lock token changed while held");
            return Err(FabrikError::Forbidden(format!("config lock for '{}' is no longer held by this writer", key)));
        }
        self.store.write(key, &modified).await?;
        drop(guard);
        Ok(result)
    }
}
