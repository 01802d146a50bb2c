//! Time-bounded cache of the enabled channel keys.
//!
//! Readers get an `Arc` snapshot of the ordered key list; a refresh builds a new list
//! and swaps the `Arc`, so a reader never sees a half-updated list. A store outage
//! leaves the previous snapshot in place.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{ChannelId, ChannelKey};
use crate::errors::DecryptError;
use crate::storage::PacketStore;

pub const DEFAULT_KEY_CACHE_TTL_MS: u64 = 60_000;

/// Result of a [`KeyCache::refresh`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The cached list was replaced. `rejected` keys failed length validation.
    Refreshed { loaded: usize, rejected: usize },
    /// The store could not be read; the previous list is still in use.
    Stale,
}

struct Snapshot {
    keys: Arc<Vec<ChannelKey>>,
    loaded_at: Option<Instant>,
    rejected: Arc<Vec<DecryptError>>,
}

pub struct KeyCache {
    store: Arc<dyn PacketStore>,
    ttl: Duration,
    snapshot: RwLock<Snapshot>,
    refresh_lock: Mutex<()>,
}

impl KeyCache {
    pub fn new(store: Arc<dyn PacketStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            snapshot: RwLock::new(Snapshot {
                keys: Arc::new(Vec::new()),
                loaded_at: None,
                rejected: Arc::new(Vec::new()),
            }),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn with_default_ttl(store: Arc<dyn PacketStore>) -> Self {
        Self::new(store, Duration::from_millis(DEFAULT_KEY_CACHE_TTL_MS))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Snapshot> {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner())
    }

    fn is_fresh(&self) -> bool {
        match self.read().loaded_at {
            Some(at) => at.elapsed() < self.ttl,
            None => false,
        }
    }

    /// Reload enabled keys from the store, ordered by `sort_order` then `id`.
    pub async fn refresh(&self) -> RefreshOutcome {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> RefreshOutcome {
        let fetched = match self.store.fetch_enabled_channel_keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(
                    "Channel key refresh failed, keeping {} cached key(s): {}",
                    self.read().keys.len(),
                    e
                );
                return RefreshOutcome::Stale;
            }
        };

        let mut keys = Vec::with_capacity(fetched.len());
        let mut rejected = Vec::new();
        for key in fetched.into_iter().filter(|k| k.enabled) {
            match key.validate() {
                Ok(()) => keys.push(key),
                Err(e) => {
                    warn!("Excluding channel '{}' from decryption: {}", key.name, e);
                    rejected.push(e);
                }
            }
        }
        keys.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then(a.id.cmp(&b.id)));

        let outcome = RefreshOutcome::Refreshed {
            loaded: keys.len(),
            rejected: rejected.len(),
        };
        debug!(
            "Channel key cache refreshed: order=[{}]",
            keys.iter()
                .map(|k| format!("{}#{}", k.name, k.id))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let mut snap = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        if snap.keys.len() != keys.len() {
            info!("Channel key cache now holds {} key(s)", keys.len());
        }
        *snap = Snapshot {
            keys: Arc::new(keys),
            loaded_at: Some(Instant::now()),
            rejected: Arc::new(rejected),
        };
        outcome
    }

    /// Current ordered keys, refreshing first when the cache is older than its TTL.
    pub async fn get_ordered_keys(&self) -> Arc<Vec<ChannelKey>> {
        if !self.is_fresh() {
            let _guard = self.refresh_lock.lock().await;
            // another caller may have refreshed while we waited
            if !self.is_fresh() {
                self.refresh_locked().await;
            }
        }
        Arc::clone(&self.read().keys)
    }

    /// A single enabled key from the (freshness-checked) cache.
    pub async fn get_key(&self, channel_id: ChannelId) -> Option<ChannelKey> {
        self.get_ordered_keys()
            .await
            .iter()
            .find(|k| k.id == channel_id)
            .cloned()
    }

    /// Force the next [`get_ordered_keys`](Self::get_ordered_keys) to hit the store.
    pub fn invalidate(&self) {
        let mut snap = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        snap.loaded_at = None;
    }

    /// Keys excluded at the last successful refresh because of bad key material.
    pub fn rejected_keys(&self) -> Arc<Vec<DecryptError>> {
        Arc::clone(&self.read().rejected)
    }
}
