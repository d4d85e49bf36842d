use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{CacheMode, CachePolicy, Expiry};
use crate::method::Fingerprint;
use crate::storage::Storage;

/// A successful cache read.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    /// The cached payload.
    pub payload: Value,
    /// `true` when the value came from a placeholder-mode persisted entry:
    /// it fills the immediate data need, but a real execution must still be
    /// scheduled.
    pub placeholder: bool,
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    payload: Value,
    expires_at: Option<SystemTime>,
    tag: Option<String>,
}

impl MemoryEntry {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Persisted record layout: one record per fingerprint.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    payload: Value,
    /// Unix milliseconds; absent means the entry never expires by time.
    expires_at: Option<u64>,
    tag: Option<String>,
}

/// Two-tier response cache: authoritative memory tier plus an optional
/// persisted tier behind a [`Storage`] adapter.
///
/// Expired entries are evicted lazily at read time from whichever tier
/// reported them; there is no background sweeper.
pub(crate) struct CacheStore {
    memory: DashMap<Fingerprint, MemoryEntry>,
    storage: Arc<dyn Storage>,
    namespace: String,
    /// Fingerprints (hex) with a live persisted record, so an engine-wide
    /// invalidation can clear the persisted tier without key enumeration
    /// support from the adapter. Mirrored to storage under the index key.
    persisted: Mutex<HashSet<String>>,
}

impl CacheStore {
    pub(crate) fn new(namespace: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        let namespace = namespace.into();
        let index_key = format!("{namespace}:cache:index");
        let persisted = storage
            .get_item(&index_key)
            .and_then(|raw| serde_json::from_str::<HashSet<String>>(&raw).ok())
            .unwrap_or_default();
        Self {
            memory: DashMap::new(),
            storage,
            namespace,
            persisted: Mutex::new(persisted),
        }
    }

    fn entry_key(&self, fingerprint: Fingerprint) -> String {
        format!("{}:cache:{fingerprint}", self.namespace)
    }

    fn index_key(&self) -> String {
        format!("{}:cache:index", self.namespace)
    }

    fn index_insert(&self, fingerprint: Fingerprint) {
        let mut persisted = self.persisted.lock().expect("cache index lock poisoned");
        if persisted.insert(fingerprint.to_string()) {
            self.write_index(&persisted);
        }
    }

    fn index_remove(&self, fingerprint: Fingerprint) {
        let mut persisted = self.persisted.lock().expect("cache index lock poisoned");
        if persisted.remove(&fingerprint.to_string()) {
            self.write_index(&persisted);
        }
    }

    fn write_index(&self, persisted: &HashSet<String>) {
        match serde_json::to_string(persisted) {
            Ok(raw) => self.storage.set_item(&self.index_key(), raw),
            Err(err) => warn!(error = %err, "failed to serialize cache index"),
        }
    }

    /// Reads the entry for `fingerprint` under `policy`.
    ///
    /// The memory tier is authoritative; the persisted tier is only consulted
    /// on a memory miss when the policy allows persistence. Restore-mode hits
    /// are promoted into memory; placeholder-mode hits are flagged so the
    /// caller still schedules a real execution.
    pub(crate) fn get(&self, fingerprint: Fingerprint, policy: &CachePolicy) -> Option<CacheHit> {
        let now = SystemTime::now();

        if let Some(entry) = self.memory.get(&fingerprint) {
            if entry.is_expired(now) {
                drop(entry);
                debug!(%fingerprint, "evicting expired memory entry");
                self.memory.remove(&fingerprint);
                if policy.persists() {
                    self.remove_persisted(fingerprint);
                }
            } else {
                debug!(%fingerprint, "memory cache hit");
                return Some(CacheHit {
                    payload: entry.payload.clone(),
                    placeholder: false,
                });
            }
        }

        if !policy.persists() {
            return None;
        }

        let entry = self.read_persisted(fingerprint)?;
        if entry.tag != policy.tag {
            debug!(%fingerprint, "persisted entry tag mismatch, discarding");
            self.remove_persisted(fingerprint);
            return None;
        }
        let expires_at = entry.expires_at.map(|ms| UNIX_EPOCH + std::time::Duration::from_millis(ms));
        if expires_at.is_some_and(|at| now >= at) {
            debug!(%fingerprint, "evicting expired persisted entry");
            self.remove_persisted(fingerprint);
            return None;
        }

        match policy.mode {
            CacheMode::StorageRestore => {
                debug!(%fingerprint, "restoring persisted entry into memory");
                self.memory.insert(
                    fingerprint,
                    MemoryEntry {
                        payload: entry.payload.clone(),
                        expires_at,
                        tag: entry.tag,
                    },
                );
                Some(CacheHit {
                    payload: entry.payload,
                    placeholder: false,
                })
            }
            CacheMode::StoragePlaceholder => {
                debug!(%fingerprint, "serving persisted entry as placeholder");
                Some(CacheHit {
                    payload: entry.payload,
                    placeholder: true,
                })
            }
            // persists() excluded Memory above
            CacheMode::Memory => None,
        }
    }

    /// Writes `payload` under `policy`. A disabled policy makes this a no-op;
    /// the memory tier is always written otherwise, the persisted tier only
    /// for persisting modes.
    pub(crate) fn set(&self, fingerprint: Fingerprint, payload: Value, policy: &CachePolicy) {
        let expires_at = match policy.expiry {
            Expiry::None => return,
            Expiry::After(after) => match SystemTime::now().checked_add(after) {
                Some(at) => Some(at),
                // An out-of-range deadline behaves like no deadline.
                None => None,
            },
            Expiry::Forever => None,
        };

        debug!(%fingerprint, persists = policy.persists(), "caching response");
        self.memory.insert(
            fingerprint,
            MemoryEntry {
                payload: payload.clone(),
                expires_at,
                tag: policy.tag.clone(),
            },
        );

        if policy.persists() {
            let record = PersistedEntry {
                payload,
                expires_at: expires_at.and_then(|at| {
                    at.duration_since(UNIX_EPOCH)
                        .ok()
                        .map(|since| since.as_millis() as u64)
                }),
                tag: policy.tag.clone(),
            };
            match serde_json::to_string(&record) {
                Ok(raw) => {
                    self.storage.set_item(&self.entry_key(fingerprint), raw);
                    self.index_insert(fingerprint);
                }
                Err(err) => warn!(%fingerprint, error = %err, "failed to persist cache entry"),
            }
        }
    }

    /// Applies `updater` to an existing entry in one cooperative turn.
    /// Returns `false` when no live entry exists (absent entries stay absent).
    pub(crate) fn update(
        &self,
        fingerprint: Fingerprint,
        policy: &CachePolicy,
        updater: impl FnOnce(Value) -> Value,
    ) -> bool {
        match self.get(fingerprint, policy) {
            Some(hit) => {
                self.set(fingerprint, updater(hit.payload), policy);
                true
            }
            None => false,
        }
    }

    /// Removes the entry for `fingerprint` from both tiers.
    pub(crate) fn invalidate(&self, fingerprint: Fingerprint) {
        debug!(%fingerprint, "invalidating cache entry");
        self.memory.remove(&fingerprint);
        self.remove_persisted(fingerprint);
    }

    /// Removes every entry this engine has written, in both tiers.
    pub(crate) fn invalidate_all(&self) {
        debug!(namespace = %self.namespace, "invalidating all cache entries");
        self.memory.clear();
        let keys: Vec<String> = {
            let mut persisted = self.persisted.lock().expect("cache index lock poisoned");
            let keys = persisted.drain().collect();
            self.write_index(&persisted);
            keys
        };
        for hex in keys {
            self.storage
                .remove_item(&format!("{}:cache:{hex}", self.namespace));
        }
    }

    fn read_persisted(&self, fingerprint: Fingerprint) -> Option<PersistedEntry> {
        let raw = self.storage.get_item(&self.entry_key(fingerprint))?;
        match serde_json::from_str(&raw) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(%fingerprint, error = %err, "discarding undecodable persisted entry");
                self.remove_persisted(fingerprint);
                None
            }
        }
    }

    fn remove_persisted(&self, fingerprint: Fingerprint) {
        self.storage.remove_item(&self.entry_key(fingerprint));
        self.index_remove(fingerprint);
    }
}
