//! Silent request queue.
//!
//! A silent request reports success to its caller immediately with an
//! optimistic value; the real execution runs in the background. When it
//! fails, a [`SilentRecord`] is persisted and the execution is retried with
//! exponential backoff: 1 s doubling per attempt, capped at 60 s, at most
//! [`MAX_ATTEMPTS`] per process run. A record that exhausts its attempts
//! stays persisted and is picked up again by
//! [`Engine::resume_silent_requests`](crate::engine::Engine::resume_silent_requests)
//! on a later run. Records are removed on eventual success or by
//! [`invalidate_cache`](crate::engine::invalidate_cache) reaching their
//! fingerprint.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::engine::EngineInner;
use crate::executor;
use crate::method::{Method, SerializedMethod};
use crate::storage::Storage;

/// Maximum execution attempts per process run, the initial one included.
pub const MAX_ATTEMPTS: u32 = 8;

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Persisted state of one pending silent request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SilentRecord {
    pub(crate) method: SerializedMethod,
    pub(crate) attempt: u32,
    pub(crate) last_error: Option<String>,
    /// Unix milliseconds at enqueue time.
    pub(crate) enqueued_at: u64,
}

/// Persisted queue of silent records, one per fingerprint, indexed so the
/// records can be enumerated on restart without key-listing support from the
/// storage adapter.
pub(crate) struct SilentQueue {
    storage: Arc<dyn Storage>,
    namespace: String,
    index: Mutex<HashSet<String>>,
}

impl SilentQueue {
    pub(crate) fn new(namespace: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        let namespace = namespace.into();
        let index = storage
            .get_item(&format!("{namespace}:silent:index"))
            .and_then(|raw| serde_json::from_str::<HashSet<String>>(&raw).ok())
            .unwrap_or_default();
        Self {
            storage,
            namespace,
            index: Mutex::new(index),
        }
    }

    fn record_key(&self, fingerprint: &str) -> String {
        format!("{}:silent:{fingerprint}", self.namespace)
    }

    fn index_key(&self) -> String {
        format!("{}:silent:index", self.namespace)
    }

    fn write_index(&self, index: &HashSet<String>) {
        match serde_json::to_string(index) {
            Ok(raw) => self.storage.set_item(&self.index_key(), raw),
            Err(err) => warn!(error = %err, "failed to serialize silent index"),
        }
    }

    pub(crate) fn persist(&self, fingerprint: &str, record: &SilentRecord) {
        match serde_json::to_string(record) {
            Ok(raw) => {
                self.storage.set_item(&self.record_key(fingerprint), raw);
                let mut index = self.index.lock().expect("silent index lock poisoned");
                if index.insert(fingerprint.to_string()) {
                    self.write_index(&index);
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize silent record"),
        }
    }

    pub(crate) fn remove(&self, fingerprint: &str) {
        self.storage.remove_item(&self.record_key(fingerprint));
        let mut index = self.index.lock().expect("silent index lock poisoned");
        if index.remove(fingerprint) {
            self.write_index(&index);
        }
    }

    /// Decodes every pending record; undecodable records are dropped.
    pub(crate) fn records(&self) -> Vec<(String, SilentRecord)> {
        let fingerprints: Vec<String> = {
            let index = self.index.lock().expect("silent index lock poisoned");
            index.iter().cloned().collect()
        };
        let mut records = Vec::with_capacity(fingerprints.len());
        for fingerprint in fingerprints {
            let Some(raw) = self.storage.get_item(&self.record_key(&fingerprint)) else {
                self.remove(&fingerprint);
                continue;
            };
            match serde_json::from_str(&raw) {
                Ok(record) => records.push((fingerprint, record)),
                Err(err) => {
                    warn!(%fingerprint, error = %err, "discarding undecodable silent record");
                    self.remove(&fingerprint);
                }
            }
        }
        records
    }

    pub(crate) fn pending(&self) -> usize {
        self.index.lock().expect("silent index lock poisoned").len()
    }

    /// Drops every pending record, persisted tier included.
    pub(crate) fn clear(&self) {
        let fingerprints: Vec<String> = {
            let mut index = self.index.lock().expect("silent index lock poisoned");
            let fingerprints = index.drain().collect();
            self.write_index(&index);
            fingerprints
        };
        for fingerprint in fingerprints {
            self.storage.remove_item(&self.record_key(&fingerprint));
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_millis() as u64)
        .unwrap_or(0)
}

fn backoff(attempt: u32) -> Duration {
    let factor = 1u32 << attempt.min(6);
    (BASE_DELAY * factor).min(MAX_DELAY)
}

/// Enqueues the background execution of a silent request. The caller has
/// already been answered optimistically.
pub(crate) fn submit(engine: Arc<EngineInner>, method: Method) {
    tokio::spawn(drive(engine, method, None));
}

/// Re-drives every record persisted by an earlier process run.
pub(crate) fn resume(engine: Arc<EngineInner>) {
    for (fingerprint, record) in engine.silent.records() {
        debug!(%fingerprint, attempt = record.attempt, "resuming silent record");
        let method = record.method.restore(&engine);
        tokio::spawn(drive(engine.clone(), method, Some(record)));
    }
}

async fn drive(engine: Arc<EngineInner>, method: Method, existing: Option<SilentRecord>) {
    let fingerprint = method.fingerprint().to_string();
    let enqueued_at = existing
        .as_ref()
        .map_or_else(now_millis, |record| record.enqueued_at);
    let mut record = existing.unwrap_or_else(|| SilentRecord {
        method: method.serialize(),
        attempt: 0,
        last_error: None,
        enqueued_at,
    });

    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            tokio::select! {
                () = tokio::time::sleep(backoff(attempt - 1)) => {}
                () = engine.disposed.cancelled() => return,
            }
        }
        if engine.disposed.is_cancelled() {
            return;
        }
        match executor::begin(&engine, &method, true).result.await {
            Ok(_) => {
                debug!(%fingerprint, "silent request succeeded");
                engine.silent.remove(&fingerprint);
                return;
            }
            Err(error) => {
                debug!(%fingerprint, attempt, error = %error, "silent attempt failed");
                record.attempt += 1;
                record.last_error = Some(error.to_string());
                engine.silent.persist(&fingerprint, &record);
            }
        }
    }
    warn!(
        %fingerprint,
        attempts = record.attempt,
        "silent request exhausted its attempts; record kept for a later resume"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::method::{MethodConfig, Verb};
    use std::sync::Weak;

    fn record() -> SilentRecord {
        let method = Method::new(
            Verb::Post,
            "/submit",
            Some(serde_json::json!({"v": 1})),
            MethodConfig::new(),
            Weak::new(),
            None,
        );
        SilentRecord {
            method: method.serialize(),
            attempt: 1,
            last_error: Some("transport failed: down".to_string()),
            enqueued_at: now_millis(),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff(0), Duration::from_secs(1));
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(2), Duration::from_secs(4));
        assert_eq!(backoff(5), Duration::from_secs(32));
        assert_eq!(backoff(6), Duration::from_secs(60));
        assert_eq!(backoff(30), Duration::from_secs(60));
    }

    #[test]
    fn test_persist_and_remove_maintain_index() {
        let storage = Arc::new(MemoryStorage::new());
        let queue = SilentQueue::new("test", storage.clone());

        queue.persist("abcd", &record());
        assert_eq!(queue.pending(), 1);
        assert!(storage.get_item("test:silent:abcd").is_some());

        queue.remove("abcd");
        assert_eq!(queue.pending(), 0);
        assert!(storage.get_item("test:silent:abcd").is_none());
    }

    #[test]
    fn test_records_survive_process_restart() {
        let storage = Arc::new(MemoryStorage::new());

        let first = SilentQueue::new("test", storage.clone());
        first.persist("abcd", &record());

        // A fresh queue over the same storage sees the record.
        let second = SilentQueue::new("test", storage);
        let records = second.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "abcd");
        assert_eq!(records[0].1.attempt, 1);
    }

    #[test]
    fn test_undecodable_record_dropped() {
        let storage = Arc::new(MemoryStorage::new());
        let queue = SilentQueue::new("test", storage.clone());
        queue.persist("abcd", &record());
        storage.set_item("test:silent:abcd", "not json".to_string());

        assert!(queue.records().is_empty());
        assert_eq!(queue.pending(), 0);
    }
}
