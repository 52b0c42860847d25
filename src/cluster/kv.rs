//! Replicated, lease-aware key-value abstraction.
//!
//! The cluster's shared registry: member records, resource descriptors and
//! external-component bindings all live under reserved prefixes. The trait
//! is the seam for a real replicated store; [`MemoryKv`] implements the
//! same semantics process-locally (single-node operation, and shared
//! between in-process nodes under test).
//!
//! Watch semantics: every committed change is eventually delivered; after
//! a reconnect a watch may restart by replaying the current state, so
//! consumers must tolerate a cold replay of `Put` events they have seen.

use crate::error::KvError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Reserved prefix for cluster member records.
pub const MEMBER_KEY_PREFIX: &str = "node://";
/// Reserved prefix for resource descriptors.
pub const RESOURCE_KEY_PREFIX: &str = "res://";
/// Reserved prefix for external component bindings.
pub const COMPONENT_KEY_PREFIX: &str = "ec://";

/// Lease handle. Expiry deletes every key attached to the lease.
pub type LeaseId = i64;

/// A committed change observed by a watch.
#[derive(Debug, Clone, PartialEq)]
pub enum KvEvent {
    /// Key created or updated.
    Put { key: String, value: Vec<u8> },
    /// Key deleted (lease expiry or explicit). `prev_value` is present
    /// when the watch was opened with `with_prev`.
    Del {
        key: String,
        prev_value: Option<Vec<u8>>,
    },
}

impl KvEvent {
    /// The key this event concerns.
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Del { key, .. } => key,
        }
    }
}

/// An open prefix watch.
pub struct KvWatch {
    rx: mpsc::UnboundedReceiver<KvEvent>,
}

impl KvWatch {
    /// Next event; `None` when the store shut down.
    pub async fn next(&mut self) -> Option<KvEvent> {
        self.rx.recv().await
    }
}

/// The replicated store seam.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    /// Create a lease with the given TTL.
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, KvError>;

    /// Push a lease's expiry out by its TTL.
    async fn keep_alive(&self, lease: LeaseId) -> Result<(), KvError>;

    /// Upsert a key, optionally bound to a lease.
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<(), KvError>;

    /// All key-value pairs under a prefix.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, KvError>;

    /// Delete a key. Deleting an absent key succeeds.
    async fn del(&self, key: &str) -> Result<(), KvError>;

    /// Watch a prefix. The watch first replays the current state as `Put`
    /// events, then streams changes.
    async fn watch(&self, prefix: &str, with_prev: bool) -> Result<KvWatch, KvError>;
}

struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

struct Lease {
    ttl: Duration,
    expires_at: Instant,
}

struct Watcher {
    prefix: String,
    with_prev: bool,
    tx: mpsc::UnboundedSender<KvEvent>,
}

/// Process-local lease-aware store.
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
    leases: Mutex<HashMap<LeaseId, Lease>>,
    watchers: Mutex<Vec<Watcher>>,
    next_lease: AtomicI64,
}

impl MemoryKv {
    /// Create the store and start its lease sweeper.
    pub fn new() -> Arc<Self> {
        let kv = Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
            next_lease: AtomicI64::new(1),
        });

        let weak = Arc::downgrade(&kv);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(250));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(kv) = weak.upgrade() else {
                    return;
                };
                kv.sweep_expired();
            }
        });

        kv
    }

    /// Delete keys whose lease expired. Runs on the sweeper task.
    fn sweep_expired(&self) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = {
            let mut leases = self.leases.lock();
            let gone: Vec<LeaseId> = leases
                .iter()
                .filter(|(_, l)| l.expires_at <= now)
                .map(|(id, _)| *id)
                .collect();
            for id in &gone {
                leases.remove(id);
            }
            gone
        };
        if expired.is_empty() {
            return;
        }

        let removed: Vec<(String, Vec<u8>)> = {
            let mut entries = self.entries.lock();
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.lease.is_some_and(|l| expired.contains(&l)))
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| entries.remove(&k).map(|e| (k, e.value)))
                .collect()
        };
        for (key, prev) in removed {
            tracing::debug!(key = %key, "lease expired, key dropped");
            self.notify_del(&key, prev);
        }
    }

    fn notify_put(&self, key: &str, value: &[u8]) {
        let mut watchers = self.watchers.lock();
        watchers.retain(|w| {
            if !key.starts_with(&w.prefix) {
                return !w.tx.is_closed();
            }
            w.tx
                .send(KvEvent::Put {
                    key: key.to_string(),
                    value: value.to_vec(),
                })
                .is_ok()
        });
    }

    fn notify_del(&self, key: &str, prev: Vec<u8>) {
        let mut watchers = self.watchers.lock();
        watchers.retain(|w| {
            if !key.starts_with(&w.prefix) {
                return !w.tx.is_closed();
            }
            w.tx
                .send(KvEvent::Del {
                    key: key.to_string(),
                    prev_value: w.with_prev.then(|| prev.clone()),
                })
                .is_ok()
        });
    }

    /// Expire a lease immediately (tests simulating node loss).
    pub fn expire_lease_now(&self, lease: LeaseId) {
        if let Some(l) = self.leases.lock().get_mut(&lease) {
            l.expires_at = Instant::now() - Duration::from_millis(1);
        }
        self.sweep_expired();
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryKv {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, KvError> {
        let id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        self.leases.lock().insert(
            id,
            Lease {
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<(), KvError> {
        let mut leases = self.leases.lock();
        let l = leases.get_mut(&lease).ok_or(KvError::LeaseNotFound(lease))?;
        l.expires_at = Instant::now() + l.ttl;
        Ok(())
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<(), KvError> {
        if let Some(id) = lease {
            if !self.leases.lock().contains_key(&id) {
                return Err(KvError::LeaseNotFound(id));
            }
        }
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                lease,
            },
        );
        self.notify_put(key, &value);
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        let entries = self.entries.lock();
        Ok(entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        let prev = self.entries.lock().remove(key);
        if let Some(entry) = prev {
            self.notify_del(key, entry.value);
        }
        Ok(())
    }

    async fn watch(&self, prefix: &str, with_prev: bool) -> Result<KvWatch, KvError> {
        let (tx, rx) = mpsc::unbounded_channel();

        // Cold replay: current state first, then live changes.
        {
            let entries = self.entries.lock();
            for (k, e) in entries.iter().filter(|(k, _)| k.starts_with(prefix)) {
                let _ = tx.send(KvEvent::Put {
                    key: k.clone(),
                    value: e.value.clone(),
                });
            }
        }
        self.watchers.lock().push(Watcher {
            prefix: prefix.to_string(),
            with_prev,
            tx,
        });
        Ok(KvWatch { rx })
    }
}
