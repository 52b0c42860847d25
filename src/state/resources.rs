//! Resource manager: the authoritative distributed map of bound resources.
//!
//! Descriptors live under `res://<user>/<resource>` with a TTL lease that
//! this node keeps refreshed for the streams it owns. The KV entry is the
//! authoritative snapshot; a prefix watch keeps an LRU-bounded cache warm
//! for hot users. Self-owned entries whose local stream is gone (crash
//! between KV write and stream teardown) are filtered from reads and
//! lazily deleted.

use crate::cluster::kv::{KvEvent, KvStore, LeaseId, RESOURCE_KEY_PREFIX};
use crate::error::{InstanceId, KvError};
use crate::state::hub::StreamHub;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use rxmpp_proto::{Jid, Stanza};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Hot-user cache bound.
const CACHE_CAPACITY: usize = 1024;

/// One bound resource, globally identified.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ResourceDescriptor {
    /// The node owning the stream.
    pub instance_id: InstanceId,
    /// The full JID minted at bind.
    pub jid: Jid,
    /// Last available/unavailable presence seen from this resource.
    pub presence: Option<Stanza>,
    /// Opaque per-resource annotations maintained by modules.
    pub info: BTreeMap<String, String>,
}

impl ResourceDescriptor {
    pub fn new(instance_id: InstanceId, jid: Jid) -> Self {
        Self {
            instance_id,
            jid,
            presence: None,
            info: BTreeMap::new(),
        }
    }

    /// The local part; descriptors always carry a full JID.
    pub fn username(&self) -> &str {
        self.jid.node().unwrap_or_default()
    }

    /// The resource part.
    pub fn resource(&self) -> &str {
        self.jid.resource().unwrap_or_default()
    }

    /// Advertised presence priority; 0 when no presence was seen yet.
    pub fn priority(&self) -> i8 {
        self.presence.as_ref().map_or(0, Stanza::presence_priority)
    }

    /// Whether the last presence was available.
    pub fn is_available(&self) -> bool {
        self.presence
            .as_ref()
            .is_some_and(Stanza::is_available_presence)
    }

    /// The KV key for this descriptor.
    pub fn key(&self) -> String {
        resource_key(self.username(), self.resource())
    }
}

/// The `res://<user>/<resource>` key.
pub fn resource_key(username: &str, resource: &str) -> String {
    format!("{RESOURCE_KEY_PREFIX}{username}/{resource}")
}

/// Result of a conflict-checking registration.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterOutcome {
    /// The descriptor is now the authoritative entry.
    Registered,
    /// The same `(user, resource)` is bound elsewhere; the existing
    /// descriptor is returned for the conflict policy to act on.
    AlreadyBound(ResourceDescriptor),
}

/// Distributed resource map client for one node.
pub struct ResourceManager {
    kv: Arc<dyn KvStore>,
    instance_id: InstanceId,
    ttl: Duration,
    hub: Arc<StreamHub>,
    lease: tokio::sync::Mutex<LeaseId>,
    /// Descriptors owned by this node, by KV key. Source for refresh
    /// re-puts after a lease loss.
    local: DashMap<String, ResourceDescriptor>,
    cache: Mutex<LruCache<String, Vec<ResourceDescriptor>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ResourceManager {
    /// Grant the node lease and start the refresh and watch loops.
    pub async fn start(
        kv: Arc<dyn KvStore>,
        instance_id: InstanceId,
        ttl: Duration,
        hub: Arc<StreamHub>,
    ) -> Result<Arc<Self>, KvError> {
        let lease = kv.grant_lease(ttl).await?;
        let manager = Arc::new(Self {
            kv,
            instance_id,
            ttl,
            hub,
            lease: tokio::sync::Mutex::new(lease),
            local: DashMap::new(),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero"),
            )),
            tasks: Mutex::new(Vec::new()),
        });
        manager.spawn_refresh();
        manager.spawn_watch().await?;
        Ok(manager)
    }

    fn spawn_refresh(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let period = Duration::from_secs((manager.ttl.as_secs() / 3).max(1));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let mut lease = manager.lease.lock().await;
                if manager.kv.keep_alive(*lease).await.is_ok() {
                    continue;
                }
                warn!("resource lease lost, re-registering local descriptors");
                match manager.kv.grant_lease(manager.ttl).await {
                    Ok(new_lease) => {
                        *lease = new_lease;
                        for entry in manager.local.iter() {
                            let value = match serde_json::to_vec(entry.value()) {
                                Ok(v) => v,
                                Err(e) => {
                                    warn!(error = %e, "descriptor re-encode failed");
                                    continue;
                                }
                            };
                            if let Err(e) = manager
                                .kv
                                .put(entry.key(), value, Some(new_lease))
                                .await
                            {
                                warn!(key = %entry.key(), error = %e, "descriptor re-put failed");
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "resource lease re-grant failed"),
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn spawn_watch(self: &Arc<Self>) -> Result<(), KvError> {
        let mut watch = self.kv.watch(RESOURCE_KEY_PREFIX, false).await?;
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = watch.next().await {
                manager.apply_event(event);
            }
        });
        self.tasks.lock().push(handle);
        Ok(())
    }

    /// Keep cached users current. Only users already in the cache are
    /// updated; everyone else pays a prefix read on next lookup.
    fn apply_event(&self, event: KvEvent) {
        match event {
            KvEvent::Put { key, value } => {
                let descriptor: ResourceDescriptor = match serde_json::from_slice(&value) {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(key = %key, error = %e, "undecodable resource descriptor ignored");
                        return;
                    }
                };
                let mut cache = self.cache.lock();
                if let Some(entries) = cache.get_mut(descriptor.username()) {
                    entries.retain(|d| !d.jid.matches_full(&descriptor.jid));
                    entries.push(descriptor);
                }
            }
            KvEvent::Del { key, .. } => {
                let Some((username, resource)) = parse_resource_key(&key) else {
                    return;
                };
                let mut cache = self.cache.lock();
                if let Some(entries) = cache.get_mut(username) {
                    entries.retain(|d| d.resource() != resource);
                }
            }
        }
    }

    /// Conflict-checking registration: refuses when the same
    /// `(user, resource)` is held by another instance, returning the
    /// existing descriptor for the bind policy to act on.
    pub async fn register(
        &self,
        descriptor: ResourceDescriptor,
    ) -> Result<RegisterOutcome, KvError> {
        let key = descriptor.key();
        let existing = self.kv.get_prefix(&key).await?;
        for (existing_key, value) in existing {
            if existing_key != key {
                continue;
            }
            let held: ResourceDescriptor = serde_json::from_slice(&value)?;
            if held.instance_id != self.instance_id {
                debug!(key = %key, holder = %held.instance_id, "resource already bound elsewhere");
                return Ok(RegisterOutcome::AlreadyBound(held));
            }
        }
        self.put_descriptor(descriptor).await?;
        Ok(RegisterOutcome::Registered)
    }

    /// Unconditional authoritative upsert (registration after a resolved
    /// conflict, presence snapshots, InfoMap mutations).
    pub async fn put_descriptor(&self, descriptor: ResourceDescriptor) -> Result<(), KvError> {
        let key = descriptor.key();
        let value = serde_json::to_vec(&descriptor)?;
        let lease = *self.lease.lock().await;
        self.kv.put(&key, value, Some(lease)).await?;
        self.local.insert(key, descriptor);
        if let Some(g) = crate::metrics::LOCAL_RESOURCES.get() {
            g.set(self.local.len() as i64);
        }
        Ok(())
    }

    /// Remove `(username, resource)` from the map.
    pub async fn unregister(&self, username: &str, resource: &str) -> Result<(), KvError> {
        let key = resource_key(username, resource);
        self.kv.del(&key).await?;
        self.local.remove(&key);
        if let Some(g) = crate::metrics::LOCAL_RESOURCES.get() {
            g.set(self.local.len() as i64);
        }
        Ok(())
    }

    /// All bound resources of `username`, cluster-wide.
    pub async fn get_resources(
        &self,
        username: &str,
    ) -> Result<Vec<ResourceDescriptor>, KvError> {
        let cached = self.cache.lock().get(username).cloned();
        let entries = match cached {
            Some(entries) => entries,
            None => {
                let prefix = format!("{RESOURCE_KEY_PREFIX}{username}/");
                let raw = self.kv.get_prefix(&prefix).await?;
                let mut entries = Vec::with_capacity(raw.len());
                for (key, value) in raw {
                    match serde_json::from_slice::<ResourceDescriptor>(&value) {
                        Ok(d) => entries.push(d),
                        Err(e) => {
                            warn!(key = %key, error = %e, "undecodable resource descriptor skipped")
                        }
                    }
                }
                self.cache
                    .lock()
                    .put(username.to_string(), entries.clone());
                entries
            }
        };

        // Filter self-owned entries whose stream is gone; lazily delete
        // the stale keys.
        let mut live = Vec::with_capacity(entries.len());
        for descriptor in entries {
            if descriptor.instance_id == self.instance_id
                && !self.hub.contains_jid(&descriptor.jid)
            {
                debug!(jid = %descriptor.jid, "dropping stale self-owned descriptor");
                let _ = self.kv.del(&descriptor.key()).await;
                self.local.remove(&descriptor.key());
                continue;
            }
            live.push(descriptor);
        }
        Ok(live)
    }

    /// One descriptor, cluster-wide.
    pub async fn get_resource(
        &self,
        username: &str,
        resource: &str,
    ) -> Result<Option<ResourceDescriptor>, KvError> {
        Ok(self
            .get_resources(username)
            .await?
            .into_iter()
            .find(|d| d.resource() == resource))
    }

    /// Update the presence snapshot of a locally-owned descriptor,
    /// preserving its InfoMap.
    pub async fn update_presence(
        &self,
        username: &str,
        resource: &str,
        presence: Stanza,
    ) -> Result<(), KvError> {
        let key = resource_key(username, resource);
        let Some(mut descriptor) = self.local.get(&key).map(|d| d.clone()) else {
            return Ok(());
        };
        descriptor.presence = Some(presence);
        self.put_descriptor(descriptor).await
    }

    /// Read-modify-write of a locally-owned descriptor's InfoMap.
    pub async fn update_info(
        &self,
        username: &str,
        resource: &str,
        mutate: impl FnOnce(&mut BTreeMap<String, String>),
    ) -> Result<(), KvError> {
        let key = resource_key(username, resource);
        let Some(mut descriptor) = self.local.get(&key).map(|d| d.clone()) else {
            return Ok(());
        };
        mutate(&mut descriptor.info);
        self.put_descriptor(descriptor).await
    }

    /// Descriptors owned by this node.
    pub fn local_descriptors(&self) -> Vec<ResourceDescriptor> {
        self.local.iter().map(|e| e.value().clone()).collect()
    }

    /// Cancel background loops.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

fn parse_resource_key(key: &str) -> Option<(&str, &str)> {
    key.strip_prefix(RESOURCE_KEY_PREFIX)?.split_once('/')
}
