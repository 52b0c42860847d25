//! Cluster membership view.
//!
//! Registers the local instance under `node://<instance_id>` with a TTL
//! lease and a refresh loop, watches the member prefix, and publishes
//! snapshot deltas on the hook bus as [`crate::hooks::MEMBER_LIST_UPDATED`]
//! events. Loss of a member's lease is the authoritative "node gone"
//! signal.

use crate::cluster::kv::{KvEvent, KvStore, MEMBER_KEY_PREFIX};
use crate::error::{InstanceId, KvError};
use crate::hooks::{self, HookPayload, Hooks};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// The cluster API version this build speaks. A major difference with a
/// peer makes that peer unusable for routing.
pub const CLUSTER_API_VERSION: ApiVersion = ApiVersion { major: 1, minor: 2 };

/// Semantic version of the inter-node RPC surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl ApiVersion {
    /// Peers are routable only within one major version.
    pub fn is_compatible(&self, other: &ApiVersion) -> bool {
        self.major == other.major
    }
}

impl std::fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}.{}", self.major, self.minor)
    }
}

/// One registered cluster node, as stored under `node://`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub instance_id: InstanceId,
    pub host: String,
    pub port: u16,
    pub api_version: ApiVersion,
}

impl ClusterMember {
    /// The key this member registers under.
    pub fn key(&self) -> String {
        format!("{}{}", MEMBER_KEY_PREFIX, self.instance_id)
    }
}

/// The membership view: self-registration plus a live snapshot of peers.
pub struct MemberList {
    kv: Arc<dyn KvStore>,
    hooks: Arc<Hooks>,
    member: ClusterMember,
    ttl: Duration,
    snapshot: RwLock<HashMap<InstanceId, ClusterMember>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl MemberList {
    /// Register the local member and start the refresh and watch loops.
    pub async fn start(
        kv: Arc<dyn KvStore>,
        hooks: Arc<Hooks>,
        member: ClusterMember,
        ttl: Duration,
    ) -> Result<Arc<Self>, KvError> {
        let lease = kv.grant_lease(ttl).await?;
        let value = serde_json::to_vec(&member)?;
        kv.put(&member.key(), value, Some(lease)).await?;
        info!(instance_id = %member.instance_id, api = %member.api_version, "cluster member registered");

        let list = Arc::new(Self {
            kv: Arc::clone(&kv),
            hooks,
            member,
            ttl,
            snapshot: RwLock::new(HashMap::new()),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        list.spawn_refresh(lease);
        list.spawn_watch().await?;
        Ok(list)
    }

    fn spawn_refresh(self: &Arc<Self>, mut lease: i64) {
        let list = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let period = Duration::from_secs((list.ttl.as_secs() / 3).max(1));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // immediate first tick
            loop {
                interval.tick().await;
                match list.kv.keep_alive(lease).await {
                    Ok(()) => {}
                    Err(e) => {
                        // Lease lost (store restart, expiry under partition):
                        // re-grant and re-register.
                        warn!(error = %e, "member lease refresh failed, re-registering");
                        match list.reregister().await {
                            Ok(new_lease) => lease = new_lease,
                            Err(e) => {
                                warn!(error = %e, "member re-registration failed");
                            }
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn reregister(&self) -> Result<i64, KvError> {
        let lease = self.kv.grant_lease(self.ttl).await?;
        let value = serde_json::to_vec(&self.member)?;
        self.kv.put(&self.member.key(), value, Some(lease)).await?;
        Ok(lease)
    }

    async fn spawn_watch(self: &Arc<Self>) -> Result<(), KvError> {
        let mut watch = self.kv.watch(MEMBER_KEY_PREFIX, false).await?;
        let list = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = watch.next().await {
                list.apply_event(event).await;
            }
        });
        self.tasks.lock().push(handle);
        Ok(())
    }

    async fn apply_event(&self, event: KvEvent) {
        match event {
            KvEvent::Put { key, value } => {
                let member: ClusterMember = match serde_json::from_slice(&value) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(key = %key, error = %e, "undecodable member record ignored");
                        return;
                    }
                };
                if member.instance_id == self.member.instance_id {
                    return;
                }
                let changed = {
                    let mut snapshot = self.snapshot.write();
                    match snapshot.get(&member.instance_id) {
                        // Cold replays re-deliver identical records; only a
                        // genuine change is worth an event.
                        Some(existing) if *existing == member => false,
                        _ => {
                            snapshot.insert(member.instance_id.clone(), member.clone());
                            true
                        }
                    }
                };
                if changed {
                    info!(instance_id = %member.instance_id, host = %member.host, "cluster member joined");
                    let payload = HookPayload::MemberList {
                        registered: vec![member],
                        unregistered_keys: Vec::new(),
                    };
                    if let Err(e) = self.hooks.dispatch(hooks::MEMBER_LIST_UPDATED, &payload).await {
                        warn!(error = %e, "memberlist hook dispatch failed");
                    }
                }
            }
            KvEvent::Del { key, .. } => {
                let instance_id = key.trim_start_matches(MEMBER_KEY_PREFIX).to_string();
                if instance_id == self.member.instance_id {
                    return;
                }
                let removed = self.snapshot.write().remove(&instance_id).is_some();
                if removed {
                    info!(instance_id = %instance_id, "cluster member left");
                    let payload = HookPayload::MemberList {
                        registered: Vec::new(),
                        unregistered_keys: vec![key],
                    };
                    if let Err(e) = self.hooks.dispatch(hooks::MEMBER_LIST_UPDATED, &payload).await {
                        warn!(error = %e, "memberlist hook dispatch failed");
                    }
                }
            }
        }
    }

    /// The local member record.
    pub fn local_member(&self) -> &ClusterMember {
        &self.member
    }

    /// Current peer snapshot (local member excluded).
    pub fn members(&self) -> Vec<ClusterMember> {
        self.snapshot.read().values().cloned().collect()
    }

    /// Look up a peer by instance id.
    pub fn get(&self, instance_id: &str) -> Option<ClusterMember> {
        self.snapshot.read().get(instance_id).cloned()
    }

    /// Cancel the loops and best-effort delete the own key.
    pub async fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Err(e) = self.kv.del(&self.member.key()).await {
            warn!(error = %e, "failed to delete own member key on stop");
        }
        info!(instance_id = %self.member.instance_id, "cluster member deregistered");
    }
}
