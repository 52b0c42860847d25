//! Cluster connection manager.
//!
//! Keeps exactly one RPC link per peer node, keyed by instance id. Reacts
//! to membership deltas from the hook bus: newly-registered members are
//! dialed, removed members have their links dropped. Peers whose cluster
//! API major version differs stay known (so operators can observe them)
//! but are refused for routing.

use crate::cluster::memberlist::{ApiVersion, ClusterMember};
use crate::cluster::rpc::client::Conn;
use crate::error::{ClusterError, InstanceId};
use crate::hooks::{self, HookError, HookHandler, HookOutcome, HookPayload, Hooks};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

enum PeerEntry {
    Connected(Arc<Conn>),
    Incompatible(ApiVersion),
}

/// One link per peer, behind a reader-writer lock. Lock sections never
/// perform I/O; dialing happens before insertion.
pub struct ConnManager {
    local_id: InstanceId,
    api_version: ApiVersion,
    connect_timeout: Duration,
    request_timeout: Duration,
    conns: RwLock<HashMap<InstanceId, PeerEntry>>,
}

impl ConnManager {
    pub fn new(
        local_id: InstanceId,
        api_version: ApiVersion,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            api_version,
            connect_timeout,
            request_timeout,
            conns: RwLock::new(HashMap::new()),
        })
    }

    /// Subscribe this manager to membership deltas.
    pub fn subscribe(self: &Arc<Self>, hooks: &Hooks) {
        hooks.subscribe(
            hooks::MEMBER_LIST_UPDATED,
            100,
            Arc::new(MemberListSubscriber {
                manager: Arc::clone(self),
            }),
        );
    }

    /// Apply one membership delta.
    pub async fn handle_delta(
        &self,
        registered: &[ClusterMember],
        unregistered_keys: &[String],
    ) {
        for member in registered {
            if member.instance_id == self.local_id {
                continue;
            }
            if !self.api_version.is_compatible(&member.api_version) {
                warn!(
                    instance_id = %member.instance_id,
                    local = %self.api_version,
                    remote = %member.api_version,
                    "peer speaks incompatible cluster api; kept unrouted"
                );
                self.conns.write().insert(
                    member.instance_id.clone(),
                    PeerEntry::Incompatible(member.api_version),
                );
                continue;
            }

            match Conn::connect(
                member,
                self.local_id.clone(),
                self.api_version,
                self.connect_timeout,
                self.request_timeout,
            )
            .await
            {
                Ok(conn) => {
                    info!(instance_id = %member.instance_id, host = %member.host, "peer link established");
                    self.conns
                        .write()
                        .insert(member.instance_id.clone(), PeerEntry::Connected(Arc::new(conn)));
                    self.update_peer_gauge();
                }
                Err(e) => {
                    warn!(instance_id = %member.instance_id, error = %e, "peer dial failed");
                }
            }
        }

        for key in unregistered_keys {
            let instance_id = key
                .trim_start_matches(crate::cluster::kv::MEMBER_KEY_PREFIX)
                .to_string();
            if self.conns.write().remove(&instance_id).is_some() {
                info!(instance_id = %instance_id, "peer link dropped");
                self.update_peer_gauge();
            }
        }
    }

    fn update_peer_gauge(&self) {
        if let Some(g) = crate::metrics::CLUSTER_PEERS_CONNECTED.get() {
            let count = self
                .conns
                .read()
                .values()
                .filter(|e| matches!(e, PeerEntry::Connected(_)))
                .count();
            g.set(count as i64);
        }
    }

    /// The usable link to a peer.
    ///
    /// Errors: [`ClusterError::ConnNotFound`] for unknown or disconnected
    /// peers, [`ClusterError::IncompatibleProtocol`] for version-gated ones.
    pub fn get_connection(&self, instance_id: &str) -> Result<Arc<Conn>, ClusterError> {
        let conns = self.conns.read();
        match conns.get(instance_id) {
            Some(PeerEntry::Connected(conn)) => Ok(Arc::clone(conn)),
            Some(PeerEntry::Incompatible(remote)) => Err(ClusterError::IncompatibleProtocol {
                instance_id: instance_id.to_string(),
                local_major: self.api_version.major,
                remote_major: remote.major,
            }),
            None => Err(ClusterError::ConnNotFound(instance_id.to_string())),
        }
    }

    /// Instance ids with a usable link.
    pub fn connected_ids(&self) -> Vec<InstanceId> {
        self.conns
            .read()
            .iter()
            .filter(|(_, e)| matches!(e, PeerEntry::Connected(_)))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

struct MemberListSubscriber {
    manager: Arc<ConnManager>,
}

#[async_trait::async_trait]
impl HookHandler for MemberListSubscriber {
    async fn run(&self, payload: &HookPayload) -> Result<HookOutcome, HookError> {
        if let HookPayload::MemberList {
            registered,
            unregistered_keys,
        } = payload
        {
            self.manager.handle_delta(registered, unregistered_keys).await;
        }
        Ok(HookOutcome::Continue)
    }
}
