//! Node assembly.
//!
//! Builds every subsystem from a validated [`Config`] and wires them in
//! dependency order: KV and hooks first, then the resource map and the
//! cluster mesh, then routing, modules and finally the listeners. The
//! returned [`Node`] owns the background pieces and tears them down in
//! reverse order on shutdown.

use crate::auth::ScramAuthenticator;
use crate::cluster::connmgr::ConnManager;
use crate::cluster::kv::KvStore;
use crate::cluster::memberlist::{CLUSTER_API_VERSION, ClusterMember, MemberList};
use crate::cluster::router::ClusterRouter;
use crate::cluster::rpc::server::{RpcHandler, RpcServer};
use crate::cluster::rpc::wire::{RpcFault, TransferredQueue};
use crate::components::ComponentRegistry;
use crate::config::Config;
use crate::error::{InstanceId, RouterError};
use crate::hooks::{self, HookPayload, Hooks};
use crate::interceptor::InterceptorPipeline;
use crate::modules::{BlockListModule, CapsModule};
use crate::network::gateway::{Gateway, GatewayContext};
use crate::router::{LocalRouter, NoFederation, Router, S2SOutProvider};
use crate::shaper::Shapers;
use crate::state::hub::StreamHub;
use crate::state::resources::ResourceManager;
use crate::state::smqueue::SmQueueRegistry;
use crate::storage::Storage;
use rxmpp_proto::{Stanza, StreamError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Default lease TTL when no `[cluster]` block tunes it.
const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// A running node.
pub struct Node {
    pub instance_id: InstanceId,
    pub hooks: Arc<Hooks>,
    pub router: Arc<Router>,
    pub storage: Storage,
    pub resources: Arc<ResourceManager>,
    pub components: Arc<ComponentRegistry>,
    pub blocklist: Arc<BlockListModule>,
    pub caps: Arc<CapsModule>,
    pub c2s_hub: Arc<StreamHub>,
    pub component_hub: Arc<StreamHub>,
    pub sm_queues: Arc<SmQueueRegistry>,
    pub conns: Arc<ConnManager>,
    gateway: Gateway,
    memberlist: Option<Arc<MemberList>>,
    rpc_server: Option<RpcServer>,
}

impl Node {
    /// Bound listener addresses, in configuration order.
    pub fn listener_addrs(&self) -> Vec<SocketAddr> {
        self.gateway.addrs()
    }

    /// The cluster RPC address, when clustering is on.
    pub fn rpc_addr(&self) -> Option<SocketAddr> {
        self.rpc_server.as_ref().map(RpcServer::local_addr)
    }

    /// The membership view, when clustering is on.
    pub fn memberlist(&self) -> Option<&Arc<MemberList>> {
        self.memberlist.as_ref()
    }

    /// Graceful shutdown: stop accepting, drain streams, leave the
    /// cluster.
    pub async fn shutdown(&self) {
        info!(instance_id = %self.instance_id, "node shutting down");
        self.gateway.stop().await;
        if let Some(rpc) = &self.rpc_server {
            rpc.stop();
        }
        if let Some(memberlist) = &self.memberlist {
            memberlist.stop().await;
        }
        self.components.stop().await;
        self.resources.stop();
        info!(instance_id = %self.instance_id, "node stopped");
    }
}

/// Build and start a node over the given KV store, bouncing remote-domain
/// stanzas (no federation).
///
/// The KV handle is injected rather than constructed so that single-node
/// deployments run over the in-memory store, a real deployment plugs a
/// replicated backend, and tests share one store across several nodes.
pub async fn start_node(config: &Config, kv: Arc<dyn KvStore>) -> anyhow::Result<Node> {
    start_node_with(config, kv, Arc::new(NoFederation)).await
}

/// [`start_node`] with an explicit S2S egress provider.
pub async fn start_node_with(
    config: &Config,
    kv: Arc<dyn KvStore>,
    s2s: Arc<dyn S2SOutProvider>,
) -> anyhow::Result<Node> {
    let instance_id: InstanceId = config
        .server
        .instance_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    info!(instance_id = %instance_id, hosts = ?config.server.hosts, "starting node");

    let storage = match config.storage.backend.as_str() {
        "sqlite" => Storage::sqlite(&config.storage.path).await?,
        "memory" => Storage::memory(),
        other => anyhow::bail!("unknown storage backend {other:?}"),
    };

    let hooks = Arc::new(Hooks::new());
    let c2s_hub = StreamHub::new();
    let component_hub = StreamHub::new();
    let sm_queues = Arc::new(SmQueueRegistry::new());

    let ttl = config
        .cluster
        .as_ref()
        .map(|c| c.resource_ttl())
        .unwrap_or(DEFAULT_TTL);
    let resources = ResourceManager::start(
        Arc::clone(&kv),
        instance_id.clone(),
        ttl,
        Arc::clone(&c2s_hub),
    )
    .await?;

    let conns = ConnManager::new(
        instance_id.clone(),
        CLUSTER_API_VERSION,
        config.limits.connect_timeout(),
        config.limits.request_timeout(),
    );
    let cluster_router = config
        .cluster
        .as_ref()
        .map(|_| Arc::new(ClusterRouter::new(Arc::clone(&conns))));

    let components = ComponentRegistry::start(
        Arc::clone(&kv),
        Arc::clone(&conns),
        instance_id.clone(),
        ttl,
    )
    .await?;

    let interceptors = Arc::new(InterceptorPipeline::new());
    let local = Arc::new(LocalRouter::new(
        instance_id.clone(),
        Arc::clone(&c2s_hub),
        Arc::clone(&resources),
        cluster_router.clone(),
        Arc::clone(&interceptors),
        Arc::clone(&hooks),
    ));
    let router = Router::new(
        config.server.hosts.clone(),
        Arc::clone(&interceptors),
        Arc::clone(&components),
        Arc::clone(&local),
        s2s,
        storage.clone(),
    );

    // Cluster mesh: serve peers before announcing ourselves, so a member
    // record never points at a dead port.
    let (rpc_server, memberlist) = match &config.cluster {
        Some(cluster_config) => {
            let handler: Arc<dyn RpcHandler> = Arc::new(NodeRpcHandler {
                local: Arc::clone(&local),
                components: Arc::clone(&components),
                sm_queues: Arc::clone(&sm_queues),
            });
            let bind_addr: SocketAddr =
                format!("0.0.0.0:{}", cluster_config.port).parse()?;
            let rpc_server = RpcServer::bind(
                bind_addr,
                instance_id.clone(),
                CLUSTER_API_VERSION,
                handler,
            )
            .await?;

            conns.subscribe(&hooks);
            let member = ClusterMember {
                instance_id: instance_id.clone(),
                host: cluster_config.host.clone(),
                port: rpc_server.local_addr().port(),
                api_version: CLUSTER_API_VERSION,
            };
            let memberlist = MemberList::start(
                Arc::clone(&kv),
                Arc::clone(&hooks),
                member,
                cluster_config.resource_ttl(),
            )
            .await?;
            (Some(rpc_server), Some(memberlist))
        }
        None => (None, None),
    };

    // Modules.
    let blocklist = BlockListModule::new(Arc::clone(&storage.blocklist));
    blocklist.register(&router, &interceptors, &hooks);
    let caps = CapsModule::new(Arc::clone(&storage.capabilities));
    caps.register(&router, &interceptors, &hooks);

    let authenticator = Arc::new(ScramAuthenticator::new(
        Arc::clone(&storage.users),
        config.sasl.mechanisms.clone(),
    ));
    let shapers = Arc::new(Shapers::from_config(&config.shapers)?);

    let context = Arc::new(GatewayContext {
        instance_id: instance_id.clone(),
        hosts: config.server.hosts.clone(),
        limits: config.limits.clone(),
        router: Arc::clone(&router),
        hooks: Arc::clone(&hooks),
        resources: Arc::clone(&resources),
        shapers,
        authenticator,
        storage: storage.clone(),
        components: Arc::clone(&components),
        cluster: cluster_router,
        sm_queues: Arc::clone(&sm_queues),
        c2s_hub: Arc::clone(&c2s_hub),
        component_hub: Arc::clone(&component_hub),
    });
    let gateway = Gateway::bind(&config.listeners, context).await?;

    if let Err(e) = hooks
        .dispatch(hooks::COMPONENTS_STARTED, &HookPayload::Empty)
        .await
    {
        warn!(error = %e, "components-started hook failed");
    }

    Ok(Node {
        instance_id,
        hooks,
        router,
        storage,
        resources,
        components,
        blocklist,
        caps,
        c2s_hub,
        component_hub,
        sm_queues,
        conns,
        gateway,
        memberlist,
        rpc_server,
    })
}

/// The callable surface this node exposes to its peers.
struct NodeRpcHandler {
    local: Arc<LocalRouter>,
    components: Arc<ComponentRegistry>,
    sm_queues: Arc<SmQueueRegistry>,
}

fn to_fault(error: RouterError) -> RpcFault {
    match &error {
        RouterError::ResourceNotFound { user, resource } => {
            RpcFault::NotFound(format!("{user}/{resource}"))
        }
        RouterError::Component(crate::error::ComponentError::NotFound(host)) => {
            RpcFault::NotFound(host.clone())
        }
        RouterError::NoDestination => RpcFault::InvalidArgument(error.to_string()),
        _ => RpcFault::Internal(error.to_string()),
    }
}

#[async_trait::async_trait]
impl RpcHandler for NodeRpcHandler {
    async fn route_to_local(
        &self,
        username: &str,
        resource: &str,
        stanza: Stanza,
    ) -> Result<(), RpcFault> {
        self.local
            .route_to_bound(username, resource, stanza)
            .await
            .map_err(to_fault)
    }

    async fn disconnect_local(
        &self,
        username: &str,
        resource: &str,
        error: StreamError,
    ) -> Result<(), RpcFault> {
        self.local
            .disconnect_bound(username, resource, error)
            .await
            .map_err(to_fault)
    }

    async fn route_to_component(&self, host: &str, stanza: Stanza) -> Result<(), RpcFault> {
        self.components.route(host, stanza).await.map_err(to_fault)
    }

    async fn transfer_queue(
        &self,
        queue_id: &str,
    ) -> Result<Option<TransferredQueue>, RpcFault> {
        Ok(self.sm_queues.claim(queue_id))
    }
}
