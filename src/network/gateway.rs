//! Gateway - TCP/TLS listeners that accept incoming streams.
//!
//! One accept loop per configured listener. Each accepted connection gets
//! a transport (plain, or TLS immediately on direct-TLS listeners) and a
//! stream actor of the listener's kind: C2S or XEP-0114 component. Accept
//! errors are logged and the loop continues; `stop` closes the sockets
//! and broadcasts shutdown through the hubs.

use crate::auth::Authenticator;
use crate::cluster::router::ClusterRouter;
use crate::components::ComponentRegistry;
use crate::config::{LimitsConfig, ListenerConfig, ListenerKind, TlsConfig};
use crate::error::InstanceId;
use crate::hooks::Hooks;
use crate::network::c2s::{C2SDeps, spawn_c2s};
use crate::network::component::{ComponentDeps, spawn_component};
use crate::network::transport::Transport;
use crate::router::Router;
use crate::shaper::Shapers;
use crate::state::hub::StreamHub;
use crate::state::resources::ResourceManager;
use crate::state::smqueue::SmQueueRegistry;
use crate::storage::Storage;
use rustls_pemfile::{certs, pkcs8_private_keys};
use std::io::{BufReader, Cursor};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::{error, info, warn};

/// Shared dependencies the gateway hands to every stream actor.
pub struct GatewayContext {
    pub instance_id: InstanceId,
    pub hosts: Vec<String>,
    pub limits: LimitsConfig,
    pub router: Arc<Router>,
    pub hooks: Arc<Hooks>,
    pub resources: Arc<ResourceManager>,
    pub shapers: Arc<Shapers>,
    pub authenticator: Arc<dyn Authenticator>,
    pub storage: Storage,
    pub components: Arc<ComponentRegistry>,
    pub cluster: Option<Arc<ClusterRouter>>,
    pub sm_queues: Arc<SmQueueRegistry>,
    pub c2s_hub: Arc<StreamHub>,
    pub component_hub: Arc<StreamHub>,
}

struct ListenerRuntime {
    addr: SocketAddr,
    task: tokio::task::JoinHandle<()>,
}

/// The accept side of the node.
pub struct Gateway {
    listeners: Vec<ListenerRuntime>,
    context: Arc<GatewayContext>,
}

impl Gateway {
    /// Bind every configured listener and start accepting.
    pub async fn bind(
        configs: &[ListenerConfig],
        context: Arc<GatewayContext>,
    ) -> anyhow::Result<Self> {
        let mut listeners = Vec::with_capacity(configs.len());
        for config in configs {
            listeners.push(Self::bind_one(config, Arc::clone(&context)).await?);
        }
        Ok(Self { listeners, context })
    }

    async fn bind_one(
        config: &ListenerConfig,
        context: Arc<GatewayContext>,
    ) -> anyhow::Result<ListenerRuntime> {
        let listener = TcpListener::bind(config.address).await?;
        let addr = listener.local_addr()?;
        info!(%addr, kind = ?config.kind, direct_tls = config.direct_tls, "listener bound");

        let acceptor = match &config.tls {
            Some(tls) => Some(Self::load_tls(tls)?),
            None => None,
        };
        let config = config.clone();

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        if config.tcp_keep_alive {
                            let sock = socket2::SockRef::from(&stream);
                            if let Err(e) = sock.set_keepalive(true) {
                                warn!(%peer_addr, error = %e, "failed to enable tcp keep-alive");
                            }
                        }
                        info!(%peer_addr, kind = ?config.kind, "connection accepted");

                        let context = Arc::clone(&context);
                        let acceptor = acceptor.clone();
                        let config = config.clone();
                        tokio::spawn(async move {
                            accept_stream(stream, peer_addr, &config, acceptor, context).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                    }
                }
            }
        });

        Ok(ListenerRuntime { addr, task })
    }

    /// Load TLS certificates and create a TlsAcceptor.
    fn load_tls(config: &TlsConfig) -> anyhow::Result<TlsAcceptor> {
        let cert_file = std::fs::read(&config.cert_path)?;
        let cert_reader = &mut BufReader::new(Cursor::new(cert_file));
        let certs: Vec<CertificateDer> = certs(cert_reader).collect::<Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            anyhow::bail!("No certificates found in {}", config.cert_path);
        }

        let key_file = std::fs::read(&config.key_path)?;
        let key_reader = &mut BufReader::new(Cursor::new(key_file));
        let mut keys: Vec<PrivateKeyDer> = pkcs8_private_keys(key_reader)
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(PrivateKeyDer::from)
            .collect();
        if keys.is_empty() {
            anyhow::bail!("No private keys found in {}", config.key_path);
        }
        let key = keys.remove(0);

        let tls_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(TlsAcceptor::from(Arc::new(tls_config)))
    }

    /// Bound addresses, in configuration order.
    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|l| l.addr).collect()
    }

    /// Stop accepting and drain every live stream.
    pub async fn stop(&self) {
        for listener in &self.listeners {
            listener.task.abort();
        }
        let drain = self.context.limits.disconnect_timeout();
        self.context.c2s_hub.broadcast_shutdown(drain).await;
        self.context.component_hub.broadcast_shutdown(drain).await;
        info!("gateway stopped");
    }
}

async fn accept_stream(
    stream: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    config: &ListenerConfig,
    acceptor: Option<TlsAcceptor>,
    context: Arc<GatewayContext>,
) {
    let max_stanza_size = context.limits.max_stanza_size;

    let transport = if config.direct_tls {
        let Some(acceptor) = acceptor.clone() else {
            error!(%peer_addr, "direct-tls listener without an acceptor");
            return;
        };
        match acceptor.accept(stream).await {
            Ok(tls) => Transport::tls(tls, max_stanza_size),
            Err(e) => {
                warn!(%peer_addr, error = %e, "tls handshake failed");
                return;
            }
        }
    } else {
        Transport::plain(stream, max_stanza_size)
    };

    match config.kind {
        ListenerKind::C2s => {
            let deps = Arc::new(C2SDeps {
                instance_id: context.instance_id.clone(),
                hosts: context.hosts.clone(),
                limits: context.limits.clone(),
                conflict_policy: config.resource_conflict,
                router: Arc::clone(&context.router),
                hooks: Arc::clone(&context.hooks),
                resources: Arc::clone(&context.resources),
                shapers: Arc::clone(&context.shapers),
                authenticator: Arc::clone(&context.authenticator),
                storage: context.storage.clone(),
                hub: Arc::clone(&context.c2s_hub),
                cluster: context.cluster.clone(),
                sm_queues: Arc::clone(&context.sm_queues),
                tls: if config.direct_tls { None } else { acceptor },
            });
            spawn_c2s(deps, transport);
        }
        ListenerKind::Component => {
            let deps = Arc::new(ComponentDeps {
                instance_id: context.instance_id.clone(),
                local_hosts: context.hosts.clone(),
                secret: config.secret.clone().unwrap_or_default(),
                limits: context.limits.clone(),
                router: Arc::clone(&context.router),
                hooks: Arc::clone(&context.hooks),
                registry: Arc::clone(&context.components),
                hub: Arc::clone(&context.component_hub),
            });
            spawn_component(deps, transport);
        }
    }
}
