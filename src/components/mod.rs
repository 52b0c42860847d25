//! Component registry.
//!
//! Components serve their own domain (`upload.ex.org` and friends) behind
//! one interface. Three kinds coexist behind a tagged variant, selected by
//! discriminant:
//!
//! - **Local**: compiled-in implementations; `process_stanza` runs
//!   in-process.
//! - **External**: attached over a XEP-0114 stream; stanzas are written
//!   onto the component's hub entry. The binding `ec://<host> = i=<id>` is
//!   published in the cluster KV.
//! - **Proxy**: installed from the `ec://` watch for bindings owned by
//!   other nodes; stanzas forward over the cluster mesh.

use crate::cluster::connmgr::ConnManager;
use crate::cluster::kv::{COMPONENT_KEY_PREFIX, KvEvent, KvStore, LeaseId};
use crate::error::{ComponentError, InstanceId, RouterError, RouterResult};
use crate::state::hub::StreamHub;
use dashmap::DashMap;
use parking_lot::Mutex;
use rxmpp_proto::Stanza;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A compiled-in component implementation.
#[async_trait::async_trait]
pub trait LocalComponent: Send + Sync {
    /// Human-readable name for logs and discovery.
    fn name(&self) -> &str;
    /// Handle one stanza addressed to the component's host.
    async fn process(&self, stanza: Stanza) -> RouterResult<()>;
    /// Lifecycle start.
    async fn start(&self) -> RouterResult<()> {
        Ok(())
    }
    /// Lifecycle stop.
    async fn stop(&self) -> RouterResult<()> {
        Ok(())
    }
}

/// Behaviour variants behind the single component interface.
enum ComponentKind {
    Local(Arc<dyn LocalComponent>),
    External {
        stream_id: String,
        hub: Arc<StreamHub>,
    },
    Proxy {
        instance_id: InstanceId,
        conns: Arc<ConnManager>,
    },
}

/// One registered component.
pub struct Component {
    host: String,
    name: String,
    kind: ComponentKind,
}

impl Component {
    /// The domain this component serves.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deliver one stanza. Behaviour is selected by the kind discriminant.
    pub async fn process_stanza(&self, stanza: Stanza) -> RouterResult<()> {
        match &self.kind {
            ComponentKind::Local(local) => local.process(stanza).await,
            ComponentKind::External { stream_id, hub } => {
                let handle = hub.get(stream_id).ok_or_else(|| {
                    RouterError::Component(ComponentError::StreamClosed(self.host.clone()))
                })?;
                if handle.send_element(stanza.into_element()) {
                    Ok(())
                } else {
                    Err(RouterError::Component(ComponentError::StreamClosed(
                        self.host.clone(),
                    )))
                }
            }
            ComponentKind::Proxy { instance_id, conns } => {
                let conn = conns.get_connection(instance_id)?;
                conn.component_router()
                    .route(&self.host, stanza)
                    .await
                    .map_err(RouterError::from)
            }
        }
    }

    fn is_proxy(&self) -> bool {
        matches!(self.kind, ComponentKind::Proxy { .. })
    }
}

/// Host → component map plus the `ec://` publication machinery.
pub struct ComponentRegistry {
    kv: Arc<dyn KvStore>,
    conns: Arc<ConnManager>,
    instance_id: InstanceId,
    lease: tokio::sync::Mutex<LeaseId>,
    ttl: Duration,
    components: DashMap<String, Arc<Component>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ComponentRegistry {
    /// Start the registry: grants the binding lease, starts its refresh
    /// loop and the `ec://` watch that installs proxies.
    pub async fn start(
        kv: Arc<dyn KvStore>,
        conns: Arc<ConnManager>,
        instance_id: InstanceId,
        ttl: Duration,
    ) -> Result<Arc<Self>, crate::error::KvError> {
        let lease = kv.grant_lease(ttl).await?;
        let registry = Arc::new(Self {
            kv,
            conns,
            instance_id,
            lease: tokio::sync::Mutex::new(lease),
            ttl,
            components: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
        });
        registry.spawn_refresh();
        registry.spawn_watch().await?;
        Ok(registry)
    }

    fn spawn_refresh(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let period = Duration::from_secs((registry.ttl.as_secs() / 3).max(1));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let mut lease = registry.lease.lock().await;
                if registry.kv.keep_alive(*lease).await.is_ok() {
                    continue;
                }
                warn!("component binding lease lost, re-publishing");
                match registry.kv.grant_lease(registry.ttl).await {
                    Ok(new_lease) => {
                        *lease = new_lease;
                        let external_hosts: Vec<String> = registry
                            .components
                            .iter()
                            .filter(|e| {
                                matches!(e.value().kind, ComponentKind::External { .. })
                            })
                            .map(|e| e.key().clone())
                            .collect();
                        for host in external_hosts {
                            let value = binding_value(&registry.instance_id);
                            if let Err(e) =
                                registry.kv.put(&binding_key(&host), value, Some(new_lease)).await
                            {
                                warn!(host = %host, error = %e, "binding re-put failed");
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "component lease re-grant failed"),
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn spawn_watch(self: &Arc<Self>) -> Result<(), crate::error::KvError> {
        let mut watch = self.kv.watch(COMPONENT_KEY_PREFIX, false).await?;
        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = watch.next().await {
                registry.apply_event(event);
            }
        });
        self.tasks.lock().push(handle);
        Ok(())
    }

    fn apply_event(&self, event: KvEvent) {
        match event {
            KvEvent::Put { key, value } => {
                let host = key.trim_start_matches(COMPONENT_KEY_PREFIX).to_string();
                let raw = String::from_utf8_lossy(&value);
                let Some(instance_id) = raw.strip_prefix("i=") else {
                    warn!(key = %key, "malformed component binding ignored");
                    return;
                };
                // A self-owned binding was installed directly by
                // register_external; only remote bindings become proxies.
                if instance_id == self.instance_id {
                    return;
                }
                info!(host = %host, instance_id = %instance_id, "installing proxy component");
                let component = Arc::new(Component {
                    host: host.clone(),
                    name: format!("proxy:{host}"),
                    kind: ComponentKind::Proxy {
                        instance_id: instance_id.to_string(),
                        conns: Arc::clone(&self.conns),
                    },
                });
                self.components.insert(host, component);
            }
            KvEvent::Del { key, .. } => {
                let host = key.trim_start_matches(COMPONENT_KEY_PREFIX);
                // Only proxies are torn down from the watch; local and
                // external components are removed by their own lifecycle.
                let is_proxy = self
                    .components
                    .get(host)
                    .is_some_and(|c| c.is_proxy());
                if is_proxy {
                    info!(host = %host, "removing proxy component");
                    self.components.remove(host);
                }
            }
        }
    }

    /// Register a compiled-in component and start it.
    pub async fn register_local(
        &self,
        host: &str,
        implementation: Arc<dyn LocalComponent>,
    ) -> RouterResult<()> {
        if self.components.contains_key(host) {
            return Err(RouterError::Component(ComponentError::AlreadyRegistered(
                host.to_string(),
            )));
        }
        implementation.start().await?;
        let component = Arc::new(Component {
            host: host.to_string(),
            name: implementation.name().to_string(),
            kind: ComponentKind::Local(implementation),
        });
        info!(host = %host, name = %component.name, "local component registered");
        self.components.insert(host.to_string(), component);
        Ok(())
    }

    /// Register a stream-backed external component (successful XEP-0114
    /// handshake) and publish its binding.
    pub async fn register_external(
        &self,
        host: &str,
        stream_id: &str,
        hub: Arc<StreamHub>,
    ) -> RouterResult<()> {
        let occupied = self
            .components
            .get(host)
            .is_some_and(|existing| !existing.is_proxy());
        if occupied {
            return Err(RouterError::Component(ComponentError::AlreadyRegistered(
                host.to_string(),
            )));
        }

        let component = Arc::new(Component {
            host: host.to_string(),
            name: format!("external:{host}"),
            kind: ComponentKind::External {
                stream_id: stream_id.to_string(),
                hub,
            },
        });
        self.components.insert(host.to_string(), component);

        let lease = *self.lease.lock().await;
        self.kv
            .put(
                &binding_key(host),
                binding_value(&self.instance_id),
                Some(lease),
            )
            .await
            .map_err(crate::error::ClusterError::from)
            .map_err(RouterError::from)?;
        info!(host = %host, stream_id = %stream_id, "external component registered");
        if let Some(g) = crate::metrics::CONNECTED_COMPONENTS.get() {
            g.inc();
        }
        Ok(())
    }

    /// Tear down an external component (stream closed).
    pub async fn unregister_external(&self, host: &str) {
        let removed = self
            .components
            .remove_if(host, |_, c| {
                matches!(c.kind, ComponentKind::External { .. })
            })
            .is_some();
        if removed {
            if let Err(e) = self.kv.del(&binding_key(host)).await {
                warn!(host = %host, error = %e, "binding delete failed");
            }
            info!(host = %host, "external component unregistered");
            if let Some(g) = crate::metrics::CONNECTED_COMPONENTS.get() {
                g.dec();
            }
        }
    }

    /// Whether a component is registered for `host`.
    pub fn is_component_host(&self, host: &str) -> bool {
        self.components.contains_key(host)
    }

    /// The component for `host`.
    pub fn get(&self, host: &str) -> Option<Arc<Component>> {
        self.components.get(host).map(|c| Arc::clone(&c))
    }

    /// Deliver a stanza to the component serving `host`.
    pub async fn route(&self, host: &str, stanza: Stanza) -> RouterResult<()> {
        let component = self.get(host).ok_or_else(|| {
            RouterError::Component(ComponentError::NotFound(host.to_string()))
        })?;
        debug!(host = %host, kind = %component.name, "stanza handed to component");
        component.process_stanza(stanza).await
    }

    /// Registered hosts.
    pub fn hosts(&self) -> Vec<String> {
        self.components.iter().map(|e| e.key().clone()).collect()
    }

    /// Stop local components and background loops.
    pub async fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let components: Vec<Arc<Component>> =
            self.components.iter().map(|e| Arc::clone(e.value())).collect();
        for component in components {
            if let ComponentKind::Local(local) = &component.kind {
                if let Err(e) = local.stop().await {
                    warn!(host = %component.host, error = %e, "local component stop failed");
                }
            }
        }
    }
}

fn binding_key(host: &str) -> String {
    format!("{COMPONENT_KEY_PREFIX}{host}")
}

fn binding_value(instance_id: &str) -> Vec<u8> {
    format!("i={instance_id}").into_bytes()
}
