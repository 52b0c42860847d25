//! Local router: delivery to a user's bound streams.
//!
//! Implements the RFC 6120/6121 delivery contracts over the distributed
//! resource map:
//!
//! - full JID: direct to the owning stream here, forwarded to the owning
//!   node, or handled by kind when nothing is bound;
//! - bare JID message: all resources tied at the highest presence priority
//!   strictly greater than zero; zero and negative priorities never
//!   receive;
//! - bare JID presence: every available resource;
//! - bare JID iq get/set: bounced `service-unavailable`.
//!
//! A destination whose node has vanished from the mesh converts to
//! offline delivery rather than an error. Offline delivery is a hook
//! event; storage modules subscribe to it.

use crate::cluster::router::ClusterRouter;
use crate::error::{ClusterError, InstanceId, RouterError, RouterResult};
use crate::hooks::{self, HookPayload, Hooks};
use crate::interceptor::{InterceptorPipeline, PipelineOutcome};
use crate::state::hub::StreamHub;
use crate::state::resources::{ResourceDescriptor, ResourceManager};
use rxmpp_proto::{Jid, Stanza, StreamError};
use std::sync::Arc;
use tracing::{debug, warn};

/// Delivery engine for locally-hosted users.
pub struct LocalRouter {
    instance_id: InstanceId,
    hub: Arc<StreamHub>,
    resources: Arc<ResourceManager>,
    cluster: Option<Arc<ClusterRouter>>,
    interceptors: Arc<InterceptorPipeline>,
    hooks: Arc<Hooks>,
}

impl LocalRouter {
    pub fn new(
        instance_id: InstanceId,
        hub: Arc<StreamHub>,
        resources: Arc<ResourceManager>,
        cluster: Option<Arc<ClusterRouter>>,
        interceptors: Arc<InterceptorPipeline>,
        hooks: Arc<Hooks>,
    ) -> Self {
        Self {
            instance_id,
            hub,
            resources,
            cluster,
            interceptors,
            hooks,
        }
    }

    /// Route a stanza whose destination domain is hosted here. The `to`
    /// JID is already normalized by the top-level router.
    pub async fn route(&self, stanza: Stanza) -> RouterResult<()> {
        let to = stanza
            .to_jid()
            .cloned()
            .ok_or(RouterError::NoDestination)?;
        let username = match to.node() {
            Some(node) => node.to_string(),
            // Server-addressed stanzas that no interceptor answered.
            None => return Err(RouterError::UserNotAvailable(to.to_string())),
        };

        let resources = self.resources.get_resources(&username).await
            .map_err(ClusterError::from)?;

        if to.is_full() {
            self.route_full(&stanza, &to, &username, &resources).await
        } else {
            self.route_bare(&stanza, &username, &resources).await
        }
    }

    async fn route_full(
        &self,
        stanza: &Stanza,
        to: &Jid,
        username: &str,
        resources: &[ResourceDescriptor],
    ) -> RouterResult<()> {
        let resource = to.resource().expect("full jid has a resource");
        let descriptor = resources.iter().find(|d| d.resource() == resource);

        match descriptor {
            Some(descriptor) => match self.deliver(descriptor, stanza).await {
                Ok(()) => Ok(()),
                // Owning node gone between map read and forward.
                Err(RouterError::Cluster(ClusterError::ConnNotFound(_)))
                    if stanza.is_routable_message() =>
                {
                    self.offline(stanza).await
                }
                Err(e) => Err(e),
            },
            None if stanza.is_routable_message() => self.offline(stanza).await,
            None if stanza.is_subscription_presence() => {
                // Subscription management reaches whatever is available;
                // with nothing bound the roster layer still saw the hop.
                for descriptor in resources.iter().filter(|d| d.is_available()) {
                    let _ = self.deliver(descriptor, stanza).await;
                }
                Ok(())
            }
            None if stanza.is_error() => Ok(()),
            None => Err(RouterError::ResourceNotFound {
                user: username.to_string(),
                resource: resource.to_string(),
            }),
        }
    }

    async fn route_bare(
        &self,
        stanza: &Stanza,
        username: &str,
        resources: &[ResourceDescriptor],
    ) -> RouterResult<()> {
        if stanza.is_message() {
            if stanza.is_error() {
                return Ok(());
            }
            let eligible: Vec<&ResourceDescriptor> = resources
                .iter()
                .filter(|d| d.is_available() && d.priority() > 0)
                .collect();
            let Some(max) = eligible.iter().map(|d| d.priority()).max() else {
                return if stanza.is_routable_message() {
                    self.offline(stanza).await
                } else {
                    Ok(())
                };
            };

            let mut delivered = 0usize;
            for descriptor in eligible.into_iter().filter(|d| d.priority() == max) {
                match self.deliver(descriptor, stanza).await {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        debug!(jid = %descriptor.jid, error = %e, "bare-jid delivery leg failed")
                    }
                }
            }
            if delivered == 0 && stanza.is_routable_message() {
                return self.offline(stanza).await;
            }
            return Ok(());
        }

        if stanza.is_presence() {
            for descriptor in resources.iter().filter(|d| d.is_available()) {
                if let Err(e) = self.deliver(descriptor, stanza).await {
                    debug!(jid = %descriptor.jid, error = %e, "presence broadcast leg failed");
                }
            }
            return Ok(());
        }

        // iq to a bare JID.
        if stanza.is_iq_request() {
            return Err(RouterError::UserNotAvailable(username.to_string()));
        }
        Ok(())
    }

    /// Deliver to one descriptor, local or remote.
    async fn deliver(&self, descriptor: &ResourceDescriptor, stanza: &Stanza) -> RouterResult<()> {
        if descriptor.instance_id == self.instance_id {
            return self.deliver_here(descriptor, stanza).await;
        }

        let cluster = self
            .cluster
            .as_ref()
            .ok_or_else(|| ClusterError::ConnNotFound(descriptor.instance_id.clone()))?;
        cluster
            .route(
                stanza.clone(),
                descriptor.username(),
                descriptor.resource(),
                &descriptor.instance_id,
            )
            .await?;
        crate::metrics::record_outgoing(stanza.kind().as_str());
        Ok(())
    }

    /// Write onto a stream bound on this node. The outbound interceptor
    /// chain runs here, on the transport-write side of the hop.
    async fn deliver_here(
        &self,
        descriptor: &ResourceDescriptor,
        stanza: &Stanza,
    ) -> RouterResult<()> {
        let stanza = match self.interceptors.run_outgoing(stanza.clone()).await {
            PipelineOutcome::Continue(s) => s,
            PipelineOutcome::Interrupted => return Ok(()),
            PipelineOutcome::Failed(_) => return Err(RouterError::InterceptFailed),
        };

        let handle = self.hub.lookup_full(&descriptor.jid).ok_or_else(|| {
            RouterError::ResourceNotFound {
                user: descriptor.username().to_string(),
                resource: descriptor.resource().to_string(),
            }
        })?;
        if handle.send_element(stanza.element().clone()) {
            crate::metrics::record_outgoing(stanza.kind().as_str());
            Ok(())
        } else {
            Err(RouterError::ResourceNotFound {
                user: descriptor.username().to_string(),
                resource: descriptor.resource().to_string(),
            })
        }
    }

    /// Serve a peer's `RouteToLocal`: the destination must be bound here.
    pub async fn route_to_bound(
        &self,
        username: &str,
        resource: &str,
        stanza: Stanza,
    ) -> RouterResult<()> {
        let descriptor = self
            .resources
            .get_resource(username, resource)
            .await
            .map_err(ClusterError::from)?
            .filter(|d| d.instance_id == self.instance_id)
            .ok_or_else(|| RouterError::ResourceNotFound {
                user: username.to_string(),
                resource: resource.to_string(),
            })?;
        crate::metrics::record_incoming(stanza.kind().as_str());
        self.deliver_here(&descriptor, &stanza).await
    }

    /// Force-disconnect a stream bound here (conflict policy, admin kick,
    /// or a peer's `DisconnectLocal`).
    pub async fn disconnect_bound(
        &self,
        username: &str,
        resource: &str,
        error: StreamError,
    ) -> RouterResult<()> {
        let descriptor = self
            .resources
            .get_resource(username, resource)
            .await
            .map_err(ClusterError::from)?
            .filter(|d| d.instance_id == self.instance_id)
            .ok_or_else(|| RouterError::ResourceNotFound {
                user: username.to_string(),
                resource: resource.to_string(),
            })?;
        let handle = self.hub.lookup_full(&descriptor.jid).ok_or_else(|| {
            RouterError::ResourceNotFound {
                user: username.to_string(),
                resource: resource.to_string(),
            }
        })?;
        handle.disconnect(error).await;
        Ok(())
    }

    async fn offline(&self, stanza: &Stanza) -> RouterResult<()> {
        debug!(to = ?stanza.to_jid().map(Jid::to_string), "message handed to offline hook");
        if let Some(c) = crate::metrics::OFFLINE_MESSAGES.get() {
            c.inc();
        }
        let payload = HookPayload::Stanza(stanza.clone());
        if let Err(e) = self.hooks.dispatch(hooks::OFFLINE_MESSAGE, &payload).await {
            warn!(error = %e, "offline hook failed");
        }
        Ok(())
    }
}
