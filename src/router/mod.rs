//! Top-level router: destination choice for every accepted stanza.
//!
//! `route` runs the inbound interceptor chain, normalizes the destination
//! (a missing `to` defaults to the sender's bare JID), and dispatches to
//! exactly one of: a registered component host, the local router for
//! hosted domains (after checking the account exists), or the S2S
//! provider for remote domains.

pub mod local;
pub mod s2s;

pub use local::LocalRouter;
pub use s2s::{NoFederation, S2SOutProvider};

use crate::components::ComponentRegistry;
use crate::error::{RouterError, RouterResult};
use crate::interceptor::{InterceptorPipeline, PipelineOutcome};
use crate::storage::Storage;
use crate::telemetry::RouteTimer;
use rxmpp_proto::Stanza;
use std::sync::Arc;
use tracing::debug;

/// The routing front door.
pub struct Router {
    hosts: Vec<String>,
    interceptors: Arc<InterceptorPipeline>,
    components: Arc<ComponentRegistry>,
    local: Arc<LocalRouter>,
    s2s: Arc<dyn S2SOutProvider>,
    storage: Storage,
}

impl Router {
    pub fn new(
        hosts: Vec<String>,
        interceptors: Arc<InterceptorPipeline>,
        components: Arc<ComponentRegistry>,
        local: Arc<LocalRouter>,
        s2s: Arc<dyn S2SOutProvider>,
        storage: Storage,
    ) -> Arc<Self> {
        Arc::new(Self {
            hosts,
            interceptors,
            components,
            local,
            s2s,
            storage,
        })
    }

    /// Whether `domain` is one of the hosted domains.
    pub fn is_local_host(&self, domain: &str) -> bool {
        self.hosts.iter().any(|h| h == domain)
    }

    /// The local delivery engine (peer RPC ingress uses it directly).
    pub fn local(&self) -> &Arc<LocalRouter> {
        &self.local
    }

    /// Route one stanza. Errors describe why the stanza went nowhere; the
    /// caller decides whether to turn them into an error stanza (see
    /// [`Router::route_with_bounce`]).
    pub async fn route(&self, stanza: Stanza) -> RouterResult<()> {
        crate::metrics::record_incoming(stanza.kind().as_str());

        // Inbound interceptors run exactly once per hop, before any
        // destination decision.
        let stanza = match self.interceptors.run_incoming(stanza).await {
            PipelineOutcome::Continue(s) => s,
            PipelineOutcome::Interrupted => return Err(RouterError::InterceptInterrupted),
            PipelineOutcome::Failed(original) => {
                self.bounce(&original, &RouterError::InterceptFailed).await;
                return Err(RouterError::InterceptFailed);
            }
        };

        self.route_resolved(stanza).await
    }

    /// Route and, on a bounceable failure, answer the sender with the
    /// corresponding error stanza. This is the entry point stream state
    /// machines and RPC ingress use.
    pub async fn route_with_bounce(&self, stanza: Stanza) -> RouterResult<()> {
        match self.route(stanza.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                crate::metrics::record_route_error(e.error_code());
                self.bounce(&stanza, &e).await;
                Err(e)
            }
        }
    }

    /// Destination choice after interception and normalization.
    async fn route_resolved(&self, stanza: Stanza) -> RouterResult<()> {
        // Normalize: default destination is the sender's bare JID.
        let stanza = match stanza.to_jid() {
            Some(_) => stanza,
            None => {
                let sender_bare = stanza
                    .from_jid()
                    .map(|j| j.to_bare())
                    .ok_or(RouterError::NoDestination)?;
                stanza.with_to(&sender_bare)
            }
        };
        let to = stanza.to_jid().cloned().expect("destination normalized");
        let domain = to.domain().to_string();

        if self.components.is_component_host(&domain) {
            let _timer = RouteTimer::new("component");
            debug!(to = %to, "dispatch to component");
            return self.components.route(&domain, stanza).await;
        }

        if self.is_local_host(&domain) {
            let _timer = RouteTimer::new("local");
            if let Some(node) = to.node() {
                let exists = self.storage.users.user_exists(node).await?;
                if !exists {
                    return Err(RouterError::NotExistingAccount(node.to_string()));
                }
            }
            debug!(to = %to, "dispatch to local router");
            return self.local.route(stanza).await;
        }

        let _timer = RouteTimer::new("s2s");
        debug!(to = %to, "dispatch to s2s provider");
        self.s2s.route(stanza).await
    }

    /// Build and send the error stanza a failure owes the sender.
    async fn bounce(&self, original: &Stanza, error: &RouterError) {
        let Some(condition) = error.bounce_condition() else {
            return;
        };
        let Some(reply) = original.error_reply(condition) else {
            return;
        };
        // The bounce takes the ordinary resolved path; error stanzas are
        // never bounced again, so this cannot loop.
        if let Err(e) = self.route_resolved(reply).await {
            debug!(error = %e, "error bounce went nowhere");
        }
    }
}

#[cfg(test)]
mod tests;
