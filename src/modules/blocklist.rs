//! Blocking command policy (XEP-0191 semantics on the routing path).
//!
//! Registered on both interceptor chains at high priority. Inbound stanzas
//! from a JID the destination user blocks are interrupted; messages and iq
//! requests are answered with `service-unavailable` on the blocked
//! sender's behalf, presence is dropped silently. Outbound stanzas to a
//! blocked JID bounce the same way, so a user cannot talk through their
//! own wall.
//!
//! Block list items match the way XEP-0191 defines: a full-JID item
//! matches exactly, a bare item matches every resource, a domain-only
//! item matches the whole domain.

use crate::error::RouterError;
use crate::hooks::{self, HookError, HookHandler, HookOutcome, HookPayload, Hooks};
use crate::interceptor::{
    Intercept, InterceptError, InterceptorPipeline, InterceptorRecord, StanzaInterceptor,
};
use crate::router::Router;
use crate::storage::{BlockListItem, BlockListRepository};
use dashmap::DashMap;
use rxmpp_proto::{Jid, Stanza, StanzaErrorCondition};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, warn};

/// Interceptor chain priority; blocking runs before ordinary modules.
const PRIORITY: i32 = 1000;

const ID_IN: &str = "blocklist:in";
const ID_OUT: &str = "blocklist:out";

/// The blocklist module.
pub struct BlockListModule {
    repository: Arc<dyn BlockListRepository>,
    router: OnceLock<Weak<Router>>,
    cache: DashMap<String, Arc<Vec<Jid>>>,
}

impl BlockListModule {
    pub fn new(repository: Arc<dyn BlockListRepository>) -> Arc<Self> {
        Arc::new(Self {
            repository,
            router: OnceLock::new(),
            cache: DashMap::new(),
        })
    }

    /// Wire the module: router handle (weak, modules never own the
    /// router), interceptor records, and cache-invalidation hooks.
    pub fn register(
        self: &Arc<Self>,
        router: &Arc<Router>,
        pipeline: &InterceptorPipeline,
        hooks: &Hooks,
    ) {
        let _ = self.router.set(Arc::downgrade(router));
        pipeline.register(InterceptorRecord {
            id: ID_IN.to_string(),
            priority: PRIORITY,
            incoming: true,
            handler: Arc::clone(self) as Arc<dyn StanzaInterceptor>,
        });
        pipeline.register(InterceptorRecord {
            id: ID_OUT.to_string(),
            priority: PRIORITY,
            incoming: false,
            handler: Arc::clone(self) as Arc<dyn StanzaInterceptor>,
        });
        hooks.subscribe(
            hooks::USER_DELETED,
            0,
            Arc::clone(self) as Arc<dyn HookHandler>,
        );
    }

    /// Add one item. Idempotent.
    pub async fn block(&self, item: &BlockListItem) -> Result<(), crate::error::StorageError> {
        self.repository.upsert_block_list_item(item).await?;
        self.cache.remove(&item.username);
        Ok(())
    }

    /// Remove one item. Removing an absent item succeeds.
    pub async fn unblock(&self, item: &BlockListItem) -> Result<(), crate::error::StorageError> {
        self.repository.delete_block_list_item(item).await?;
        self.cache.remove(&item.username);
        Ok(())
    }

    async fn blocked_jids(&self, username: &str) -> Result<Arc<Vec<Jid>>, InterceptError> {
        if let Some(cached) = self.cache.get(username) {
            return Ok(Arc::clone(&cached));
        }
        let items = self.repository.fetch_block_list_items(username).await?;
        let jids = Arc::new(items.into_iter().map(|i| i.jid).collect::<Vec<_>>());
        self.cache.insert(username.to_string(), Arc::clone(&jids));
        Ok(jids)
    }

    /// Answer a blocked stanza on the server's behalf, then interrupt.
    async fn reject(&self, stanza: &Stanza) -> Intercept {
        // Presence is dropped without a trace; everything else earns a
        // service-unavailable error.
        if !stanza.is_presence() {
            if let Some(reply) = stanza.error_reply(StanzaErrorCondition::ServiceUnavailable) {
                match self.router.get().and_then(Weak::upgrade) {
                    Some(router) => {
                        if let Err(e) = router.route(reply).await {
                            match e {
                                RouterError::InterceptInterrupted => {}
                                e => debug!(error = %e, "blocklist reject reply not routed"),
                            }
                        }
                    }
                    None => warn!("blocklist module used before wiring"),
                }
            }
        }
        Intercept::Interrupt
    }
}

#[async_trait::async_trait]
impl StanzaInterceptor for BlockListModule {
    async fn intercept(&self, stanza: Stanza, id: &str) -> Result<Intercept, InterceptError> {
        // The local side whose list applies: destination for inbound,
        // sender for outbound.
        let (owner, other) = match id {
            ID_IN => (stanza.to_jid(), stanza.from_jid()),
            _ => (stanza.from_jid(), stanza.to_jid()),
        };
        let (Some(owner), Some(other)) = (owner, other) else {
            return Ok(Intercept::Continue(stanza));
        };
        let Some(username) = owner.node() else {
            return Ok(Intercept::Continue(stanza));
        };

        let blocked = self.blocked_jids(username).await?;
        if blocked.iter().any(|item| item_matches(item, other)) {
            debug!(owner = %owner, other = %other, chain = id, "stanza blocked");
            return Ok(self.reject(&stanza).await);
        }
        Ok(Intercept::Continue(stanza))
    }
}

#[async_trait::async_trait]
impl HookHandler for BlockListModule {
    async fn run(&self, payload: &HookPayload) -> Result<HookOutcome, HookError> {
        if let HookPayload::User { username } = payload {
            self.cache.remove(username);
            self.repository.delete_block_list_items(username).await?;
        }
        Ok(HookOutcome::Continue)
    }
}

/// XEP-0191 item matching.
fn item_matches(item: &Jid, other: &Jid) -> bool {
    if item.is_domain_only() {
        return item.matches_domain(other);
    }
    if item.is_full() {
        return item.matches_full(other);
    }
    item.matches_bare(other)
}
