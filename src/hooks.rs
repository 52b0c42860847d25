//! In-process hook bus.
//!
//! Modules react to router and stream lifecycle events by subscribing named
//! topics with a priority. Dispatch is synchronous in the caller's task:
//! handlers run one after another in descending priority order, and a
//! handler may return [`HookOutcome::Halt`] to stop propagation and tell
//! the dispatching code to skip its default post-processing (the way the
//! blocklist answers a stanza itself). Handler errors do not halt the
//! chain; the first error is handed back once the chain finishes.

use crate::cluster::memberlist::ClusterMember;
use parking_lot::RwLock;
use rxmpp_proto::{Jid, Stanza};
use std::collections::HashMap;
use std::sync::Arc;

/// A C2S stream completed resource binding.
pub const C2S_STREAM_BOUND: &str = "c2s.stream.bound";
/// A C2S stream left the hub (transport closed, resource unregistered).
pub const C2S_STREAM_UNREGISTERED: &str = "c2s.stream.unregistered";
/// A stanza-level element arrived on a C2S stream.
pub const C2S_ELEMENT_RECEIVED: &str = "c2s.element.received";
/// A presence was routed; carries the stanza for capability harvesting.
pub const PRESENCE_RECEIVED: &str = "presence.received";
/// A message had no available recipient; offline modules subscribe here.
pub const OFFLINE_MESSAGE: &str = "offline.message.archived";
/// The cluster membership view changed.
pub const MEMBER_LIST_UPDATED: &str = "memberlist.updated";
/// An account was deleted; state tied to it must be dropped.
pub const USER_DELETED: &str = "user.deleted";
/// All configured components finished starting.
pub const COMPONENTS_STARTED: &str = "components.started";
/// A component stream authenticated and registered its host.
pub const COMPONENT_STREAM_REGISTERED: &str = "component.stream.registered";

/// What a handler tells the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    /// Keep running later handlers and the caller's default processing.
    Continue,
    /// Stop the chain; the caller must skip its default processing.
    Halt,
}

/// Boxed error type carried out of handlers.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Event payload handed to every handler of a topic.
#[derive(Debug, Clone)]
pub enum HookPayload {
    /// Stream lifecycle: id plus the bound JID when one exists.
    Stream {
        /// The stream identifier.
        stream_id: String,
        /// Bound JID, present from `bound` state on.
        jid: Option<Jid>,
    },
    /// A stanza-bearing event.
    Stanza(Stanza),
    /// Membership delta from the cluster view.
    MemberList {
        /// Members that appeared since the previous snapshot.
        registered: Vec<ClusterMember>,
        /// KV keys of members that disappeared.
        unregistered_keys: Vec<String>,
    },
    /// Account lifecycle.
    User {
        /// The affected username.
        username: String,
    },
    /// No payload.
    Empty,
}

/// A hook handler. Runs in the dispatching task and may await.
#[async_trait::async_trait]
pub trait HookHandler: Send + Sync {
    /// Handle one event.
    async fn run(&self, payload: &HookPayload) -> Result<HookOutcome, HookError>;
}

struct Registration {
    priority: i32,
    handler: Arc<dyn HookHandler>,
}

/// The process-wide topic registry.
#[derive(Default)]
pub struct Hooks {
    topics: RwLock<HashMap<&'static str, Vec<Registration>>>,
}

impl Hooks {
    /// An empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to `topic`. Higher priorities run first; equal
    /// priorities run in subscription order.
    pub fn subscribe(&self, topic: &'static str, priority: i32, handler: Arc<dyn HookHandler>) {
        let mut topics = self.topics.write();
        let regs = topics.entry(topic).or_default();
        let at = regs
            .iter()
            .position(|r| r.priority < priority)
            .unwrap_or(regs.len());
        regs.insert(at, Registration { priority, handler });
    }

    /// Dispatch an event to every subscriber of `topic`.
    ///
    /// Returns `Ok(Halt)` as soon as a handler halts. Otherwise the chain
    /// runs to completion and the first handler error (if any) is returned.
    pub async fn dispatch(
        &self,
        topic: &str,
        payload: &HookPayload,
    ) -> Result<HookOutcome, HookError> {
        // Snapshot under the lock, await outside it.
        let handlers: Vec<Arc<dyn HookHandler>> = {
            let topics = self.topics.read();
            match topics.get(topic) {
                Some(regs) => regs.iter().map(|r| Arc::clone(&r.handler)).collect(),
                None => return Ok(HookOutcome::Continue),
            }
        };

        let mut first_err: Option<HookError> = None;
        for handler in handlers {
            match handler.run(payload).await {
                Ok(HookOutcome::Halt) => return Ok(HookOutcome::Halt),
                Ok(HookOutcome::Continue) => {}
                Err(e) => {
                    tracing::warn!(topic = %topic, error = %e, "hook handler failed");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(HookOutcome::Continue),
        }
    }

    /// Number of subscribers on a topic (used by admin introspection).
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map_or(0, Vec::len)
    }
}
