//! Client-to-server stream state machine.
//!
//! Each accepted C2S connection becomes one actor task owning the
//! transport and every piece of per-stream state. All outside interaction
//! goes through the stream's operation queue: inbound parsed elements,
//! outbound sends scheduled by the router and modules, and disconnect
//! commands all land in the same mailbox and are processed by the one
//! task, so no stream state is ever locked.
//!
//! ```text
//! Connecting ── header ──> Connected ── auth ──> Authenticating
//!      Authenticating ── success + restart ──> Authenticated
//!      Authenticated ── bind ──> Bound ── close/error ──> Disconnected
//! ```
//!
//! STARTTLS keeps the state in `Connected` but wraps the transport; SASL
//! success and STARTTLS each restart the stream with a fresh header.

mod session;

pub use session::spawn_c2s;

use crate::auth::Authenticator;
use crate::cluster::router::ClusterRouter;
use crate::config::{LimitsConfig, ResourceConflict};
use crate::error::InstanceId;
use crate::hooks::Hooks;
use crate::router::Router;
use crate::shaper::Shapers;
use crate::state::hub::{StreamHandle, StreamHub};
use crate::state::resources::ResourceManager;
use crate::state::smqueue::SmQueueRegistry;
use crate::storage::Storage;
use parking_lot::RwLock;
use rxmpp_proto::{Element, Jid, StreamError};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsAcceptor;

/// C2S stream states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum C2SState {
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    Binding,
    Bound,
    Disconnected,
}

/// Operations posted onto a stream's mailbox.
pub(crate) enum StreamOp {
    /// Write an element, fire-and-forget.
    SendElement(Element),
    /// Write an element and confirm the flush.
    SendElementSync(Element, oneshot::Sender<()>),
    /// Close the stream with a stream error.
    Disconnect(StreamError),
}

/// Everything a C2S actor needs from the node.
pub struct C2SDeps {
    pub instance_id: InstanceId,
    pub hosts: Vec<String>,
    pub limits: LimitsConfig,
    pub conflict_policy: ResourceConflict,
    pub router: Arc<Router>,
    pub hooks: Arc<Hooks>,
    pub resources: Arc<ResourceManager>,
    pub shapers: Arc<Shapers>,
    pub authenticator: Arc<dyn Authenticator>,
    pub storage: Storage,
    pub hub: Arc<StreamHub>,
    pub cluster: Option<Arc<ClusterRouter>>,
    pub sm_queues: Arc<SmQueueRegistry>,
    pub tls: Option<TlsAcceptor>,
}

/// The posting surface of one C2S stream, stored in the hub.
pub struct C2SHandle {
    stream_id: String,
    jid: RwLock<Option<Jid>>,
    op_tx: mpsc::Sender<StreamOp>,
}

impl C2SHandle {
    pub(crate) fn new(stream_id: String, op_tx: mpsc::Sender<StreamOp>) -> Self {
        Self {
            stream_id,
            jid: RwLock::new(None),
            op_tx,
        }
    }

    pub(crate) fn set_jid(&self, jid: Jid) {
        *self.jid.write() = Some(jid);
    }

    /// Write an element and wait until it has been flushed to the socket.
    /// Returns false when the stream is gone.
    pub async fn send_element_sync(&self, element: Element) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .op_tx
            .send(StreamOp::SendElementSync(element, tx))
            .await
            .is_err()
        {
            return false;
        }
        rx.await.is_ok()
    }
}

#[async_trait::async_trait]
impl StreamHandle for C2SHandle {
    fn stream_id(&self) -> &str {
        &self.stream_id
    }

    fn jid(&self) -> Option<Jid> {
        self.jid.read().clone()
    }

    fn send_element(&self, element: Element) -> bool {
        self.op_tx.try_send(StreamOp::SendElement(element)).is_ok()
    }

    async fn disconnect(&self, error: StreamError) {
        let _ = self.op_tx.send(StreamOp::Disconnect(error)).await;
    }
}
