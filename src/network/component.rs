//! Inbound external-component streams (XEP-0114).
//!
//! A much simpler state machine than C2S: after the component's stream
//! header, the server issues a stream id, the component proves knowledge
//! of the shared secret with `<handshake>sha1(id || secret)</handshake>`,
//! and from then on every stanza it sends is routed. Handshake success
//! registers a stream-backed component for the bound host; the binding is
//! published in the cluster KV so other nodes install proxies.

use crate::components::ComponentRegistry;
use crate::config::LimitsConfig;
use crate::error::InstanceId;
use crate::hooks::{self, HookPayload, Hooks};
use crate::network::c2s::StreamOp;
use crate::network::transport::{Transport, TransportError};
use crate::router::Router;
use crate::state::hub::{StreamHandle, StreamHub};
use parking_lot::RwLock;
use rxmpp_proto::{
    Element, Jid, NS_COMPONENT, NS_STREAM, Stanza, StreamError, StreamErrorKind, StreamEvent,
};
use sha1::{Digest, Sha1};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const OP_QUEUE_DEPTH: usize = 128;

/// Component stream states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Connecting,
    Handshaking,
    Authenticated,
    Disconnected,
}

/// Everything a component actor needs from the node.
pub struct ComponentDeps {
    pub instance_id: InstanceId,
    /// Domains served by the node itself; a component may not shadow them.
    pub local_hosts: Vec<String>,
    pub secret: String,
    pub limits: LimitsConfig,
    pub router: Arc<Router>,
    pub hooks: Arc<Hooks>,
    pub registry: Arc<ComponentRegistry>,
    /// The component listener's stream hub.
    pub hub: Arc<StreamHub>,
}

/// Posting surface of a component stream.
pub struct ComponentHandle {
    stream_id: String,
    host: RwLock<Option<String>>,
    op_tx: mpsc::Sender<StreamOp>,
}

#[async_trait::async_trait]
impl StreamHandle for ComponentHandle {
    fn stream_id(&self) -> &str {
        &self.stream_id
    }

    fn jid(&self) -> Option<Jid> {
        self.host
            .read()
            .as_ref()
            .and_then(|h| Jid::domain_only(h).ok())
    }

    fn send_element(&self, element: Element) -> bool {
        self.op_tx.try_send(StreamOp::SendElement(element)).is_ok()
    }

    async fn disconnect(&self, error: StreamError) {
        let _ = self.op_tx.send(StreamOp::Disconnect(error)).await;
    }
}

/// Spawn the actor for an accepted component transport.
pub fn spawn_component(deps: Arc<ComponentDeps>, transport: Transport) -> Arc<ComponentHandle> {
    let stream_id = uuid::Uuid::new_v4().simple().to_string();
    let (op_tx, op_rx) = mpsc::channel(OP_QUEUE_DEPTH);
    let handle = Arc::new(ComponentHandle {
        stream_id: stream_id.clone(),
        host: RwLock::new(None),
        op_tx,
    });
    deps.hub
        .insert(Arc::clone(&handle) as Arc<dyn StreamHandle>);

    let session = ComponentSession {
        stream_id,
        deps,
        transport,
        handle: Arc::clone(&handle),
        op_rx,
        state: ComponentState::Connecting,
        host: None,
    };
    tokio::spawn(session.run());
    handle
}

struct ComponentSession {
    stream_id: String,
    deps: Arc<ComponentDeps>,
    transport: Transport,
    handle: Arc<ComponentHandle>,
    op_rx: mpsc::Receiver<StreamOp>,
    state: ComponentState,
    host: Option<String>,
}

impl ComponentSession {
    async fn run(mut self) {
        info!(stream_id = %self.stream_id, "component stream started");
        let mut last_read = Instant::now();

        while self.state != ComponentState::Disconnected {
            let deadline = last_read + self.phase_timeout();
            tokio::select! {
                op = self.op_rx.recv() => {
                    match op {
                        Some(StreamOp::SendElement(element)) => {
                            crate::metrics::record_outgoing(element.name());
                            if self.transport.write_element(&element).await.is_err() {
                                self.state = ComponentState::Disconnected;
                            }
                        }
                        Some(StreamOp::SendElementSync(element, ack)) => {
                            let _ = self.transport.write_element(&element).await;
                            let _ = ack.send(());
                        }
                        Some(StreamOp::Disconnect(error)) => {
                            self.close_with_error(error).await;
                        }
                        None => break,
                    }
                }
                event = self.transport.next_event() => {
                    last_read = Instant::now();
                    match event {
                        Ok(Some(event)) => self.handle_event(event).await,
                        Ok(None) => {
                            debug!(stream_id = %self.stream_id, "component closed the connection");
                            self.state = ComponentState::Disconnected;
                        }
                        Err(e) => self.handle_transport_error(e).await,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.close_with_error(StreamErrorKind::ConnectionTimeout.into()).await;
                }
            }
        }

        self.cleanup().await;
    }

    fn phase_timeout(&self) -> Duration {
        match self.state {
            ComponentState::Connecting | ComponentState::Handshaking => {
                self.deps.limits.connect_timeout()
            }
            ComponentState::Authenticated => self.deps.limits.keep_alive_timeout(),
            ComponentState::Disconnected => Duration::from_secs(1),
        }
    }

    async fn handle_transport_error(&mut self, error: TransportError) {
        let kind = match error {
            TransportError::StanzaTooLarge { limit } => {
                warn!(stream_id = %self.stream_id, limit, "component stanza size cap exceeded");
                StreamErrorKind::PolicyViolation
            }
            TransportError::Parse(_) => StreamErrorKind::InvalidXml,
            TransportError::Io(e) => {
                debug!(stream_id = %self.stream_id, error = %e, "component transport error");
                self.state = ComponentState::Disconnected;
                return;
            }
        };
        self.close_with_error(kind.into()).await;
    }

    async fn handle_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::StreamOpen(header) => self.handle_stream_open(header).await,
            StreamEvent::StreamClose => {
                let _ = self.transport.write_raw("</stream:stream>").await;
                self.state = ComponentState::Disconnected;
            }
            StreamEvent::Element(element) => match self.state {
                ComponentState::Handshaking if element.name() == "handshake" => {
                    self.handle_handshake(element).await;
                }
                ComponentState::Authenticated => self.handle_stanza(element).await,
                _ => {
                    self.close_with_error(StreamErrorKind::NotAuthorized.into()).await;
                }
            },
        }
    }

    async fn handle_stream_open(&mut self, header: Element) {
        if self.state != ComponentState::Connecting {
            self.close_with_error(StreamErrorKind::PolicyViolation.into()).await;
            return;
        }
        let host = header.attr("to").unwrap_or_default().to_string();

        let open = format!(
            "<?xml version=\"1.0\"?><stream:stream xmlns=\"{NS_COMPONENT}\" \
             xmlns:stream=\"{NS_STREAM}\" from=\"{}\" id=\"{}\">",
            host, self.stream_id
        );
        if self.transport.write_raw(&open).await.is_err() {
            self.state = ComponentState::Disconnected;
            return;
        }

        if header.namespace() != Some(NS_COMPONENT) {
            self.close_with_error(StreamErrorKind::InvalidNamespace.into()).await;
            return;
        }
        if host.is_empty() || self.deps.local_hosts.iter().any(|h| *h == host) {
            self.close_with_error(StreamErrorKind::HostUnknown.into()).await;
            return;
        }

        self.host = Some(host);
        self.state = ComponentState::Handshaking;
    }

    async fn handle_handshake(&mut self, element: Element) {
        let presented = element.text().trim().to_lowercase();
        let expected = handshake_digest(&self.stream_id, &self.deps.secret);

        let matches: bool = presented.as_bytes().ct_eq(expected.as_bytes()).into();
        if !matches {
            warn!(stream_id = %self.stream_id, "component handshake rejected");
            self.close_with_error(StreamErrorKind::NotAuthorized.into()).await;
            return;
        }

        let host = self.host.clone().expect("host set during stream open");
        if let Err(e) = self
            .deps
            .registry
            .register_external(&host, &self.stream_id, Arc::clone(&self.deps.hub))
            .await
        {
            warn!(host = %host, error = %e, "external component registration failed");
            self.close_with_error(StreamErrorKind::Conflict.into()).await;
            return;
        }

        if self.transport.write_raw("<handshake/>").await.is_err() {
            self.state = ComponentState::Disconnected;
            return;
        }
        *self.handle.host.write() = Some(host.clone());
        self.state = ComponentState::Authenticated;
        info!(stream_id = %self.stream_id, host = %host, "component authenticated");

        let payload = HookPayload::Stream {
            stream_id: self.stream_id.clone(),
            jid: Jid::domain_only(&host).ok(),
        };
        if let Err(e) = self
            .deps
            .hooks
            .dispatch(hooks::COMPONENT_STREAM_REGISTERED, &payload)
            .await
        {
            warn!(error = %e, "component hook failed");
        }
    }

    async fn handle_stanza(&mut self, element: Element) {
        let host = self.host.as_deref().expect("authenticated stream has a host");
        let stanza = match Stanza::from_element(element) {
            Ok(s) => s,
            Err(e) => {
                debug!(stream_id = %self.stream_id, error = %e, "unroutable component stanza");
                self.close_with_error(StreamErrorKind::InvalidXml.into()).await;
                return;
            }
        };

        // The component may only speak for its own domain.
        let from_ok = stanza
            .from_jid()
            .is_some_and(|from| from.domain() == host);
        if !from_ok {
            warn!(stream_id = %self.stream_id, host = %host, "component from-domain violation");
            self.close_with_error(StreamErrorKind::InvalidFrom.into()).await;
            return;
        }

        if let Err(e) = self.deps.router.route_with_bounce(stanza).await {
            debug!(stream_id = %self.stream_id, error = %e, "component stanza not routed");
        }
    }

    async fn close_with_error(&mut self, error: StreamError) {
        if self.state == ComponentState::Disconnected {
            return;
        }
        let _ = self.transport.write_element(&error.to_element()).await;
        let _ = self.transport.write_raw("</stream:stream>").await;
        self.state = ComponentState::Disconnected;
    }

    async fn cleanup(&mut self) {
        let _ = self.transport.shutdown().await;
        self.deps.hub.remove(&self.stream_id);
        if let Some(host) = self.host.take() {
            self.deps.registry.unregister_external(&host).await;
        }
        info!(stream_id = %self.stream_id, "component stream finished");
    }
}

/// `hex(sha1(stream_id || secret))`, the XEP-0114 proof.
fn handshake_digest(stream_id: &str, secret: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(stream_id.as_bytes());
    hasher.update(secret.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
