//! The C2S actor: negotiation, binding and the unified stream loop.

use super::{C2SDeps, C2SHandle, C2SState, StreamOp};
use crate::auth::{SaslSession, SaslStep};
use crate::config::ResourceConflict;
use crate::error::SaslError;
use crate::hooks::{self, HookOutcome, HookPayload};
use crate::network::transport::{Transport, TransportError};
use crate::state::resources::{RegisterOutcome, ResourceDescriptor};
use crate::state::smqueue::SmState;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rxmpp_proto::{
    Element, Jid, NS_BIND, NS_SASL, NS_STREAM, NS_TLS, ParseError, Stanza, StreamError,
    StreamErrorKind, StreamEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// XEP-0198 namespace.
const NS_SM: &str = "urn:xmpp:sm:3";
/// Mailbox depth per stream.
const OP_QUEUE_DEPTH: usize = 128;

/// Spawn the actor for an accepted C2S transport. The returned handle is
/// already inserted into the hub.
pub fn spawn_c2s(deps: Arc<C2SDeps>, transport: Transport) -> Arc<C2SHandle> {
    let stream_id = uuid::Uuid::new_v4().simple().to_string();
    let (op_tx, op_rx) = mpsc::channel(OP_QUEUE_DEPTH);
    let handle = Arc::new(C2SHandle::new(stream_id.clone(), op_tx));
    deps.hub.insert(Arc::clone(&handle) as Arc<dyn crate::state::hub::StreamHandle>);
    if let Some(g) = crate::metrics::CONNECTED_STREAMS.get() {
        g.inc();
    }

    let session = Session {
        stream_id,
        deps,
        transport,
        handle: Arc::clone(&handle),
        op_rx,
        state: C2SState::Connecting,
        epoch: 0,
        sasl: None,
        authenticated_user: None,
        bound_jid: None,
        sm: None,
        clean_close: false,
        host: None,
    };
    tokio::spawn(session.run());
    handle
}

struct Session {
    stream_id: String,
    deps: Arc<C2SDeps>,
    transport: Transport,
    handle: Arc<C2SHandle>,
    op_rx: mpsc::Receiver<StreamOp>,
    state: C2SState,
    /// Transition counter; bumped on every state change so late results
    /// from a previous life of the stream can be recognized and dropped.
    epoch: u64,
    sasl: Option<Box<dyn SaslSession>>,
    authenticated_user: Option<String>,
    bound_jid: Option<Jid>,
    sm: Option<SmState>,
    clean_close: bool,
    host: Option<String>,
}

impl Session {
    async fn run(mut self) {
        info!(stream_id = %self.stream_id, "c2s stream started");
        let mut last_read = Instant::now();

        while self.state != C2SState::Disconnected {
            let deadline = last_read + self.phase_timeout();
            tokio::select! {
                op = self.op_rx.recv() => {
                    match op {
                        Some(op) => self.handle_op(op).await,
                        // All handles dropped; only the hub keeps one, so
                        // this means shutdown teardown.
                        None => break,
                    }
                }
                event = self.transport.next_event() => {
                    last_read = Instant::now();
                    match event {
                        Ok(Some(event)) => self.handle_event(event).await,
                        Ok(None) => {
                            debug!(stream_id = %self.stream_id, "peer closed the connection");
                            self.state = C2SState::Disconnected;
                        }
                        Err(e) => self.handle_transport_error(e).await,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(stream_id = %self.stream_id, state = ?self.state, "read idle timeout");
                    self.close_with_error(StreamErrorKind::ConnectionTimeout.into()).await;
                }
            }
        }

        self.cleanup().await;
    }

    fn set_state(&mut self, next: C2SState) {
        debug!(stream_id = %self.stream_id, epoch = self.epoch, from = ?self.state, to = ?next, "transition");
        self.state = next;
        self.epoch += 1;
    }

    fn phase_timeout(&self) -> Duration {
        match self.state {
            C2SState::Connecting => self.deps.limits.connect_timeout(),
            C2SState::Connected | C2SState::Authenticating => self.deps.limits.auth_timeout(),
            C2SState::Authenticated | C2SState::Binding => self.deps.limits.auth_timeout(),
            C2SState::Bound => self.deps.limits.keep_alive_timeout(),
            C2SState::Disconnected => Duration::from_secs(1),
        }
    }

    // ------------------------------------------------------------------
    // Operation queue
    // ------------------------------------------------------------------

    async fn handle_op(&mut self, op: StreamOp) {
        match op {
            StreamOp::SendElement(element) => {
                self.write_tracked(element).await;
            }
            StreamOp::SendElementSync(element, ack) => {
                self.write_tracked(element).await;
                let _ = ack.send(());
            }
            StreamOp::Disconnect(error) => {
                self.close_with_error(error).await;
            }
        }
    }

    /// Write an outbound element, feeding the stanza-management counters.
    /// A peer that stops reading cannot wedge the actor: the write carries
    /// the request deadline and a lapse disconnects the stream.
    async fn write_tracked(&mut self, element: Element) {
        if matches!(element.name(), "iq" | "message" | "presence") {
            crate::metrics::record_outgoing(element.name());
            if let (Some(sm), Ok(stanza)) = (self.sm.as_mut(), Stanza::from_element(element.clone()))
            {
                sm.record_sent(stanza);
            }
        }
        let write = self.transport.write_element(&element);
        match tokio::time::timeout(self.deps.limits.request_timeout(), write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(stream_id = %self.stream_id, error = %e, "write failed");
                self.state = C2SState::Disconnected;
            }
            Err(_) => {
                warn!(stream_id = %self.stream_id, "write deadline exceeded");
                self.state = C2SState::Disconnected;
            }
        }
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    async fn handle_transport_error(&mut self, error: TransportError) {
        let kind = match error {
            TransportError::StanzaTooLarge { limit } => {
                warn!(stream_id = %self.stream_id, limit, "stanza size cap exceeded");
                StreamErrorKind::PolicyViolation
            }
            TransportError::Parse(e) => {
                warn!(stream_id = %self.stream_id, error = %e, "malformed stream");
                StreamErrorKind::InvalidXml
            }
            TransportError::Io(e) => {
                debug!(stream_id = %self.stream_id, error = %e, "transport io error");
                self.state = C2SState::Disconnected;
                return;
            }
        };
        self.close_with_error(kind.into()).await;
    }

    async fn handle_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::StreamOpen(header) => self.handle_stream_open(header).await,
            StreamEvent::StreamClose => {
                self.clean_close = true;
                let _ = self.transport.write_raw("</stream:stream>").await;
                self.set_state(C2SState::Disconnected);
            }
            StreamEvent::Element(element) => self.handle_element(element).await,
        }
    }

    async fn handle_stream_open(&mut self, header: Element) {
        if !matches!(
            self.state,
            C2SState::Connecting | C2SState::Connected | C2SState::Authenticated
        ) {
            self.close_with_error(StreamErrorKind::PolicyViolation.into()).await;
            return;
        }

        let to = header.attr("to").unwrap_or_default().to_string();
        let hosted = self.deps.hosts.iter().any(|h| *h == to);
        let ns_ok = header.namespace() == Some("jabber:client");

        // Our header goes out first either way, per the stream contract.
        let host = if hosted {
            to.clone()
        } else {
            self.deps.hosts.first().cloned().unwrap_or_default()
        };
        let open = format!(
            "<?xml version=\"1.0\"?><stream:stream xmlns=\"jabber:client\" \
             xmlns:stream=\"{NS_STREAM}\" id=\"{}\" from=\"{}\" version=\"1.0\">",
            self.stream_id, host
        );
        if self.transport.write_raw(&open).await.is_err() {
            self.state = C2SState::Disconnected;
            return;
        }

        if !ns_ok {
            self.close_with_error(StreamErrorKind::InvalidNamespace.into()).await;
            return;
        }
        if !hosted {
            self.close_with_error(StreamErrorKind::HostUnknown.into()).await;
            return;
        }
        self.host = Some(host);

        let features = self.stream_features();
        if self.transport.write_element(&features).await.is_err() {
            self.state = C2SState::Disconnected;
            return;
        }
        if self.state == C2SState::Connecting {
            self.set_state(C2SState::Connected);
        }
    }

    fn stream_features(&self) -> Element {
        let mut features = Element::builder("stream:features");
        if self.authenticated_user.is_none() {
            if !self.transport.is_secured() && self.deps.tls.is_some() {
                features = features.child(
                    Element::builder("starttls").attr("xmlns", NS_TLS).build(),
                );
            }
            let mut mechanisms = Element::builder("mechanisms").attr("xmlns", NS_SASL);
            for mechanism in self.deps.authenticator.mechanisms() {
                mechanisms =
                    mechanisms.child(Element::builder("mechanism").text(mechanism).build());
            }
            features = features.child(mechanisms.build());
        } else {
            features = features
                .child(Element::builder("bind").attr("xmlns", NS_BIND).build())
                .child(Element::builder("sm").attr("xmlns", NS_SM).build());
        }
        features.build()
    }

    async fn handle_element(&mut self, element: Element) {
        match self.state {
            C2SState::Connected => match element.name() {
                "starttls" => self.handle_starttls().await,
                "auth" => self.handle_auth_start(element).await,
                _ => {
                    self.close_with_error(StreamErrorKind::NotAuthorized.into()).await;
                }
            },
            C2SState::Authenticating => match element.name() {
                "response" => self.handle_auth_response(element).await,
                "abort" => {
                    self.sasl = None;
                    self.write_sasl_failure(&SaslError::Aborted).await;
                    self.set_state(C2SState::Connected);
                }
                _ => {
                    self.close_with_error(StreamErrorKind::NotAuthorized.into()).await;
                }
            },
            C2SState::Authenticated | C2SState::Binding => {
                if is_bind_iq(&element) {
                    self.handle_bind(element).await;
                } else {
                    self.close_with_error(StreamErrorKind::NotAuthorized.into()).await;
                }
            }
            C2SState::Bound => self.handle_bound_element(element).await,
            C2SState::Connecting | C2SState::Disconnected => {
                self.close_with_error(StreamErrorKind::UnsupportedStanzaType.into()).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // STARTTLS
    // ------------------------------------------------------------------

    async fn handle_starttls(&mut self) {
        let Some(acceptor) = self.deps.tls.clone() else {
            let failure = Element::builder("failure").attr("xmlns", NS_TLS).build();
            let _ = self.transport.write_element(&failure).await;
            self.set_state(C2SState::Disconnected);
            return;
        };
        let proceed = Element::builder("proceed").attr("xmlns", NS_TLS).build();
        if self.transport.write_element(&proceed).await.is_err() {
            self.state = C2SState::Disconnected;
            return;
        }
        match self.transport.starttls(&acceptor).await {
            Ok(()) => {
                info!(stream_id = %self.stream_id, "transport upgraded to tls");
                // Stream restarts; state stays Connected awaiting a header.
            }
            Err(e) => {
                warn!(stream_id = %self.stream_id, error = %e, "tls handshake failed");
                self.state = C2SState::Disconnected;
            }
        }
    }

    // ------------------------------------------------------------------
    // SASL
    // ------------------------------------------------------------------

    async fn handle_auth_start(&mut self, element: Element) {
        let mechanism = element.attr("mechanism").unwrap_or_default().to_string();
        let session = match self.deps.authenticator.start_session(&mechanism) {
            Ok(s) => s,
            Err(e) => {
                self.write_sasl_failure(&e).await;
                return;
            }
        };
        self.sasl = Some(session);
        self.set_state(C2SState::Authenticating);
        self.drive_sasl(&element.text()).await;
    }

    async fn handle_auth_response(&mut self, element: Element) {
        self.drive_sasl(&element.text()).await;
    }

    async fn drive_sasl(&mut self, payload_b64: &str) {
        let payload = match decode_sasl_payload(payload_b64) {
            Ok(p) => p,
            Err(e) => {
                self.sasl = None;
                self.write_sasl_failure(&e).await;
                self.set_state(C2SState::Connected);
                return;
            }
        };
        let Some(session) = self.sasl.as_mut() else {
            self.close_with_error(StreamErrorKind::NotAuthorized.into()).await;
            return;
        };

        match session.step(&payload).await {
            Ok(SaslStep::Challenge(data)) => {
                let challenge = Element::builder("challenge")
                    .attr("xmlns", NS_SASL)
                    .text(BASE64.encode(data))
                    .build();
                if self.transport.write_element(&challenge).await.is_err() {
                    self.state = C2SState::Disconnected;
                }
            }
            Ok(SaslStep::Success { username, data }) => {
                self.sasl = None;
                let mut success = Element::builder("success").attr("xmlns", NS_SASL);
                if let Some(data) = data {
                    success = success.text(BASE64.encode(data));
                }
                if self.transport.write_element(&success.build()).await.is_err() {
                    self.state = C2SState::Disconnected;
                    return;
                }
                info!(stream_id = %self.stream_id, user = %username, "sasl authentication succeeded");
                self.authenticated_user = Some(username);
                // SASL success restarts the stream.
                self.transport.reset_parser();
                self.set_state(C2SState::Authenticated);
            }
            Err(e) => {
                self.sasl = None;
                self.write_sasl_failure(&e).await;
                self.set_state(C2SState::Connected);
            }
        }
    }

    async fn write_sasl_failure(&mut self, error: &SaslError) {
        debug!(stream_id = %self.stream_id, condition = error.condition(), "sasl failure");
        let failure = Element::builder("failure")
            .attr("xmlns", NS_SASL)
            .child(Element::new(error.condition()))
            .build();
        if self.transport.write_element(&failure).await.is_err() {
            self.state = C2SState::Disconnected;
        }
    }

    // ------------------------------------------------------------------
    // Resource binding
    // ------------------------------------------------------------------

    async fn handle_bind(&mut self, element: Element) {
        let iq_id = element.attr("id").unwrap_or("bind").to_string();
        let Some(user) = self.authenticated_user.clone() else {
            self.close_with_error(StreamErrorKind::NotAuthorized.into()).await;
            return;
        };
        let host = self.host.clone().unwrap_or_default();

        let requested = element
            .child_ns("bind", NS_BIND)
            .and_then(|b| b.child("resource"))
            .map(|r| r.text().trim().to_string())
            .filter(|r| !r.is_empty());
        let resource =
            requested.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        let full_jid = match Jid::full(&user, &host, &resource) {
            Ok(jid) => jid,
            Err(e) => {
                debug!(stream_id = %self.stream_id, error = %e, "unusable bind resource");
                self.write_iq_error(&iq_id, "bad-request", "modify").await;
                return;
            }
        };
        self.set_state(C2SState::Binding);

        // Shaper admission happens at bind, when the JID is known.
        let shaper = match self.deps.shapers.admit(&full_jid) {
            Ok(shaper) => shaper,
            Err(e) => {
                warn!(stream_id = %self.stream_id, jid = %full_jid, error = %e, "session rejected by shaper");
                self.write_iq_error(&iq_id, "resource-constraint", "wait").await;
                self.set_state(C2SState::Authenticated);
                return;
            }
        };

        let descriptor =
            ResourceDescriptor::new(self.deps.instance_id.clone(), full_jid.clone());
        match self.deps.resources.register(descriptor.clone()).await {
            Ok(RegisterOutcome::Registered) => {}
            Ok(RegisterOutcome::AlreadyBound(held)) => {
                if !self.resolve_conflict(&iq_id, &descriptor, &held).await {
                    self.set_state(C2SState::Authenticated);
                    return;
                }
            }
            Err(e) => {
                warn!(stream_id = %self.stream_id, error = %e, "resource registration failed");
                self.write_iq_error(&iq_id, "internal-server-error", "cancel").await;
                self.set_state(C2SState::Authenticated);
                return;
            }
        }

        self.transport.set_shaper(shaper);
        self.bound_jid = Some(full_jid.clone());
        self.handle.set_jid(full_jid.clone());
        self.deps.hub.bind(&self.stream_id, &full_jid);
        self.set_state(C2SState::Bound);

        let result = Element::builder("iq")
            .attr("id", &iq_id)
            .attr("type", "result")
            .child(
                Element::builder("bind")
                    .attr("xmlns", NS_BIND)
                    .child(Element::builder("jid").text(full_jid.to_string()).build())
                    .build(),
            )
            .build();
        if self.transport.write_element(&result).await.is_err() {
            self.state = C2SState::Disconnected;
            return;
        }
        info!(stream_id = %self.stream_id, jid = %full_jid, "resource bound");

        let payload = HookPayload::Stream {
            stream_id: self.stream_id.clone(),
            jid: Some(full_jid),
        };
        if let Err(e) = self.deps.hooks.dispatch(hooks::C2S_STREAM_BOUND, &payload).await {
            warn!(error = %e, "bound hook failed");
        }
    }

    /// Apply the listener's resource-conflict policy against the current
    /// holder. Returns true when the bind may proceed.
    async fn resolve_conflict(
        &mut self,
        iq_id: &str,
        descriptor: &ResourceDescriptor,
        held: &ResourceDescriptor,
    ) -> bool {
        let conflict = StreamError::new(StreamErrorKind::Conflict)
            .with_text("replaced by new connection");
        match self.deps.conflict_policy {
            ResourceConflict::Disallow => {
                debug!(jid = %descriptor.jid, "bind refused, resource in use");
                self.write_iq_error(iq_id, "conflict", "cancel").await;
                false
            }
            ResourceConflict::Override => {
                self.disconnect_holder(held, conflict).await;
                match self.deps.resources.put_descriptor(descriptor.clone()).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(error = %e, "override registration failed");
                        self.write_iq_error(iq_id, "internal-server-error", "cancel").await;
                        false
                    }
                }
            }
            ResourceConflict::TerminateOld => {
                self.disconnect_holder(held, conflict).await;
                // Wait, bounded, for the old binding's unregister to
                // propagate through the cluster map.
                let bind_epoch = self.epoch;
                let deadline = Instant::now() + self.deps.limits.request_timeout();
                loop {
                    match self
                        .deps
                        .resources
                        .get_resource(descriptor.username(), descriptor.resource())
                        .await
                    {
                        Ok(None) => break,
                        Ok(Some(d)) if d.instance_id == self.deps.instance_id => break,
                        Ok(Some(_)) => {}
                        Err(e) => {
                            debug!(error = %e, "conflict wait read failed");
                        }
                    }
                    if Instant::now() >= deadline {
                        warn!(jid = %descriptor.jid, "old binding did not clear in time, overriding");
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                if self.epoch != bind_epoch {
                    // The stream moved on (disconnect raced the wait).
                    return false;
                }
                match self.deps.resources.put_descriptor(descriptor.clone()).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(error = %e, "terminate_old registration failed");
                        self.write_iq_error(iq_id, "internal-server-error", "cancel").await;
                        false
                    }
                }
            }
        }
    }

    async fn disconnect_holder(&self, held: &ResourceDescriptor, error: StreamError) {
        if held.instance_id == self.deps.instance_id {
            if let Err(e) = self
                .deps
                .router
                .local()
                .disconnect_bound(held.username(), held.resource(), error)
                .await
            {
                debug!(jid = %held.jid, error = %e, "local conflict disconnect failed");
            }
        } else if let Some(cluster) = &self.deps.cluster {
            if let Err(e) = cluster
                .disconnect(held.username(), held.resource(), error, &held.instance_id)
                .await
            {
                warn!(jid = %held.jid, error = %e, "remote conflict disconnect failed");
            }
        }
    }

    async fn write_iq_error(&mut self, iq_id: &str, condition: &str, error_type: &str) {
        let error = Element::builder("iq")
            .attr("id", iq_id)
            .attr("type", "error")
            .child(
                Element::builder("error")
                    .attr("type", error_type)
                    .child(
                        Element::builder(condition)
                            .attr("xmlns", rxmpp_proto::NS_STANZA_ERRORS)
                            .build(),
                    )
                    .build(),
            )
            .build();
        if self.transport.write_element(&error).await.is_err() {
            self.state = C2SState::Disconnected;
        }
    }

    // ------------------------------------------------------------------
    // Bound traffic
    // ------------------------------------------------------------------

    async fn handle_bound_element(&mut self, element: Element) {
        match element.name() {
            "iq" | "message" | "presence" => self.handle_stanza(element).await,
            "enable" if element.namespace() == Some(NS_SM) => {
                let mut nonce = vec![0u8; 16];
                rand::rngs::OsRng.fill_bytes(&mut nonce);
                self.sm = Some(SmState::new(nonce));
                let enabled = Element::builder("enabled")
                    .attr("xmlns", NS_SM)
                    .attr("id", &self.stream_id)
                    .attr("resume", "true")
                    .build();
                let _ = self.transport.write_element(&enabled).await;
            }
            "r" if element.namespace() == Some(NS_SM) => {
                let h = self.sm.as_ref().map(|sm| sm.in_h).unwrap_or(0);
                let ack = Element::builder("a")
                    .attr("xmlns", NS_SM)
                    .attr("h", h.to_string())
                    .build();
                let _ = self.transport.write_element(&ack).await;
            }
            "a" if element.namespace() == Some(NS_SM) => {
                if let (Some(sm), Some(h)) = (
                    self.sm.as_mut(),
                    element.attr("h").and_then(|h| h.parse::<u64>().ok()),
                ) {
                    sm.ack(h);
                }
            }
            other => {
                debug!(stream_id = %self.stream_id, element = %other, "unsupported first-level element");
                self.close_with_error(StreamErrorKind::UnsupportedStanzaType.into()).await;
            }
        }
    }

    async fn handle_stanza(&mut self, element: Element) {
        let bound = self.bound_jid.clone().expect("bound state has a jid");

        let stanza = match Stanza::from_element(element) {
            Ok(s) => s,
            Err(ParseError::BadAddress { attr: "from", .. }) => {
                self.close_with_error(StreamErrorKind::InvalidFrom.into()).await;
                return;
            }
            Err(e) => {
                debug!(stream_id = %self.stream_id, error = %e, "unroutable stanza");
                self.close_with_error(StreamErrorKind::InvalidXml.into()).await;
                return;
            }
        };

        // The sender must be the stream owner; anything else is spoofing.
        if let Some(from) = stanza.from_jid() {
            if !from.matches_full(&bound) && !(from.is_bare() && from.matches_bare(&bound)) {
                warn!(stream_id = %self.stream_id, claimed = %from, bound = %bound, "from address spoofing");
                self.close_with_error(StreamErrorKind::InvalidFrom.into()).await;
                return;
            }
        }
        let stanza = stanza.with_from(&bound);

        if let Some(sm) = self.sm.as_mut() {
            sm.record_received();
        }

        let payload = HookPayload::Stanza(stanza.clone());
        match self
            .deps
            .hooks
            .dispatch(hooks::C2S_ELEMENT_RECEIVED, &payload)
            .await
        {
            Ok(HookOutcome::Halt) => return,
            Ok(HookOutcome::Continue) => {}
            Err(e) => {
                warn!(stream_id = %self.stream_id, error = %e, "element hook failed");
            }
        }

        // Broadcast presence updates the resource snapshot instead of
        // being routed; presence routing to explicit targets falls
        // through to the router.
        if stanza.is_presence() && stanza.to_jid().is_none() {
            self.record_presence(&stanza, &bound).await;
            return;
        }

        if let Err(e) = self.deps.router.route_with_bounce(stanza).await {
            debug!(stream_id = %self.stream_id, error = %e, "stanza not routed");
        }
    }

    async fn record_presence(&mut self, stanza: &Stanza, bound: &Jid) {
        if !stanza.is_available_presence() && !stanza.is_unavailable_presence() {
            return;
        }
        let username = bound.node().unwrap_or_default();
        let resource = bound.resource().unwrap_or_default();
        if let Err(e) = self
            .deps
            .resources
            .update_presence(username, resource, stanza.clone())
            .await
        {
            warn!(stream_id = %self.stream_id, error = %e, "presence snapshot update failed");
        }
        let payload = HookPayload::Stanza(stanza.clone());
        if let Err(e) = self
            .deps
            .hooks
            .dispatch(hooks::PRESENCE_RECEIVED, &payload)
            .await
        {
            warn!(error = %e, "presence hook failed");
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Write a stream error and close. Safe to call more than once.
    async fn close_with_error(&mut self, error: StreamError) {
        if self.state == C2SState::Disconnected {
            return;
        }
        debug!(stream_id = %self.stream_id, kind = %error.kind, "closing stream");
        self.drain_pending().await;
        let _ = self.transport.write_element(&error.to_element()).await;
        let _ = self.transport.write_raw("</stream:stream>").await;
        self.set_state(C2SState::Disconnected);
    }

    /// Flush already-queued outbound elements within the drain budget.
    async fn drain_pending(&mut self) {
        let deadline = Instant::now() + self.deps.limits.disconnect_timeout();
        while Instant::now() < deadline {
            match self.op_rx.try_recv() {
                Ok(StreamOp::SendElement(el)) => self.write_tracked(el).await,
                Ok(StreamOp::SendElementSync(el, ack)) => {
                    self.write_tracked(el).await;
                    let _ = ack.send(());
                }
                Ok(StreamOp::Disconnect(_)) | Err(_) => break,
            }
        }
    }

    async fn cleanup(&mut self) {
        let _ = self.transport.shutdown().await;
        self.deps.hub.remove(&self.stream_id);
        if let Some(g) = crate::metrics::CONNECTED_STREAMS.get() {
            g.dec();
        }

        if let Some(jid) = self.bound_jid.take() {
            let username = jid.node().unwrap_or_default();
            let resource = jid.resource().unwrap_or_default();
            if let Err(e) = self.deps.resources.unregister(username, resource).await {
                warn!(jid = %jid, error = %e, "resource unregister failed");
            }

            // Park unacked stanza-management state for a resuming session.
            if let Some(sm) = self.sm.take() {
                if !self.clean_close && sm.pending() > 0 {
                    debug!(stream_id = %self.stream_id, pending = sm.pending(), "parking sm queue");
                    self.deps
                        .sm_queues
                        .park(&self.stream_id, sm.into_transferred());
                }
            }

            let payload = HookPayload::Stream {
                stream_id: self.stream_id.clone(),
                jid: Some(jid),
            };
            if let Err(e) = self
                .deps
                .hooks
                .dispatch(hooks::C2S_STREAM_UNREGISTERED, &payload)
                .await
            {
                warn!(error = %e, "unregistered hook failed");
            }
        }
        info!(stream_id = %self.stream_id, "c2s stream finished");
    }
}

fn is_bind_iq(element: &Element) -> bool {
    element.name() == "iq"
        && element.attr("type") == Some("set")
        && element.child_ns("bind", NS_BIND).is_some()
}

/// SASL payloads are base64; a single `=` denotes an empty payload.
fn decode_sasl_payload(text: &str) -> Result<Vec<u8>, SaslError> {
    let trimmed = text.trim();
    if trimmed == "=" || trimmed.is_empty() {
        return Ok(Vec::new());
    }
    BASE64
        .decode(trimmed)
        .map_err(|_| SaslError::MalformedRequest)
}
