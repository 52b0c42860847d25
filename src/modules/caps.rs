//! Entity capabilities (XEP-0115).
//!
//! Watches routed presence for `<c/>` annotations. An unseen `(node, ver)`
//! pair triggers a disco#info query to the advertising entity; the answer
//! is captured off the inbound chain and persisted content-addressed, so
//! the whole cluster learns a client build's feature set exactly once.

use crate::hooks::{self, HookError, HookHandler, HookOutcome, HookPayload, Hooks};
use crate::interceptor::{
    Intercept, InterceptError, InterceptorPipeline, InterceptorRecord, StanzaInterceptor,
};
use crate::router::Router;
use crate::storage::{CapabilitiesRecord, CapabilitiesRepository};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use rxmpp_proto::{Element, Jid, Stanza};
use sha1::{Digest, Sha1};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, warn};

/// XEP-0115 annotation namespace.
pub const NS_CAPS: &str = "http://jabber.org/protocol/caps";
/// Service discovery namespace.
pub const NS_DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";

const ID_DISCO: &str = "caps:disco-result";
/// Runs late: capability harvesting never preempts policy interceptors.
const PRIORITY: i32 = -100;

/// A disco identity, part of the verification-string input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub category: String,
    pub kind: String,
    pub lang: String,
    pub name: String,
}

/// One extended-info form: the FORM_TYPE value plus its fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataForm {
    pub form_type: String,
    pub fields: Vec<(String, Vec<String>)>,
}

/// Compute the XEP-0115 verification string over disco#info contents.
///
/// Sorting is part of the algorithm, so the result is independent of the
/// order identities, features, forms and field values arrive in.
pub fn verification_string(
    identities: &[Identity],
    features: &[String],
    forms: &[DataForm],
) -> String {
    let mut s = String::new();

    let mut identities: Vec<&Identity> = identities.iter().collect();
    identities.sort_by(|a, b| {
        (&a.category, &a.kind, &a.lang).cmp(&(&b.category, &b.kind, &b.lang))
    });
    for identity in identities {
        s.push_str(&format!(
            "{}/{}/{}/{}<",
            identity.category, identity.kind, identity.lang, identity.name
        ));
    }

    let mut features: Vec<&String> = features.iter().collect();
    features.sort();
    for feature in features {
        s.push_str(feature);
        s.push('<');
    }

    let mut forms: Vec<&DataForm> = forms.iter().collect();
    forms.sort_by(|a, b| a.form_type.cmp(&b.form_type));
    for form in forms {
        s.push_str(&form.form_type);
        s.push('<');
        let mut fields: Vec<&(String, Vec<String>)> = form.fields.iter().collect();
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        for (var, values) in fields {
            s.push_str(var);
            s.push('<');
            let mut values: Vec<&String> = values.iter().collect();
            values.sort();
            for value in values {
                s.push_str(value);
                s.push('<');
            }
        }
    }

    BASE64.encode(Sha1::digest(s.as_bytes()))
}

/// The capabilities module.
pub struct CapsModule {
    repository: Arc<dyn CapabilitiesRepository>,
    router: OnceLock<Weak<Router>>,
    /// In-flight disco queries: iq id to the (node, ver) being resolved.
    pending: DashMap<String, (String, String)>,
}

impl CapsModule {
    pub fn new(repository: Arc<dyn CapabilitiesRepository>) -> Arc<Self> {
        Arc::new(Self {
            repository,
            router: OnceLock::new(),
            pending: DashMap::new(),
        })
    }

    /// Wire the module onto the presence hook and the inbound chain.
    pub fn register(
        self: &Arc<Self>,
        router: &Arc<Router>,
        pipeline: &InterceptorPipeline,
        hooks: &Hooks,
    ) {
        let _ = self.router.set(Arc::downgrade(router));
        hooks.subscribe(
            hooks::PRESENCE_RECEIVED,
            0,
            Arc::clone(self) as Arc<dyn HookHandler>,
        );
        pipeline.register(InterceptorRecord {
            id: ID_DISCO.to_string(),
            priority: PRIORITY,
            incoming: true,
            handler: Arc::clone(self) as Arc<dyn StanzaInterceptor>,
        });
    }

    async fn harvest_presence(&self, stanza: &Stanza) -> Result<(), HookError> {
        let Some(c) = stanza.element().child_ns("c", NS_CAPS) else {
            return Ok(());
        };
        let (Some(node), Some(ver)) = (c.attr("node"), c.attr("ver")) else {
            return Ok(());
        };
        if self.repository.capabilities_exist(node, ver).await? {
            return Ok(());
        }
        let Some(sender) = stanza.from_jid() else {
            return Ok(());
        };
        self.query_disco(sender, node, ver).await;
        Ok(())
    }

    async fn query_disco(&self, target: &Jid, node: &str, ver: &str) {
        let Some(router) = self.router.get().and_then(Weak::upgrade) else {
            warn!("caps module used before wiring");
            return;
        };
        let iq_id = format!("caps-{}", uuid::Uuid::new_v4().simple());
        self.pending
            .insert(iq_id.clone(), (node.to_string(), ver.to_string()));

        let query = Element::builder("iq")
            .attr("id", &iq_id)
            .attr("type", "get")
            .attr("from", target.domain())
            .attr("to", target.to_string())
            .child(
                Element::builder("query")
                    .attr("xmlns", NS_DISCO_INFO)
                    .attr("node", format!("{node}#{ver}"))
                    .build(),
            )
            .build();
        let stanza = Stanza::from_element(query).expect("iq is a stanza");
        debug!(target = %target, node = %node, ver = %ver, "querying capabilities");
        if let Err(e) = router.route(stanza).await {
            debug!(error = %e, "caps disco query not routed");
            self.pending.remove(&iq_id);
        }
    }

    async fn absorb_disco_result(&self, stanza: &Stanza) -> Result<bool, InterceptError> {
        if !(stanza.is_iq() && stanza.stanza_type() == Some("result")) {
            return Ok(false);
        }
        let Some(id) = stanza.id() else {
            return Ok(false);
        };
        let Some((_, (node, ver))) = self.pending.remove(id) else {
            return Ok(false);
        };
        let Some(query) = stanza.element().child_ns("query", NS_DISCO_INFO) else {
            return Ok(true);
        };

        let features: Vec<String> = query
            .children()
            .filter(|e| e.name() == "feature")
            .filter_map(|e| e.attr("var").map(str::to_owned))
            .collect();
        let record = CapabilitiesRecord {
            node,
            ver,
            features,
        };
        debug!(node = %record.node, ver = %record.ver, count = record.features.len(), "capabilities stored");
        self.repository.upsert_capabilities(&record).await?;
        Ok(true)
    }
}

#[async_trait::async_trait]
impl HookHandler for CapsModule {
    async fn run(&self, payload: &HookPayload) -> Result<HookOutcome, HookError> {
        if let HookPayload::Stanza(stanza) = payload {
            if stanza.is_presence() {
                self.harvest_presence(stanza).await?;
            }
        }
        Ok(HookOutcome::Continue)
    }
}

#[async_trait::async_trait]
impl StanzaInterceptor for CapsModule {
    async fn intercept(&self, stanza: Stanza, _id: &str) -> Result<Intercept, InterceptError> {
        if self.absorb_disco_result(&stanza).await? {
            return Ok(Intercept::Interrupt);
        }
        Ok(Intercept::Continue(stanza))
    }
}
