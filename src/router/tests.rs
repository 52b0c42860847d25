use super::*;
use crate::cluster::connmgr::ConnManager;
use crate::cluster::kv::{KvStore, MemoryKv};
use crate::cluster::memberlist::CLUSTER_API_VERSION;
use crate::components::LocalComponent;
use crate::hooks::Hooks;
use crate::interceptor::{Intercept, InterceptError, InterceptorRecord, StanzaInterceptor};
use crate::state::hub::{StreamHandle, StreamHub};
use crate::state::resources::{ResourceDescriptor, ResourceManager};
use crate::storage::UserRecord;
use parking_lot::Mutex;
use rxmpp_proto::{Element, Jid, StreamError};
use std::time::Duration;

struct FakeStream {
    id: String,
    jid: Jid,
    sent: Mutex<Vec<Element>>,
}

#[async_trait::async_trait]
impl StreamHandle for FakeStream {
    fn stream_id(&self) -> &str {
        &self.id
    }
    fn jid(&self) -> Option<Jid> {
        Some(self.jid.clone())
    }
    fn send_element(&self, element: Element) -> bool {
        self.sent.lock().push(element);
        true
    }
    async fn disconnect(&self, _error: StreamError) {}
}

struct CapturingS2S {
    stanzas: Mutex<Vec<Stanza>>,
}

#[async_trait::async_trait]
impl S2SOutProvider for CapturingS2S {
    async fn route(&self, stanza: Stanza) -> RouterResult<()> {
        self.stanzas.lock().push(stanza);
        Ok(())
    }
}

struct SinkComponent {
    seen: Mutex<Vec<Stanza>>,
}

#[async_trait::async_trait]
impl LocalComponent for SinkComponent {
    fn name(&self) -> &str {
        "sink"
    }
    async fn process(&self, stanza: Stanza) -> RouterResult<()> {
        self.seen.lock().push(stanza);
        Ok(())
    }
}

struct Rig {
    router: Arc<Router>,
    hub: Arc<StreamHub>,
    resources: Arc<ResourceManager>,
    s2s: Arc<CapturingS2S>,
    component: Arc<SinkComponent>,
    interceptors: Arc<InterceptorPipeline>,
    storage: Storage,
}

async fn rig() -> Rig {
    let kv = MemoryKv::new();
    let hub = StreamHub::new();
    let resources = ResourceManager::start(
        kv.clone() as Arc<dyn KvStore>,
        "node-a".to_string(),
        Duration::from_secs(30),
        Arc::clone(&hub),
    )
    .await
    .unwrap();
    let hooks = Arc::new(Hooks::new());
    let interceptors = Arc::new(InterceptorPipeline::new());
    let storage = Storage::memory();
    storage
        .users
        .upsert_user(&UserRecord::from_password("alice", "pw", b"s", 256))
        .await
        .unwrap();
    storage
        .users
        .upsert_user(&UserRecord::from_password("bob", "pw", b"s", 256))
        .await
        .unwrap();

    let conns = ConnManager::new(
        "node-a".to_string(),
        CLUSTER_API_VERSION,
        Duration::from_secs(1),
        Duration::from_secs(1),
    );
    let components = ComponentRegistry::start(
        kv.clone() as Arc<dyn KvStore>,
        conns,
        "node-a".to_string(),
        Duration::from_secs(30),
    )
    .await
    .unwrap();
    let component = Arc::new(SinkComponent {
        seen: Mutex::new(Vec::new()),
    });
    components
        .register_local("upload.ex.org", component.clone())
        .await
        .unwrap();

    let local = Arc::new(LocalRouter::new(
        "node-a".to_string(),
        Arc::clone(&hub),
        Arc::clone(&resources),
        None,
        Arc::clone(&interceptors),
        Arc::clone(&hooks),
    ));
    let s2s = Arc::new(CapturingS2S {
        stanzas: Mutex::new(Vec::new()),
    });
    let router = Router::new(
        vec!["ex.org".to_string()],
        Arc::clone(&interceptors),
        components,
        local,
        s2s.clone(),
        storage.clone(),
    );
    Rig {
        router,
        hub,
        resources,
        s2s,
        component,
        interceptors,
        storage,
    }
}

async fn bind(rig: &Rig, stream_id: &str, jid: &str) -> Arc<FakeStream> {
    let jid: Jid = jid.parse().unwrap();
    let stream = Arc::new(FakeStream {
        id: stream_id.to_string(),
        jid: jid.clone(),
        sent: Mutex::new(Vec::new()),
    });
    rig.hub.insert(stream.clone());
    rig.hub.bind(stream_id, &jid);
    let mut descriptor = ResourceDescriptor::new("node-a".to_string(), jid);
    descriptor.presence = Some(
        Stanza::from_element(
            Element::builder("presence")
                .child(Element::builder("priority").text("1").build())
                .build(),
        )
        .unwrap(),
    );
    rig.resources.put_descriptor(descriptor).await.unwrap();
    stream
}

fn chat(from: &str, to: &str) -> Stanza {
    Stanza::from_element(
        Element::builder("message")
            .attr("from", from)
            .attr("to", to)
            .attr("type", "chat")
            .child(Element::builder("body").text("hi").build())
            .build(),
    )
    .unwrap()
}

#[tokio::test]
async fn local_full_jid_message_reaches_the_stream() {
    let rig = rig().await;
    let bob = bind(&rig, "s1", "bob@ex.org/phone").await;

    rig.router
        .route(chat("alice@ex.org/one", "bob@ex.org/phone"))
        .await
        .unwrap();
    let sent = bob.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].child("body").unwrap().text(), "hi");
}

#[tokio::test]
async fn component_host_takes_precedence() {
    let rig = rig().await;
    let iq = Stanza::from_element(
        Element::builder("iq")
            .attr("from", "alice@ex.org/one")
            .attr("to", "upload.ex.org")
            .attr("type", "get")
            .build(),
    )
    .unwrap();
    rig.router.route(iq).await.unwrap();
    assert_eq!(rig.component.seen.lock().len(), 1);
    assert!(rig.s2s.stanzas.lock().is_empty());
}

#[tokio::test]
async fn remote_domain_goes_to_s2s() {
    let rig = rig().await;
    rig.router
        .route(chat("alice@ex.org/one", "carol@elsewhere.net"))
        .await
        .unwrap();
    assert_eq!(rig.s2s.stanzas.lock().len(), 1);
}

#[tokio::test]
async fn missing_to_defaults_to_sender_bare_jid() {
    let rig = rig().await;
    let alice = bind(&rig, "s1", "alice@ex.org/desk").await;

    let stanza = Stanza::from_element(
        Element::builder("message")
            .attr("from", "alice@ex.org/desk")
            .attr("type", "chat")
            .child(Element::builder("body").text("note to self").build())
            .build(),
    )
    .unwrap();
    rig.router.route(stanza).await.unwrap();
    // Normalized to alice's bare JID and delivered to her resource.
    let sent = alice.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].attr("to"), Some("alice@ex.org"));
}

#[tokio::test]
async fn unknown_local_account_is_refused() {
    let rig = rig().await;
    let err = rig
        .router
        .route(chat("alice@ex.org/one", "ghost@ex.org"))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::NotExistingAccount(_)));
}

#[tokio::test]
async fn deleted_account_stops_routing() {
    let rig = rig().await;
    bind(&rig, "s1", "bob@ex.org/phone").await;
    rig.storage.users.delete_user("bob").await.unwrap();
    let err = rig
        .router
        .route(chat("alice@ex.org/one", "bob@ex.org/phone"))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::NotExistingAccount(_)));
}

#[tokio::test]
async fn bounce_returns_an_error_stanza_to_the_sender() {
    let rig = rig().await;
    let alice = bind(&rig, "s1", "alice@ex.org/one").await;

    // iq get to a bare JID bounces service-unavailable.
    let iq = Stanza::from_element(
        Element::builder("iq")
            .attr("from", "alice@ex.org/one")
            .attr("to", "bob@ex.org")
            .attr("type", "get")
            .attr("id", "q1")
            .build(),
    )
    .unwrap();
    let err = rig.router.route_with_bounce(iq).await.unwrap_err();
    assert!(matches!(err, RouterError::UserNotAvailable(_)));

    let sent = alice.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].name(), "iq");
    assert_eq!(sent[0].attr("type"), Some("error"));
    assert!(
        sent[0]
            .child("error")
            .unwrap()
            .child("service-unavailable")
            .is_some()
    );
}

struct Halting;

#[async_trait::async_trait]
impl StanzaInterceptor for Halting {
    async fn intercept(&self, _s: Stanza, _id: &str) -> Result<Intercept, InterceptError> {
        Ok(Intercept::Interrupt)
    }
}

#[tokio::test]
async fn interceptor_interrupt_stops_routing_without_bounce() {
    let rig = rig().await;
    let bob = bind(&rig, "s1", "bob@ex.org/phone").await;
    rig.interceptors.register(InterceptorRecord {
        id: "drop-all".into(),
        priority: 1000,
        incoming: true,
        handler: Arc::new(Halting),
    });

    let err = rig
        .router
        .route_with_bounce(chat("alice@ex.org/one", "bob@ex.org/phone"))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::InterceptInterrupted));
    assert!(bob.sent.lock().is_empty());
}
