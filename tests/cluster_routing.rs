//! End-to-end routing across a two-node in-process cluster.
//!
//! Both nodes share one in-memory KV (the stand-in for the replicated
//! store) and talk to each other over real TCP cluster links; clients
//! connect over real TCP C2S sockets.

mod common;

use common::{
    COMPONENT_SECRET, ComponentClient, PASSWORD, XmppClient, c2s_addr, component_addr,
    start_node, wait_for_mesh, wait_until,
};
use rxmppd::cluster::kv::{KvStore, MemoryKv};
use rxmppd::cluster::memberlist::{ApiVersion, CLUSTER_API_VERSION, ClusterMember};
use rxmppd::cluster::router::ClusterRouter;
use rxmppd::error::{ClusterError, RouterResult};
use rxmppd::hooks::{self, HookHandler, HookOutcome, HookPayload};
use rxmppd::router::S2SOutProvider;
use rxmppd::storage::BlockListItem;
use rxmpp_proto::{Stanza, StreamEvent};
use std::sync::Arc;
use std::time::Duration;

struct OfflineSink {
    count: Arc<std::sync::atomic::AtomicUsize>,
}

#[async_trait::async_trait]
impl HookHandler for OfflineSink {
    async fn run(&self, _payload: &HookPayload) -> Result<HookOutcome, rxmppd::hooks::HookError> {
        self.count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(HookOutcome::Continue)
    }
}

/// S1: full-JID message between two streams on one node.
#[tokio::test]
async fn local_full_jid_message() {
    let kv = MemoryKv::new();
    let node = start_node(&kv, "node-a").await;
    let offline = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    node.hooks.subscribe(
        hooks::OFFLINE_MESSAGE,
        0,
        Arc::new(OfflineSink {
            count: Arc::clone(&offline),
        }),
    );

    let mut alice = XmppClient::login(c2s_addr(&node), "alice", PASSWORD, "one").await;
    let mut bob = XmppClient::login(c2s_addr(&node), "bob", PASSWORD, "phone").await;

    alice
        .send("<message to=\"bob@ex.org/phone\" type=\"chat\"><body>hi</body></message>")
        .await;

    let delivered = bob.expect_element("message").await;
    assert_eq!(delivered.child("body").unwrap().text(), "hi");
    assert_eq!(delivered.attr("from"), Some("alice@ex.org/one"));

    // Both resources are in the map, and nothing went offline.
    let resources = kv.get_prefix("res://").await.unwrap();
    assert_eq!(resources.len(), 2);
    assert_eq!(offline.load(std::sync::atomic::Ordering::SeqCst), 0);

    node.shutdown().await;
}

/// S2: full-JID routing across the cluster mesh.
#[tokio::test]
async fn cross_node_full_jid_routing() {
    rxmppd::metrics::init();
    let kv = MemoryKv::new();
    let node_a = start_node(&kv, "node-a").await;
    let node_b = start_node(&kv, "node-b").await;
    wait_for_mesh(&node_a, &node_b).await;

    let mut alice = XmppClient::login(c2s_addr(&node_a), "alice", PASSWORD, "one").await;
    let mut bob = XmppClient::login(c2s_addr(&node_b), "bob", PASSWORD, "laptop").await;

    let before = rxmppd::metrics::INCOMING_REQUESTS
        .get()
        .map(|c| c.with_label_values(&["message"]).get())
        .unwrap_or(0);

    alice
        .send("<message to=\"bob@ex.org/laptop\" type=\"chat\"><body>over the wire</body></message>")
        .await;

    let delivered = bob.expect_element("message").await;
    assert_eq!(delivered.child("body").unwrap().text(), "over the wire");
    assert_eq!(delivered.attr("from"), Some("alice@ex.org/one"));

    let after = rxmppd::metrics::INCOMING_REQUESTS
        .get()
        .map(|c| c.with_label_values(&["message"]).get())
        .unwrap_or(0);
    assert!(after > before, "ingress counter moved on the receiving side");

    node_a.shutdown().await;
    node_b.shutdown().await;
}

/// S3: terminate_old across nodes. The second login for the same resource
/// evicts the first with a conflict stream error, then takes over the
/// descriptor.
#[tokio::test]
async fn terminate_old_resource_conflict_across_nodes() {
    let kv = MemoryKv::new();
    let node_a = start_node(&kv, "node-a").await;
    let node_b = start_node(&kv, "node-b").await;
    wait_for_mesh(&node_a, &node_b).await;

    let mut first = XmppClient::login(c2s_addr(&node_a), "alice", PASSWORD, "tablet").await;

    // Second login, same resource, other node.
    let mut second = XmppClient::connect(c2s_addr(&node_b)).await;
    second.open_stream("ex.org").await;
    second.expect_element("stream:features").await;
    second.authenticate("alice", PASSWORD).await;

    let (evicted, result) =
        tokio::join!(first.expect_element("stream:error"), second.bind("tablet"));
    assert!(evicted.child("conflict").is_some());
    assert_eq!(result.attr("type"), Some("result"));

    // The descriptor now belongs to node B.
    let raw = kv.get_prefix("res://alice/tablet").await.unwrap();
    assert_eq!(raw.len(), 1);
    let descriptor: serde_json::Value = serde_json::from_slice(&raw[0].1).unwrap();
    assert_eq!(descriptor["instance_id"], "node-b");

    node_a.shutdown().await;
    node_b.shutdown().await;
}

struct CapturingS2S {
    stanzas: parking_lot::Mutex<Vec<Stanza>>,
}

#[async_trait::async_trait]
impl S2SOutProvider for CapturingS2S {
    async fn route(&self, stanza: Stanza) -> RouterResult<()> {
        self.stanzas.lock().push(stanza);
        Ok(())
    }
}

/// S4: a message from a blocked remote JID is interrupted and answered
/// with service-unavailable toward the sender; nothing reaches the user.
#[tokio::test]
async fn blocklist_intercepts_inbound_remote_message() {
    let kv = MemoryKv::new();
    let s2s = Arc::new(CapturingS2S {
        stanzas: parking_lot::Mutex::new(Vec::new()),
    });
    let config = common::node_config("node-a", "terminate_old");
    let node = rxmppd::server::start_node_with(
        &config,
        kv.clone() as Arc<dyn KvStore>,
        s2s.clone(),
    )
    .await
    .unwrap();
    common::provision_users(&node).await;

    node.blocklist
        .block(&BlockListItem {
            username: "alice".into(),
            jid: "mallory@ev.org".parse().unwrap(),
        })
        .await
        .unwrap();

    let mut alice = XmppClient::login(c2s_addr(&node), "alice", PASSWORD, "one").await;

    // The inbound S2S leg hands the parsed stanza to the router.
    let hostile = Stanza::from_element(
        rxmpp_proto::Element::builder("message")
            .attr("from", "mallory@ev.org/x")
            .attr("to", "alice@ex.org/one")
            .attr("type", "chat")
            .child(rxmpp_proto::Element::builder("body").text("let me in").build())
            .build(),
    )
    .unwrap();
    let err = node.router.route(hostile).await.unwrap_err();
    assert_eq!(err.error_code(), "intercept_interrupted");

    // The bounce went back out the federation path.
    wait_until("bounce captured", || !s2s.stanzas.lock().is_empty()).await;
    let bounce = s2s.stanzas.lock().pop().unwrap();
    assert_eq!(bounce.stanza_type(), Some("error"));
    assert_eq!(bounce.to_jid().unwrap().to_string(), "mallory@ev.org/x");
    assert!(
        bounce
            .element()
            .child("error")
            .and_then(|e| e.child("service-unavailable"))
            .is_some()
    );

    // Alice saw nothing.
    assert!(alice.silent_for(Duration::from_millis(300)).await);

    node.shutdown().await;
}

/// S5: an external component attached to node A serves traffic arriving
/// on node B through a proxy installed from the `ec://` binding.
#[tokio::test]
async fn component_dispatch_across_nodes() {
    let kv = MemoryKv::new();
    let node_a = start_node(&kv, "node-a").await;
    let node_b = start_node(&kv, "node-b").await;
    wait_for_mesh(&node_a, &node_b).await;

    let mut component =
        ComponentClient::attach(component_addr(&node_a), "upload.ex.org", COMPONENT_SECRET).await;

    // Node B discovers the binding and installs a proxy.
    wait_until("proxy installed on node b", || {
        node_b.components.is_component_host("upload.ex.org")
    })
    .await;

    let mut bob = XmppClient::login(c2s_addr(&node_b), "bob", PASSWORD, "laptop").await;
    bob.send(
        "<iq id=\"up1\" type=\"get\" to=\"upload.ex.org\">\
         <request xmlns=\"urn:xmpp:http:upload:0\"/></iq>",
    )
    .await;

    match component.next_event().await {
        StreamEvent::Element(el) => {
            assert_eq!(el.name(), "iq");
            assert_eq!(el.attr("id"), Some("up1"));
            assert_eq!(el.attr("from"), Some("bob@ex.org/laptop"));
        }
        other => panic!("expected iq at the component, got {other:?}"),
    }

    node_a.shutdown().await;
    node_b.shutdown().await;
}

/// S6: a member with a different cluster-API major version stays visible
/// in the membership view but is refused for routing.
#[tokio::test]
async fn incompatible_peer_is_known_but_unrouted() {
    let kv = MemoryKv::new();
    let node_a = start_node(&kv, "node-a").await;

    let stranger = ClusterMember {
        instance_id: "node-c".into(),
        host: "127.0.0.1".into(),
        port: 1,
        api_version: ApiVersion {
            major: CLUSTER_API_VERSION.major + 1,
            minor: 0,
        },
    };
    kv.put(
        "node://node-c",
        serde_json::to_vec(&stranger).unwrap(),
        None,
    )
    .await
    .unwrap();

    wait_until("membership lists node-c", || {
        node_a
            .memberlist()
            .is_some_and(|m| m.get("node-c").is_some())
    })
    .await;

    match node_a.conns.get_connection("node-c") {
        Err(ClusterError::IncompatibleProtocol { remote_major, .. }) => {
            assert_eq!(remote_major, CLUSTER_API_VERSION.major + 1);
        }
        other => panic!("expected incompatible-protocol, got {other:?}"),
    }

    // The cluster router reports the same.
    let router = ClusterRouter::new(Arc::clone(&node_a.conns));
    let stanza = Stanza::from_element(
        rxmpp_proto::Element::builder("message")
            .attr("from", "alice@ex.org/one")
            .attr("to", "bob@ex.org/elsewhere")
            .build(),
    )
    .unwrap();
    let err = router
        .route(stanza, "bob", "elsewhere", &"node-c".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::IncompatibleProtocol { .. }));

    // Still listed.
    assert!(node_a.memberlist().unwrap().get("node-c").is_some());

    node_a.shutdown().await;
}

/// Bare-JID delivery follows presence priority across the cluster: only
/// the highest strictly-positive priority resources receive.
#[tokio::test]
async fn bare_jid_message_follows_priority_across_nodes() {
    let kv = MemoryKv::new();
    let node_a = start_node(&kv, "node-a").await;
    let node_b = start_node(&kv, "node-b").await;
    wait_for_mesh(&node_a, &node_b).await;

    let mut alice = XmppClient::login(c2s_addr(&node_a), "alice", PASSWORD, "sender").await;
    let mut high = XmppClient::login(c2s_addr(&node_b), "bob", PASSWORD, "desk").await;
    high.send_presence(10).await;
    let mut zero = XmppClient::login(c2s_addr(&node_a), "bob", PASSWORD, "idle").await;
    zero.send_presence(0).await;

    // Wait for both snapshots to land in the map.
    let mut snapshots = 0;
    for _ in 0..500 {
        let raw = kv.get_prefix("res://bob/").await.unwrap();
        snapshots = raw
            .iter()
            .filter(|(_, v)| {
                serde_json::from_slice::<serde_json::Value>(v)
                    .map(|d| !d["presence"].is_null())
                    .unwrap_or(false)
            })
            .count();
        if snapshots == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(snapshots, 2, "presence snapshots stored");

    alice
        .send("<message to=\"bob@ex.org\" type=\"chat\"><body>pick one</body></message>")
        .await;

    let delivered = high.expect_element("message").await;
    assert_eq!(delivered.child("body").unwrap().text(), "pick one");
    assert!(zero.silent_for(Duration::from_millis(300)).await);

    node_a.shutdown().await;
    node_b.shutdown().await;
}
