//! Integration test common infrastructure.
//!
//! Boots in-process nodes over a shared in-memory KV (standing in for the
//! replicated store) and drives them through real TCP connections.

// Each test binary uses its own slice of this harness.
#![allow(dead_code)]

pub mod client;
pub mod scram;

#[allow(unused_imports)]
pub use client::{ComponentClient, XmppClient};

use rxmppd::cluster::kv::{KvStore, MemoryKv};
use rxmppd::config::Config;
use rxmppd::server::{self, Node};
use rxmppd::storage::{UserRecord, UserRepository};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Shared component secret across the test cluster.
pub const COMPONENT_SECRET: &str = "hunter2";
/// Password every provisioned test user gets.
pub const PASSWORD: &str = "correct horse";

/// A clustered node config: one C2S listener, one component listener,
/// ephemeral ports everywhere.
pub fn node_config(instance_id: &str, conflict: &str) -> Config {
    Config::from_toml(&format!(
        r#"
        [server]
        hosts = ["ex.org"]
        instance_id = "{instance_id}"

        [[listener]]
        kind = "c2s"
        address = "127.0.0.1:0"
        resource_conflict = "{conflict}"

        [[listener]]
        kind = "component"
        address = "127.0.0.1:0"
        secret = "{COMPONENT_SECRET}"

        [cluster]
        host = "127.0.0.1"
        port = 0
        resource_ttl_secs = 30

        [sasl]
        mechanisms = ["scram_sha_256"]
        "#
    ))
    .expect("valid test config")
}

/// Start a node on the shared KV and provision the standard users.
#[allow(dead_code)]
pub async fn start_node(kv: &Arc<MemoryKv>, instance_id: &str) -> Node {
    start_node_with_conflict(kv, instance_id, "terminate_old").await
}

#[allow(dead_code)]
pub async fn start_node_with_conflict(
    kv: &Arc<MemoryKv>,
    instance_id: &str,
    conflict: &str,
) -> Node {
    let config = node_config(instance_id, conflict);
    let node = server::start_node(&config, kv.clone() as Arc<dyn KvStore>)
        .await
        .expect("node starts");
    provision_users(&node).await;
    node
}

/// Provision the standard test accounts.
pub async fn provision_users(node: &Node) {
    for user in ["alice", "bob"] {
        node.storage
            .users
            .upsert_user(&UserRecord::from_password(user, PASSWORD, b"salty", 1024))
            .await
            .expect("user provisioned");
    }
}

/// The node's C2S listener address (first listener by convention).
pub fn c2s_addr(node: &Node) -> SocketAddr {
    node.listener_addrs()[0]
}

/// The node's component listener address (second listener).
#[allow(dead_code)]
pub fn component_addr(node: &Node) -> SocketAddr {
    node.listener_addrs()[1]
}

/// Poll `cond` until true or a 5 s budget lapses.
pub async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Wait until two clustered nodes hold usable links to each other.
#[allow(dead_code)]
pub async fn wait_for_mesh(a: &Node, b: &Node) {
    wait_until("a links b", || {
        a.conns.connected_ids().contains(&b.instance_id)
    })
    .await;
    wait_until("b links a", || {
        b.conns.connected_ids().contains(&a.instance_id)
    })
    .await;
}
