//! Smoke test against the real binary over TCP: boots `rxmppd` with a
//! SQLite-backed config, then negotiates, authenticates with SCRAM and
//! binds like any client would.

mod common;

use common::{PASSWORD, XmppClient};
use rxmppd::storage::{Storage, UserRecord};
use std::net::TcpListener as StdTcpListener;
use std::process::{Child, Command};
use std::time::Duration;

struct TestServer {
    child: Child,
    _dir: tempfile::TempDir,
}

impl TestServer {
    /// Provision a user into a fresh SQLite database, write a config and
    /// spawn the binary.
    async fn spawn(port: u16) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("rxmppd.db");

        {
            let storage = Storage::sqlite(db_path.to_str().unwrap()).await?;
            storage
                .users
                .upsert_user(&UserRecord::from_password("alice", PASSWORD, b"salty", 1024))
                .await?;
        }

        let config_path = dir.path().join("config.toml");
        let config = format!(
            r#"
[server]
hosts = ["ex.org"]
instance_id = "smoke-node"
metrics_port = 0

[[listener]]
kind = "c2s"
address = "127.0.0.1:{port}"

[sasl]
mechanisms = ["scram_sha_256"]

[storage]
backend = "sqlite"
path = "{db}"
"#,
            db = db_path.display()
        );
        std::fs::write(&config_path, config)?;

        let child = Command::new(env!("CARGO_BIN_EXE_rxmppd"))
            .arg(&config_path)
            .spawn()?;
        Ok(Self { child, _dir: dir })
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Pick a free port; the tiny bind race is fine for tests.
fn free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("ephemeral port");
    listener.local_addr().expect("local addr").port()
}

async fn wait_for_listener(port: u16) {
    for _ in 0..200 {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("server did not start listening on {port}");
}

#[tokio::test]
async fn binary_serves_a_full_login_and_self_message() {
    let port = free_port();
    let _server = TestServer::spawn(port).await.expect("server spawns");
    wait_for_listener(port).await;

    let addr = format!("127.0.0.1:{port}").parse().unwrap();
    let mut alice = XmppClient::login(addr, "alice", PASSWORD, "desk").await;
    alice.send_presence(5).await;

    // Give the presence snapshot a beat, then message the bare JID: the
    // only positive-priority resource is this same stream.
    tokio::time::sleep(Duration::from_millis(100)).await;
    alice
        .send("<message to=\"alice@ex.org\" type=\"chat\"><body>loopback</body></message>")
        .await;
    let delivered = alice.expect_element("message").await;
    assert_eq!(delivered.child("body").unwrap().text(), "loopback");
}
