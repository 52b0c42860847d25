//! TCP test clients: a C2S client speaking real SCRAM, and a XEP-0114
//! component client.

use super::scram::ScramClient;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rxmpp_proto::{Element, StreamEvent, StreamParser};
use sha1::{Digest, Sha1};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
const NS_COMPONENT: &str = "jabber:component:accept";

pub struct XmppClient {
    stream: TcpStream,
    parser: StreamParser,
}

impl XmppClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("server reachable");
        Self {
            stream,
            parser: StreamParser::new(),
        }
    }

    pub async fn send(&mut self, xml: &str) {
        self.stream
            .write_all(xml.as_bytes())
            .await
            .expect("writable stream");
    }

    pub async fn next_event(&mut self) -> StreamEvent {
        loop {
            if let Some(event) = self.parser.next_event().expect("well-formed server output") {
                return event;
            }
            let mut buf = [0u8; 8192];
            let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                .await
                .expect("server reply in time")
                .expect("readable stream");
            assert!(n > 0, "server closed unexpectedly");
            self.parser.feed(&buf[..n]);
        }
    }

    pub async fn expect_element(&mut self, name: &str) -> Element {
        match self.next_event().await {
            StreamEvent::Element(el) => {
                assert_eq!(el.name(), name, "got <{}/> instead", el.name());
                el
            }
            other => panic!("expected <{name}/>, got {other:?}"),
        }
    }

    /// True when no element arrives within `window`.
    pub async fn silent_for(&mut self, window: Duration) -> bool {
        if self.parser.next_event().expect("well-formed").is_some() {
            return false;
        }
        let mut buf = [0u8; 8192];
        match tokio::time::timeout(window, self.stream.read(&mut buf)).await {
            Err(_) => true,
            Ok(Ok(0)) => true,
            Ok(Ok(n)) => {
                self.parser.feed(&buf[..n]);
                self.parser.next_event().expect("well-formed").is_none()
            }
            Ok(Err(_)) => true,
        }
    }

    pub async fn open_stream(&mut self, host: &str) {
        self.send(&format!(
            "<stream:stream xmlns=\"jabber:client\" \
             xmlns:stream=\"http://etherx.jabber.org/streams\" \
             to=\"{host}\" version=\"1.0\">"
        ))
        .await;
        match self.next_event().await {
            StreamEvent::StreamOpen(_) => {}
            other => panic!("expected server header, got {other:?}"),
        }
    }

    pub async fn authenticate(&mut self, username: &str, password: &str) {
        let scram = ScramClient::new(username, password);
        let first = BASE64.encode(scram.first());
        self.send(&format!(
            "<auth xmlns=\"{NS_SASL}\" mechanism=\"SCRAM-SHA-256\">{first}</auth>"
        ))
        .await;

        let challenge = self.expect_element("challenge").await;
        let server_first = String::from_utf8(
            BASE64
                .decode(challenge.text().trim())
                .expect("base64 challenge"),
        )
        .expect("utf8 challenge");

        let final_message = BASE64.encode(scram.final_message(&server_first));
        self.send(&format!(
            "<response xmlns=\"{NS_SASL}\">{final_message}</response>"
        ))
        .await;
        self.expect_element("success").await;

        // SASL success restarts the stream.
        self.parser.reset();
        self.open_stream("ex.org").await;
        self.expect_element("stream:features").await;
    }

    pub async fn bind(&mut self, resource: &str) -> Element {
        self.send(&format!(
            "<iq id=\"bind-1\" type=\"set\"><bind xmlns=\"{NS_BIND}\">\
             <resource>{resource}</resource></bind></iq>"
        ))
        .await;
        self.expect_element("iq").await
    }

    /// Connect, negotiate, authenticate and bind in one go.
    pub async fn login(addr: SocketAddr, username: &str, password: &str, resource: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client.open_stream("ex.org").await;
        client.expect_element("stream:features").await;
        client.authenticate(username, password).await;
        let result = client.bind(resource).await;
        assert_eq!(result.attr("type"), Some("result"), "bind failed: {result}");
        client
    }

    /// Publish available presence with a priority.
    pub async fn send_presence(&mut self, priority: i8) {
        self.send(&format!(
            "<presence><priority>{priority}</priority></presence>"
        ))
        .await;
    }
}

/// A XEP-0114 external component client.
pub struct ComponentClient {
    stream: TcpStream,
    parser: StreamParser,
}

impl ComponentClient {
    /// Connect and complete the handshake for `host`.
    pub async fn attach(addr: SocketAddr, host: &str, secret: &str) -> Self {
        let stream = TcpStream::connect(addr).await.expect("server reachable");
        let mut client = Self {
            stream,
            parser: StreamParser::new(),
        };

        client
            .send(&format!(
                "<stream:stream xmlns=\"{NS_COMPONENT}\" \
                 xmlns:stream=\"http://etherx.jabber.org/streams\" to=\"{host}\">"
            ))
            .await;
        let stream_id = match client.next_event().await {
            StreamEvent::StreamOpen(header) => {
                header.attr("id").expect("stream id issued").to_string()
            }
            other => panic!("expected header, got {other:?}"),
        };

        let mut hasher = Sha1::new();
        hasher.update(stream_id.as_bytes());
        hasher.update(secret.as_bytes());
        let digest: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        client.send(&format!("<handshake>{digest}</handshake>")).await;
        let ack = client.expect_element("handshake").await;
        assert!(ack.nodes().is_empty(), "handshake ack is empty");
        client
    }

    pub async fn send(&mut self, xml: &str) {
        self.stream
            .write_all(xml.as_bytes())
            .await
            .expect("writable stream");
    }

    pub async fn next_event(&mut self) -> StreamEvent {
        loop {
            if let Some(event) = self.parser.next_event().expect("well-formed server output") {
                return event;
            }
            let mut buf = [0u8; 8192];
            let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                .await
                .expect("server reply in time")
                .expect("readable stream");
            assert!(n > 0, "server closed unexpectedly");
            self.parser.feed(&buf[..n]);
        }
    }

    pub async fn expect_element(&mut self, name: &str) -> Element {
        match self.next_event().await {
            StreamEvent::Element(el) => {
                assert_eq!(el.name(), name, "got <{}/> instead", el.name());
                el
            }
            other => panic!("expected <{name}/>, got {other:?}"),
        }
    }
}
