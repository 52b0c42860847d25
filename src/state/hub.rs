//! Stream hub: the registry of live streams on this node.
//!
//! Streams insert themselves on accept and remove themselves when their
//! task finishes. Other components never touch stream state directly;
//! they post elements or disconnect commands through the [`StreamHandle`]
//! stored here.

use dashmap::DashMap;
use rxmpp_proto::{Element, Jid, StreamError, StreamErrorKind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// The posting surface of a stream, owned by its actor task.
#[async_trait::async_trait]
pub trait StreamHandle: Send + Sync {
    /// The stream's unique id.
    fn stream_id(&self) -> &str;

    /// The bound JID, present from `bound` state on.
    fn jid(&self) -> Option<Jid>;

    /// Non-blocking enqueue of an outbound element. Returns false when the
    /// stream's mailbox is gone (actor finished).
    fn send_element(&self, element: Element) -> bool;

    /// Post a disconnect command with a stream error.
    async fn disconnect(&self, error: StreamError);
}

/// Live streams, addressable by stream id and by bound full JID.
#[derive(Default)]
pub struct StreamHub {
    streams: DashMap<String, Arc<dyn StreamHandle>>,
    by_jid: DashMap<String, String>,
}

impl StreamHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track a freshly accepted stream.
    pub fn insert(&self, handle: Arc<dyn StreamHandle>) {
        self.streams.insert(handle.stream_id().to_string(), handle);
    }

    /// Index a stream under its bound full JID (bind success).
    pub fn bind(&self, stream_id: &str, jid: &Jid) {
        self.by_jid.insert(jid.to_string(), stream_id.to_string());
    }

    /// Forget a stream (actor exit). Removes any JID index entry that
    /// still points at it.
    pub fn remove(&self, stream_id: &str) {
        self.streams.remove(stream_id);
        self.by_jid.retain(|_, id| id != stream_id);
    }

    /// The stream bound to exactly this full JID.
    pub fn lookup_full(&self, jid: &Jid) -> Option<Arc<dyn StreamHandle>> {
        let stream_id = self.by_jid.get(&jid.to_string())?.clone();
        self.streams.get(&stream_id).map(|h| Arc::clone(&h))
    }

    /// Whether a stream is bound to this full JID.
    pub fn contains_jid(&self, jid: &Jid) -> bool {
        self.by_jid.contains_key(&jid.to_string())
    }

    /// A stream by id.
    pub fn get(&self, stream_id: &str) -> Option<Arc<dyn StreamHandle>> {
        self.streams.get(stream_id).map(|h| Arc::clone(&h))
    }

    /// Number of live streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// True when no streams remain.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Send `system-shutdown` to every stream concurrently, then wait for
    /// the actors to drain and deregister, up to `disconnect_timeout`.
    pub async fn broadcast_shutdown(&self, disconnect_timeout: Duration) {
        let handles: Vec<Arc<dyn StreamHandle>> = self
            .streams
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        if handles.is_empty() {
            return;
        }
        info!(streams = handles.len(), "broadcasting system shutdown");

        let mut tasks = Vec::with_capacity(handles.len());
        for handle in handles {
            tasks.push(tokio::spawn(async move {
                handle
                    .disconnect(StreamError::new(StreamErrorKind::SystemShutdown))
                    .await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }

        let deadline = Instant::now() + disconnect_timeout;
        while !self.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if !self.is_empty() {
            warn!(remaining = self.len(), "streams still live after drain deadline");
        }
    }
}
