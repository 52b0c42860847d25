//! Detached stream-management queues.
//!
//! When a stream with stanza management enabled drops without a clean
//! close, its unacked outbound queue is parked here under the stream id.
//! A resuming session on any node claims it over the `TransferQueue` RPC;
//! a queue is claimable exactly once.

use crate::cluster::rpc::wire::{QueuedElement, TransferredQueue};
use dashmap::DashMap;
use rxmpp_proto::Stanza;

/// Node-local registry of parked queues.
#[derive(Default)]
pub struct SmQueueRegistry {
    queues: DashMap<String, TransferredQueue>,
}

impl SmQueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a queue under its id, replacing any previous parking.
    pub fn park(&self, queue_id: &str, queue: TransferredQueue) {
        self.queues.insert(queue_id.to_string(), queue);
    }

    /// Claim a queue. Removal makes the claim exclusive: a second claim of
    /// the same id returns `None`.
    pub fn claim(&self, queue_id: &str) -> Option<TransferredQueue> {
        self.queues.remove(queue_id).map(|(_, q)| q)
    }

    /// Number of parked queues.
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    /// True when nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

/// Per-stream stanza-management counters and the unacked outbound queue.
#[derive(Debug, Default)]
pub struct SmState {
    /// Stanzas handled inbound (the value we would report in `<a/>`).
    pub in_h: u64,
    /// Stanzas sent outbound.
    pub out_h: u64,
    /// Resumption nonce minted at enable time.
    pub nonce: Vec<u8>,
    unacked: Vec<QueuedElement>,
}

impl SmState {
    pub fn new(nonce: Vec<u8>) -> Self {
        Self {
            nonce,
            ..Default::default()
        }
    }

    /// Record an outbound stanza.
    pub fn record_sent(&mut self, stanza: Stanza) {
        self.out_h += 1;
        self.unacked.push(QueuedElement {
            stanza,
            h: self.out_h,
        });
    }

    /// Record an inbound stanza.
    pub fn record_received(&mut self) {
        self.in_h += 1;
    }

    /// Drop every element the peer acked up to and including `h`.
    pub fn ack(&mut self, h: u64) {
        self.unacked.retain(|e| e.h > h);
    }

    /// Unacked element count.
    pub fn pending(&self) -> usize {
        self.unacked.len()
    }

    /// Package the state for parking.
    pub fn into_transferred(self) -> TransferredQueue {
        TransferredQueue {
            elements: self.unacked,
            nonce: self.nonce,
            in_h: self.in_h,
            out_h: self.out_h,
        }
    }
}
