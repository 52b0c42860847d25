//! Cluster link wire format.
//!
//! Length-delimited MessagePack frames over TCP. The first exchange on a
//! link is `Hello`/`HelloAck` carrying instance identity and the cluster
//! API version; everything after is request/response keyed by a sequence
//! number, plus keep-alive pings.

use crate::cluster::memberlist::ApiVersion;
use crate::error::InstanceId;
use bytes::Bytes;
use rxmpp_proto::{Stanza, StreamError};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Frame cap on the cluster link; stanzas are already size-capped well
/// below this at their ingress stream.
const MAX_FRAME_LEN: usize = 1024 * 1024;

/// One frame on the cluster link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// Dialer introduces itself.
    Hello {
        instance_id: InstanceId,
        api_version: ApiVersion,
    },
    /// Listener answers with its own identity.
    HelloAck {
        instance_id: InstanceId,
        api_version: ApiVersion,
    },
    /// Keep-alive probe.
    Ping,
    /// Keep-alive answer.
    Pong,
    /// A call; `seq` correlates the response.
    Request { seq: u64, body: RequestBody },
    /// Answer to the request with the same `seq`.
    Response {
        seq: u64,
        result: Result<ResponseBody, RpcFault>,
    },
}

/// The callable surface a node exposes to its peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestBody {
    /// Deliver a stanza to a locally-bound resource.
    RouteToLocal {
        username: String,
        resource: String,
        stanza: Stanza,
    },
    /// Force-disconnect a locally-bound resource with a stream error.
    DisconnectLocal {
        username: String,
        resource: String,
        error: StreamError,
    },
    /// Deliver a stanza to a component hosted on the receiving node.
    RouteToComponent { host: String, stanza: Stanza },
    /// Claim a detached stream-management queue.
    TransferQueue { queue_id: String },
}

impl RequestBody {
    /// Method label for metrics.
    pub fn method(&self) -> &'static str {
        match self {
            Self::RouteToLocal { .. } => "route_local",
            Self::DisconnectLocal { .. } => "disconnect",
            Self::RouteToComponent { .. } => "route_component",
            Self::TransferQueue { .. } => "transfer_queue",
        }
    }
}

/// Successful call results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseBody {
    /// The operation completed.
    Ack,
    /// The claimed queue, or `None` when unknown or already claimed.
    Queue(Option<TransferredQueue>),
}

/// A detached stream-management queue handed between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferredQueue {
    pub elements: Vec<QueuedElement>,
    pub nonce: Vec<u8>,
    pub in_h: u64,
    pub out_h: u64,
}

/// One unacked element with its outbound counter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedElement {
    pub stanza: Stanza,
    pub h: u64,
}

/// Failure surface of peer calls.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum RpcFault {
    /// The addressed resource, component or queue is unknown here.
    #[error("not found: {0}")]
    NotFound(String),
    /// The request was malformed for this node.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The node failed internally while serving the call.
    #[error("internal: {0}")]
    Internal(String),
}

/// Frame codec: MessagePack inside length-delimited frames.
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Frame>, Self::Error> {
        let Some(bytes) = self.inner.decode(src)? else {
            return Ok(None);
        };
        rmp_serde::from_slice(&bytes)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut bytes::BytesMut) -> Result<(), Self::Error> {
        let buf = rmp_serde::to_vec(&frame)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.inner.encode(Bytes::from(buf), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rxmpp_proto::{Element, StreamErrorKind};

    fn sample_stanza() -> Stanza {
        Stanza::from_element(
            Element::builder("message")
                .attr("from", "alice@ex.org/one")
                .attr("to", "bob@ex.org/phone")
                .attr("type", "chat")
                .child(Element::builder("body").text("hi <there> & you").build())
                .build(),
        )
        .unwrap()
    }

    fn round_trip(frame: Frame) -> Frame {
        let mut codec = FrameCodec::new();
        let mut buf = bytes::BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn request_frames_round_trip() {
        let frame = Frame::Request {
            seq: 7,
            body: RequestBody::RouteToLocal {
                username: "bob".into(),
                resource: "phone".into(),
                stanza: sample_stanza(),
            },
        };
        match round_trip(frame) {
            Frame::Request {
                seq: 7,
                body: RequestBody::RouteToLocal {
                    username,
                    resource,
                    stanza,
                },
            } => {
                assert_eq!(username, "bob");
                assert_eq!(resource, "phone");
                assert_eq!(stanza, sample_stanza());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn disconnect_carries_stream_error() {
        let frame = Frame::Request {
            seq: 1,
            body: RequestBody::DisconnectLocal {
                username: "alice".into(),
                resource: "tablet".into(),
                error: StreamError::new(StreamErrorKind::Conflict)
                    .with_text("replaced by new connection"),
            },
        };
        match round_trip(frame) {
            Frame::Request {
                body: RequestBody::DisconnectLocal { error, .. },
                ..
            } => {
                assert_eq!(error.kind, StreamErrorKind::Conflict);
                assert_eq!(error.text.as_deref(), Some("replaced by new connection"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn queue_response_round_trips() {
        let frame = Frame::Response {
            seq: 3,
            result: Ok(ResponseBody::Queue(Some(TransferredQueue {
                elements: vec![QueuedElement {
                    stanza: sample_stanza(),
                    h: 41,
                }],
                nonce: vec![1, 2, 3],
                in_h: 12,
                out_h: 42,
            }))),
        };
        match round_trip(frame) {
            Frame::Response {
                result: Ok(ResponseBody::Queue(Some(queue))),
                ..
            } => {
                assert_eq!(queue.elements.len(), 1);
                assert_eq!(queue.elements[0].h, 41);
                assert_eq!(queue.out_h, 42);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn faults_round_trip() {
        let frame = Frame::Response {
            seq: 9,
            result: Err(RpcFault::NotFound("upload.ex".into())),
        };
        match round_trip(frame) {
            Frame::Response {
                result: Err(RpcFault::NotFound(host)),
                ..
            } => assert_eq!(host, "upload.ex"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        let mut codec = FrameCodec::new();
        let mut buf = bytes::BytesMut::new();
        // A length header promising 4 bytes of non-msgpack noise.
        buf.extend_from_slice(&4u32.to_be_bytes());
        buf.extend_from_slice(&[0xc1, 0xc1, 0xc1, 0xc1]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
