//! Dialing side of a cluster link.
//!
//! A [`Conn`] owns one framed TCP link to a peer node: a pump task
//! multiplexes requests by sequence number and answers keep-alive probes.
//! The thin [`LocalRouterClient`] and [`ComponentRouterClient`] facades are
//! what the routing layers actually hold.

use super::wire::{Frame, FrameCodec, RequestBody, ResponseBody, RpcFault, TransferredQueue};
use crate::cluster::memberlist::{ApiVersion, ClusterMember};
use crate::error::{ClusterError, InstanceId};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use rxmpp_proto::{Stanza, StreamError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// Keep-alive probe period on idle links.
const PING_PERIOD: Duration = Duration::from_secs(30);

type PendingMap = Arc<DashMap<u64, oneshot::Sender<Result<ResponseBody, RpcFault>>>>;

/// One established link to a peer node.
#[derive(Debug)]
pub struct Conn {
    instance_id: InstanceId,
    remote_version: ApiVersion,
    tx: mpsc::Sender<Frame>,
    pending: PendingMap,
    seq: AtomicU64,
    closed: Arc<AtomicBool>,
    request_timeout: Duration,
    pump: tokio::task::JoinHandle<()>,
}

impl Conn {
    /// Dial a registered member and complete the hello exchange.
    pub async fn connect(
        member: &ClusterMember,
        local_id: InstanceId,
        local_version: ApiVersion,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Conn, ClusterError> {
        let addr = format!("{}:{}", member.host, member.port);
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ClusterError::RpcTimeout {
                instance_id: member.instance_id.clone(),
            })?
            .map_err(|e| ClusterError::Rpc {
                instance_id: member.instance_id.clone(),
                message: format!("dial {addr}: {e}"),
            })?;

        let mut framed = Framed::new(stream, FrameCodec::new());
        framed
            .send(Frame::Hello {
                instance_id: local_id,
                api_version: local_version,
            })
            .await
            .map_err(|e| ClusterError::Rpc {
                instance_id: member.instance_id.clone(),
                message: format!("hello: {e}"),
            })?;

        let ack = tokio::time::timeout(connect_timeout, framed.next())
            .await
            .map_err(|_| ClusterError::RpcTimeout {
                instance_id: member.instance_id.clone(),
            })?;
        let remote_version = match ack {
            Some(Ok(Frame::HelloAck { api_version, .. })) => api_version,
            other => {
                return Err(ClusterError::Rpc {
                    instance_id: member.instance_id.clone(),
                    message: format!("bad hello ack: {other:?}"),
                });
            }
        };

        let (tx, rx) = mpsc::channel::<Frame>(256);
        let pending: PendingMap = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let pump = tokio::spawn(pump_link(
            framed,
            rx,
            Arc::clone(&pending),
            Arc::clone(&closed),
            member.instance_id.clone(),
        ));

        Ok(Conn {
            instance_id: member.instance_id.clone(),
            remote_version,
            tx,
            pending,
            seq: AtomicU64::new(1),
            closed,
            request_timeout,
            pump,
        })
    }

    /// The peer's instance id.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The cluster API version the peer reported in its hello ack.
    pub fn remote_version(&self) -> ApiVersion {
        self.remote_version
    }

    /// Whether the pump observed the link die.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Issue one call with the configured deadline.
    async fn call(&self, body: RequestBody) -> Result<ResponseBody, ClusterError> {
        if self.is_closed() {
            return Err(ClusterError::ConnClosed {
                instance_id: self.instance_id.clone(),
            });
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(seq, reply_tx);

        let sent = self.tx.send(Frame::Request { seq, body }).await;
        if sent.is_err() {
            self.pending.remove(&seq);
            return Err(ClusterError::ConnClosed {
                instance_id: self.instance_id.clone(),
            });
        }

        let reply = tokio::time::timeout(self.request_timeout, reply_rx).await;
        match reply {
            Err(_) => {
                self.pending.remove(&seq);
                Err(ClusterError::RpcTimeout {
                    instance_id: self.instance_id.clone(),
                })
            }
            Ok(Err(_)) => Err(ClusterError::ConnClosed {
                instance_id: self.instance_id.clone(),
            }),
            Ok(Ok(Err(fault))) => Err(ClusterError::Rpc {
                instance_id: self.instance_id.clone(),
                message: fault.to_string(),
            }),
            Ok(Ok(Ok(body))) => Ok(body),
        }
    }

    /// Facade for routing to resources bound on the peer.
    pub fn local_router(&self) -> LocalRouterClient<'_> {
        LocalRouterClient { conn: self }
    }

    /// Facade for routing to components hosted on the peer.
    pub fn component_router(&self) -> ComponentRouterClient<'_> {
        ComponentRouterClient { conn: self }
    }

    /// Claim a detached stream-management queue held by the peer.
    pub async fn transfer_queue(
        &self,
        queue_id: &str,
    ) -> Result<Option<TransferredQueue>, ClusterError> {
        match self
            .call(RequestBody::TransferQueue {
                queue_id: queue_id.to_string(),
            })
            .await?
        {
            ResponseBody::Queue(queue) => Ok(queue),
            ResponseBody::Ack => Err(ClusterError::Rpc {
                instance_id: self.instance_id.clone(),
                message: "ack where queue expected".into(),
            }),
        }
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Remote `LocalRouter` facade.
pub struct LocalRouterClient<'a> {
    conn: &'a Conn,
}

impl LocalRouterClient<'_> {
    /// Deliver `stanza` to `(username, resource)` bound on the peer.
    pub async fn route(
        &self,
        username: &str,
        resource: &str,
        stanza: Stanza,
    ) -> Result<(), ClusterError> {
        self.conn
            .call(RequestBody::RouteToLocal {
                username: username.to_string(),
                resource: resource.to_string(),
                stanza,
            })
            .await
            .map(|_| ())
    }

    /// Force-disconnect `(username, resource)` on the peer.
    pub async fn disconnect(
        &self,
        username: &str,
        resource: &str,
        error: StreamError,
    ) -> Result<(), ClusterError> {
        self.conn
            .call(RequestBody::DisconnectLocal {
                username: username.to_string(),
                resource: resource.to_string(),
                error,
            })
            .await
            .map(|_| ())
    }
}

/// Remote `ComponentRouter` facade.
pub struct ComponentRouterClient<'a> {
    conn: &'a Conn,
}

impl ComponentRouterClient<'_> {
    /// Deliver `stanza` to the component `host` attached to the peer.
    pub async fn route(&self, host: &str, stanza: Stanza) -> Result<(), ClusterError> {
        self.conn
            .call(RequestBody::RouteToComponent {
                host: host.to_string(),
                stanza,
            })
            .await
            .map(|_| ())
    }
}

async fn pump_link(
    mut framed: Framed<TcpStream, FrameCodec>,
    mut rx: mpsc::Receiver<Frame>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    peer: InstanceId,
) {
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // immediate tick consumed

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        if let Err(e) = framed.send(frame).await {
                            warn!(peer = %peer, error = %e, "cluster link write failed");
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = framed.next() => {
                match incoming {
                    Some(Ok(Frame::Response { seq, result })) => {
                        if let Some((_, reply)) = pending.remove(&seq) {
                            let _ = reply.send(result);
                        } else {
                            debug!(peer = %peer, seq, "response for unknown sequence");
                        }
                    }
                    Some(Ok(Frame::Ping)) => {
                        if framed.send(Frame::Pong).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Frame::Pong)) => {}
                    Some(Ok(other)) => {
                        debug!(peer = %peer, frame = ?other, "unexpected frame on dialing link");
                    }
                    Some(Err(e)) => {
                        warn!(peer = %peer, error = %e, "cluster link read failed");
                        break;
                    }
                    None => {
                        debug!(peer = %peer, "cluster link closed by peer");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if framed.send(Frame::Ping).await.is_err() {
                    break;
                }
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Fail everything still in flight.
    pending.clear();
}
