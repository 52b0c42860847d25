//! Cluster RPC listener.
//!
//! Accepts peer links, answers the hello exchange, and serves requests by
//! delegating to the node's [`RpcHandler`]. One task per link; requests on
//! a link are served in arrival order, which preserves the sender's
//! per-stream FIFO through the mesh.

use super::wire::{Frame, FrameCodec, RequestBody, ResponseBody, RpcFault, TransferredQueue};
use crate::cluster::memberlist::ApiVersion;
use crate::error::InstanceId;
use futures_util::{SinkExt, StreamExt};
use rxmpp_proto::{Stanza, StreamError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// What a node exposes to its peers. Implemented by the bootstrap wiring
/// over the local router, component registry and queue registry.
#[async_trait::async_trait]
pub trait RpcHandler: Send + Sync {
    async fn route_to_local(
        &self,
        username: &str,
        resource: &str,
        stanza: Stanza,
    ) -> Result<(), RpcFault>;

    async fn disconnect_local(
        &self,
        username: &str,
        resource: &str,
        error: StreamError,
    ) -> Result<(), RpcFault>;

    async fn route_to_component(&self, host: &str, stanza: Stanza) -> Result<(), RpcFault>;

    async fn transfer_queue(&self, queue_id: &str)
        -> Result<Option<TransferredQueue>, RpcFault>;
}

/// The accepting side of the cluster mesh.
pub struct RpcServer {
    local_addr: SocketAddr,
    accept_task: tokio::task::JoinHandle<()>,
}

impl RpcServer {
    /// Bind and start serving peers.
    pub async fn bind(
        addr: SocketAddr,
        instance_id: InstanceId,
        api_version: ApiVersion,
        handler: Arc<dyn RpcHandler>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "cluster rpc listener bound");

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        debug!(%peer_addr, "cluster link accepted");
                        let handler = Arc::clone(&handler);
                        let instance_id = instance_id.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                serve_link(stream, instance_id, api_version, handler).await
                            {
                                debug!(%peer_addr, error = %e, "cluster link closed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "cluster accept failed");
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            accept_task,
        })
    }

    /// The bound address (useful when binding port 0 in tests).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new links.
    pub fn stop(&self) {
        self.accept_task.abort();
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_link(
    stream: TcpStream,
    instance_id: InstanceId,
    api_version: ApiVersion,
    handler: Arc<dyn RpcHandler>,
) -> std::io::Result<()> {
    let mut framed = Framed::new(stream, FrameCodec::new());

    // Hello exchange. The listener always answers with its own identity;
    // the dialer decides what a version mismatch means.
    let peer = match framed.next().await {
        Some(Ok(Frame::Hello {
            instance_id: peer_id,
            api_version: peer_version,
        })) => {
            framed
                .send(Frame::HelloAck {
                    instance_id: instance_id.clone(),
                    api_version,
                })
                .await?;
            if !api_version.is_compatible(&peer_version) {
                warn!(peer = %peer_id, local = %api_version, remote = %peer_version,
                      "peer link with incompatible cluster api");
            }
            peer_id
        }
        Some(Ok(other)) => {
            warn!(frame = ?other, "cluster link opened without hello");
            return Ok(());
        }
        Some(Err(e)) => return Err(e),
        None => return Ok(()),
    };

    while let Some(frame) = framed.next().await {
        match frame? {
            Frame::Ping => framed.send(Frame::Pong).await?,
            Frame::Pong => {}
            Frame::Request { seq, body } => {
                let method = body.method();
                let result = dispatch(&*handler, body).await;
                let status = if result.is_ok() { "ok" } else { "error" };
                crate::metrics::record_cluster_rpc(method, status);
                framed.send(Frame::Response { seq, result }).await?;
            }
            other => {
                debug!(peer = %peer, frame = ?other, "unexpected frame on serving link");
            }
        }
    }
    debug!(peer = %peer, "peer link closed");
    Ok(())
}

async fn dispatch(handler: &dyn RpcHandler, body: RequestBody) -> Result<ResponseBody, RpcFault> {
    match body {
        RequestBody::RouteToLocal {
            username,
            resource,
            stanza,
        } => handler
            .route_to_local(&username, &resource, stanza)
            .await
            .map(|()| ResponseBody::Ack),
        RequestBody::DisconnectLocal {
            username,
            resource,
            error,
        } => handler
            .disconnect_local(&username, &resource, error)
            .await
            .map(|()| ResponseBody::Ack),
        RequestBody::RouteToComponent { host, stanza } => handler
            .route_to_component(&host, stanza)
            .await
            .map(|()| ResponseBody::Ack),
        RequestBody::TransferQueue { queue_id } => handler
            .transfer_queue(&queue_id)
            .await
            .map(ResponseBody::Queue),
    }
}
