//! Cluster router: stanza forwarding and forced disconnects across nodes.
//!
//! Thin policy layer over the connection manager: resolve the owning
//! node's link, call its remote facade under the request deadline, and
//! retry exactly once when the failure is transient.

use crate::cluster::connmgr::ConnManager;
use crate::error::{ClusterError, InstanceId};
use rxmpp_proto::{Stanza, StreamError};
use std::sync::Arc;
use tracing::debug;

/// Routes stanzas and disconnect commands to the node owning a resource.
pub struct ClusterRouter {
    conns: Arc<ConnManager>,
}

impl ClusterRouter {
    pub fn new(conns: Arc<ConnManager>) -> Self {
        Self { conns }
    }

    /// Deliver `stanza` to `(username, resource)` bound on `instance_id`.
    pub async fn route(
        &self,
        stanza: Stanza,
        username: &str,
        resource: &str,
        instance_id: &InstanceId,
    ) -> Result<(), ClusterError> {
        let conn = self.conns.get_connection(instance_id)?;
        let first = conn
            .local_router()
            .route(username, resource, stanza.clone())
            .await;
        match first {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => {
                debug!(instance_id = %instance_id, error = %e, "remote route retried");
                let conn = self.conns.get_connection(instance_id)?;
                conn.local_router().route(username, resource, stanza).await
            }
            Err(e) => Err(e),
        }
    }

    /// Force-disconnect `(username, resource)` on `instance_id` with the
    /// given stream error. Used by `terminate_old` binds and admin kicks.
    pub async fn disconnect(
        &self,
        username: &str,
        resource: &str,
        error: StreamError,
        instance_id: &InstanceId,
    ) -> Result<(), ClusterError> {
        let conn = self.conns.get_connection(instance_id)?;
        let first = conn
            .local_router()
            .disconnect(username, resource, error.clone())
            .await;
        match first {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => {
                debug!(instance_id = %instance_id, error = %e, "remote disconnect retried");
                let conn = self.conns.get_connection(instance_id)?;
                conn.local_router().disconnect(username, resource, error).await
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memberlist::{CLUSTER_API_VERSION, ClusterMember};
    use crate::cluster::rpc::server::{RpcHandler, RpcServer};
    use crate::cluster::rpc::wire::{RpcFault, TransferredQueue};
    use rxmpp_proto::{Element, StreamErrorKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FlakyOnce {
        failures_left: AtomicUsize,
        disconnects: parking_lot::Mutex<Vec<(String, String, StreamErrorKind)>>,
    }

    #[async_trait::async_trait]
    impl RpcHandler for FlakyOnce {
        async fn route_to_local(
            &self,
            _username: &str,
            _resource: &str,
            _stanza: Stanza,
        ) -> Result<(), RpcFault> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RpcFault::Internal("transient".into()));
            }
            Ok(())
        }

        async fn disconnect_local(
            &self,
            username: &str,
            resource: &str,
            error: StreamError,
        ) -> Result<(), RpcFault> {
            self.disconnects
                .lock()
                .push((username.to_string(), resource.to_string(), error.kind));
            Ok(())
        }

        async fn route_to_component(&self, _host: &str, _stanza: Stanza) -> Result<(), RpcFault> {
            Ok(())
        }

        async fn transfer_queue(
            &self,
            _queue_id: &str,
        ) -> Result<Option<TransferredQueue>, RpcFault> {
            Ok(None)
        }
    }

    fn stanza() -> Stanza {
        Stanza::from_element(
            Element::builder("message")
                .attr("from", "alice@ex.org/one")
                .attr("to", "bob@ex.org/phone")
                .build(),
        )
        .unwrap()
    }

    async fn setup(failures: usize) -> (RpcServer, Arc<FlakyOnce>, ClusterRouter) {
        let handler = Arc::new(FlakyOnce {
            failures_left: AtomicUsize::new(failures),
            disconnects: parking_lot::Mutex::new(Vec::new()),
        });
        let server = RpcServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            "node-b".into(),
            CLUSTER_API_VERSION,
            handler.clone(),
        )
        .await
        .unwrap();
        let member = ClusterMember {
            instance_id: "node-b".into(),
            host: "127.0.0.1".into(),
            port: server.local_addr().port(),
            api_version: CLUSTER_API_VERSION,
        };
        let conns = ConnManager::new(
            "node-a".into(),
            CLUSTER_API_VERSION,
            Duration::from_secs(2),
            Duration::from_secs(2),
        );
        conns.handle_delta(&[member], &[]).await;
        (server, handler, ClusterRouter::new(conns))
    }

    #[tokio::test]
    async fn transient_failure_is_retried_once() {
        let (_server, _handler, router) = setup(1).await;
        router
            .route(stanza(), "bob", "phone", &"node-b".to_string())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn persistent_failure_is_reported() {
        let (_server, _handler, router) = setup(5).await;
        let err = router
            .route(stanza(), "bob", "phone", &"node-b".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Rpc { .. }));
    }

    #[tokio::test]
    async fn unknown_node_reports_conn_not_found() {
        let (_server, _handler, router) = setup(0).await;
        let err = router
            .route(stanza(), "bob", "phone", &"node-z".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::ConnNotFound(_)));
    }

    #[tokio::test]
    async fn disconnect_reaches_the_owning_node() {
        let (_server, handler, router) = setup(0).await;
        router
            .disconnect(
                "alice",
                "tablet",
                StreamError::new(StreamErrorKind::Conflict),
                &"node-b".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(
            handler.disconnects.lock().as_slice(),
            &[(
                "alice".to_string(),
                "tablet".to_string(),
                StreamErrorKind::Conflict
            )]
        );
    }
}
