//! Unified error handling for rxmppd.
//!
//! This module provides the typed error hierarchy of the routing core, with
//! automatic conversions, stanza-error mapping, and metric labeling. Internal
//! errors are never surfaced verbatim to peers; the router maps them onto the
//! fixed XMPP error vocabulary.

use rxmpp_proto::StanzaErrorCondition;
use thiserror::Error;

/// Cluster-unique identifier of a running process.
pub type InstanceId = String;

// ============================================================================
// Cluster errors (KV, membership, inter-node RPC)
// ============================================================================

/// Errors from the cluster key-value abstraction.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv backend unavailable: {0}")]
    Backend(String),

    #[error("lease {0} not found or expired")]
    LeaseNotFound(i64),

    #[error("kv store closed")]
    Closed,

    #[error("stored value did not decode: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Errors from the cluster connection manager and router.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// No connection is held for the instance (node unknown or gone).
    #[error("no connection to cluster node {0}")]
    ConnNotFound(InstanceId),

    /// The peer speaks a different cluster-API major version.
    #[error("incompatible cluster protocol with {instance_id}: local v{local_major}, remote v{remote_major}")]
    IncompatibleProtocol {
        instance_id: InstanceId,
        local_major: u32,
        remote_major: u32,
    },

    /// The peer answered the RPC with a failure.
    #[error("rpc to {instance_id} failed: {message}")]
    Rpc {
        instance_id: InstanceId,
        message: String,
    },

    /// The RPC did not complete within its deadline.
    #[error("rpc to {instance_id} timed out")]
    RpcTimeout { instance_id: InstanceId },

    /// The link to the peer dropped mid-call.
    #[error("connection to {instance_id} closed")]
    ConnClosed { instance_id: InstanceId },

    #[error(transparent)]
    Kv(#[from] KvError),
}

impl ClusterError {
    /// Static code for metrics labeling.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConnNotFound(_) => "conn_not_found",
            Self::IncompatibleProtocol { .. } => "incompatible_protocol",
            Self::Rpc { .. } => "rpc_failed",
            Self::RpcTimeout { .. } => "rpc_timeout",
            Self::ConnClosed { .. } => "conn_closed",
            Self::Kv(_) => "kv",
        }
    }

    /// Whether a single retry is worth attempting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Rpc { .. } | Self::RpcTimeout { .. } | Self::ConnClosed { .. }
        )
    }
}

// ============================================================================
// Storage errors
// ============================================================================

/// Errors from the repository layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("stored row did not decode: {0}")]
    Decode(String),

    /// Stand-in failure injected by tests.
    #[error("mocked storage failure")]
    Mocked,
}

// ============================================================================
// Component errors
// ============================================================================

/// Errors from the component registry.
#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("no component registered for host {0}")]
    NotFound(String),

    #[error("component host {0} is already registered")]
    AlreadyRegistered(String),

    /// The stream backing an external component is gone.
    #[error("component stream for {0} is closed")]
    StreamClosed(String),
}

// ============================================================================
// Router errors
// ============================================================================

/// Errors produced while routing a stanza.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The destination resource is not bound anywhere.
    #[error("resource not found: {user}/{resource}")]
    ResourceNotFound { user: String, resource: String },

    /// The destination user has no available resources.
    #[error("user {0} is offline")]
    UserNotAvailable(String),

    /// The destination account does not exist on this service.
    #[error("account {0} does not exist")]
    NotExistingAccount(String),

    /// The sending stream is not authenticated for this operation.
    #[error("not authenticated")]
    Unauthenticated,

    /// An interceptor consumed the stanza; routing stops silently.
    #[error("stanza interception interrupted")]
    InterceptInterrupted,

    /// An interceptor failed; the hop is cancelled and the sender is owed
    /// an internal-server-error bounce.
    #[error("stanza interceptor failed")]
    InterceptFailed,

    /// The stanza is missing a destination and a sender to default from.
    #[error("stanza carries no routable destination")]
    NoDestination,

    /// The destination is a remote domain and no S2S provider is wired.
    #[error("no server-to-server provider for remote domain {0}")]
    FederationUnavailable(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Component(#[from] ComponentError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Stand-in failure injected by tests.
    #[error("mocked router failure")]
    Mocked,
}

impl RouterError {
    /// Static code for metrics labeling.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ResourceNotFound { .. } => "resource_not_found",
            Self::UserNotAvailable(_) => "user_not_available",
            Self::NotExistingAccount(_) => "not_existing_account",
            Self::Unauthenticated => "unauthenticated",
            Self::InterceptInterrupted => "intercept_interrupted",
            Self::InterceptFailed => "intercept_failed",
            Self::NoDestination => "no_destination",
            Self::FederationUnavailable(_) => "federation_unavailable",
            Self::Cluster(e) => e.error_code(),
            Self::Component(_) => "component_not_found",
            Self::Storage(_) => "storage",
            Self::Mocked => "mocked",
        }
    }

    /// The stanza error condition to bounce back to the sender, or `None`
    /// when no bounce is warranted (interception already answered, or the
    /// failure must stay internal).
    pub fn bounce_condition(&self) -> Option<StanzaErrorCondition> {
        match self {
            Self::ResourceNotFound { .. } | Self::UserNotAvailable(_) => {
                Some(StanzaErrorCondition::ServiceUnavailable)
            }
            Self::NotExistingAccount(_) => Some(StanzaErrorCondition::ServiceUnavailable),
            Self::Unauthenticated => Some(StanzaErrorCondition::Forbidden),
            Self::InterceptInterrupted => None,
            Self::InterceptFailed => Some(StanzaErrorCondition::InternalServerError),
            Self::NoDestination => Some(StanzaErrorCondition::BadRequest),
            Self::FederationUnavailable(_) => Some(StanzaErrorCondition::RemoteServerNotFound),
            Self::Cluster(e) => match e {
                ClusterError::ConnNotFound(_) => Some(StanzaErrorCondition::ServiceUnavailable),
                ClusterError::RpcTimeout { .. } => Some(StanzaErrorCondition::RemoteServerTimeout),
                _ => Some(StanzaErrorCondition::InternalServerError),
            },
            Self::Component(ComponentError::NotFound(_)) => {
                Some(StanzaErrorCondition::ServiceUnavailable)
            }
            Self::Component(_) => Some(StanzaErrorCondition::InternalServerError),
            Self::Storage(_) | Self::Mocked => Some(StanzaErrorCondition::InternalServerError),
        }
    }
}

/// Result type for routing operations.
pub type RouterResult<T = ()> = Result<T, RouterError>;

// ============================================================================
// SASL errors
// ============================================================================

/// SASL negotiation failures (RFC 6120 §6.5 condition subset).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaslError {
    #[error("sasl mechanism not offered")]
    InvalidMechanism,

    #[error("malformed sasl request")]
    MalformedRequest,

    #[error("credentials rejected")]
    NotAuthorized,

    /// The account named in the exchange does not exist.
    #[error("account does not exist")]
    AccountUnknown,

    #[error("authentication aborted by the peer")]
    Aborted,

    #[error("temporary authentication failure")]
    TemporaryFailure,
}

impl SaslError {
    /// The wire name of the SASL failure condition element.
    pub fn condition(&self) -> &'static str {
        match self {
            Self::InvalidMechanism => "invalid-mechanism",
            Self::MalformedRequest => "malformed-request",
            Self::NotAuthorized | Self::AccountUnknown => "not-authorized",
            Self::Aborted => "aborted",
            Self::TemporaryFailure => "temporary-auth-failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(
            RouterError::NotExistingAccount("a".into()).error_code(),
            "not_existing_account"
        );
        assert_eq!(
            RouterError::Cluster(ClusterError::ConnNotFound("i1".into())).error_code(),
            "conn_not_found"
        );
        assert_eq!(RouterError::Mocked.error_code(), "mocked");
    }

    #[test]
    fn interception_never_bounces() {
        assert!(RouterError::InterceptInterrupted.bounce_condition().is_none());
        assert_eq!(
            RouterError::UserNotAvailable("a".into()).bounce_condition(),
            Some(StanzaErrorCondition::ServiceUnavailable)
        );
    }

    #[test]
    fn transient_cluster_errors_retry() {
        assert!(
            ClusterError::RpcTimeout {
                instance_id: "i".into()
            }
            .is_transient()
        );
        assert!(!ClusterError::ConnNotFound("i".into()).is_transient());
        assert!(
            !ClusterError::IncompatibleProtocol {
                instance_id: "i".into(),
                local_major: 1,
                remote_major: 2
            }
            .is_transient()
        );
    }

    #[test]
    fn sasl_conditions_map_to_wire_names() {
        assert_eq!(SaslError::NotAuthorized.condition(), "not-authorized");
        assert_eq!(SaslError::AccountUnknown.condition(), "not-authorized");
        assert_eq!(SaslError::Aborted.condition(), "aborted");
    }
}
