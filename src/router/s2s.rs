//! Server-to-server egress seam.
//!
//! Dialback, DNS resolution and outbound stream management belong to an
//! external provider; the router only needs something to hand remote-domain
//! stanzas to.

use crate::error::{RouterError, RouterResult};
use rxmpp_proto::Stanza;
use tracing::warn;

/// Outbound federation provider.
#[async_trait::async_trait]
pub trait S2SOutProvider: Send + Sync {
    /// Take responsibility for a stanza addressed to a remote domain.
    async fn route(&self, stanza: Stanza) -> RouterResult<()>;
}

/// Provider used when federation is not configured: every remote-domain
/// stanza bounces with `remote-server-not-found`.
pub struct NoFederation;

#[async_trait::async_trait]
impl S2SOutProvider for NoFederation {
    async fn route(&self, stanza: Stanza) -> RouterResult<()> {
        let domain = stanza
            .to_jid()
            .map(|j| j.domain().to_string())
            .unwrap_or_default();
        warn!(domain = %domain, "remote-domain stanza with federation disabled");
        Err(RouterError::FederationUnavailable(domain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rxmpp_proto::{Element, StanzaErrorCondition};

    #[tokio::test]
    async fn no_federation_bounces_remote_server_not_found() {
        let provider = NoFederation;
        let stanza = Stanza::from_element(
            Element::builder("message")
                .attr("from", "alice@ex.org/desk")
                .attr("to", "bob@elsewhere.net")
                .build(),
        )
        .unwrap();
        let err = provider.route(stanza).await.unwrap_err();
        assert_eq!(
            err.bounce_condition(),
            Some(StanzaErrorCondition::RemoteServerNotFound)
        );
    }
}
