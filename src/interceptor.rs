//! Stanza interceptor pipeline.
//!
//! Modules that observe or rewrite stanzas register interceptor records on
//! the inbound chain (between "received" and "routed") or the outbound
//! chain (between "destination decided" and "transport write"). Within a
//! chain, higher priority runs first; a stanza passes through each chain
//! at most once per hop.
//!
//! An interceptor may rewrite (stanzas are immutable, so rewriting builds
//! a new one) or interrupt the hop, typically after answering the stanza
//! itself. Interceptors must not panic; a handler error is logged and
//! converted into an interrupt that the router answers with
//! `internal-server-error`.

use parking_lot::RwLock;
use rxmpp_proto::Stanza;
use std::sync::Arc;
use tracing::warn;

/// What an interceptor decided.
#[derive(Debug)]
pub enum Intercept {
    /// Pass this (possibly rewritten) stanza to the next interceptor.
    Continue(Stanza),
    /// Cancel the hop; the interceptor has dealt with the stanza.
    Interrupt,
}

/// Boxed error type carried out of interceptors.
pub type InterceptError = Box<dyn std::error::Error + Send + Sync>;

/// A stanza interceptor. `id` is the record id the handler registered
/// under, letting one handler serve several records.
#[async_trait::async_trait]
pub trait StanzaInterceptor: Send + Sync {
    async fn intercept(&self, stanza: Stanza, id: &str) -> Result<Intercept, InterceptError>;
}

/// Registration of one interceptor on one chain.
pub struct InterceptorRecord {
    /// Stable id, used in logs and metrics.
    pub id: String,
    /// Higher runs first.
    pub priority: i32,
    /// Inbound chain when true, outbound otherwise.
    pub incoming: bool,
    /// The handler.
    pub handler: Arc<dyn StanzaInterceptor>,
}

/// Result of running a whole chain.
#[derive(Debug)]
pub enum PipelineOutcome {
    /// The stanza survived the chain (possibly rewritten).
    Continue(Stanza),
    /// An interceptor interrupted the hop; nothing further happens.
    Interrupted,
    /// An interceptor failed; the router owes the sender an
    /// `internal-server-error` bounce. Carries the stanza as it was when
    /// the failure hit.
    Failed(Stanza),
}

#[derive(Default)]
struct Chains {
    incoming: Vec<InterceptorRecord>,
    outgoing: Vec<InterceptorRecord>,
}

/// The two ordered chains.
#[derive(Default)]
pub struct InterceptorPipeline {
    chains: RwLock<Chains>,
}

impl InterceptorPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a record on its chain, keeping priority order (stable for
    /// equal priorities).
    pub fn register(&self, record: InterceptorRecord) {
        let mut chains = self.chains.write();
        let chain = if record.incoming {
            &mut chains.incoming
        } else {
            &mut chains.outgoing
        };
        let at = chain
            .iter()
            .position(|r| r.priority < record.priority)
            .unwrap_or(chain.len());
        chain.insert(at, record);
    }

    /// Run the inbound chain.
    pub async fn run_incoming(&self, stanza: Stanza) -> PipelineOutcome {
        self.run(stanza, true).await
    }

    /// Run the outbound chain.
    pub async fn run_outgoing(&self, stanza: Stanza) -> PipelineOutcome {
        self.run(stanza, false).await
    }

    async fn run(&self, mut stanza: Stanza, incoming: bool) -> PipelineOutcome {
        let records: Vec<(String, Arc<dyn StanzaInterceptor>)> = {
            let chains = self.chains.read();
            let chain = if incoming {
                &chains.incoming
            } else {
                &chains.outgoing
            };
            chain
                .iter()
                .map(|r| (r.id.clone(), Arc::clone(&r.handler)))
                .collect()
        };

        for (id, handler) in records {
            match handler.intercept(stanza.clone(), &id).await {
                Ok(Intercept::Continue(next)) => stanza = next,
                Ok(Intercept::Interrupt) => {
                    crate::metrics::record_intercepted(&id);
                    return PipelineOutcome::Interrupted;
                }
                Err(e) => {
                    warn!(interceptor = %id, error = %e, "interceptor failed, hop cancelled");
                    crate::metrics::record_intercepted(&id);
                    return PipelineOutcome::Failed(stanza);
                }
            }
        }
        PipelineOutcome::Continue(stanza)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rxmpp_proto::Element;

    fn stanza() -> Stanza {
        Stanza::from_element(
            Element::builder("message")
                .attr("from", "a@ex.org/1")
                .attr("to", "b@ex.org")
                .build(),
        )
        .unwrap()
    }

    struct Tag {
        key: &'static str,
    }

    #[async_trait::async_trait]
    impl StanzaInterceptor for Tag {
        async fn intercept(&self, stanza: Stanza, _id: &str) -> Result<Intercept, InterceptError> {
            let tagged = Stanza::from_element(
                stanza.element().with_attr(self.key, "1"),
            )
            .expect("still a stanza");
            Ok(Intercept::Continue(tagged))
        }
    }

    struct Interrupter;

    #[async_trait::async_trait]
    impl StanzaInterceptor for Interrupter {
        async fn intercept(&self, _s: Stanza, _id: &str) -> Result<Intercept, InterceptError> {
            Ok(Intercept::Interrupt)
        }
    }

    struct Exploder;

    #[async_trait::async_trait]
    impl StanzaInterceptor for Exploder {
        async fn intercept(&self, _s: Stanza, _id: &str) -> Result<Intercept, InterceptError> {
            Err("kaboom".into())
        }
    }

    fn record(
        id: &str,
        priority: i32,
        incoming: bool,
        handler: Arc<dyn StanzaInterceptor>,
    ) -> InterceptorRecord {
        InterceptorRecord {
            id: id.to_string(),
            priority,
            incoming,
            handler,
        }
    }

    #[tokio::test]
    async fn rewrites_flow_in_priority_order() {
        let pipeline = InterceptorPipeline::new();
        pipeline.register(record("low", 0, true, Arc::new(Tag { key: "second" })));
        pipeline.register(record("high", 10, true, Arc::new(Tag { key: "first" })));

        match pipeline.run_incoming(stanza()).await {
            PipelineOutcome::Continue(s) => {
                assert_eq!(s.element().attr("first"), Some("1"));
                assert_eq!(s.element().attr("second"), Some("1"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn interrupt_stops_the_chain() {
        let pipeline = InterceptorPipeline::new();
        pipeline.register(record("blocker", 10, true, Arc::new(Interrupter)));
        pipeline.register(record("later", 0, true, Arc::new(Tag { key: "x" })));

        assert!(matches!(
            pipeline.run_incoming(stanza()).await,
            PipelineOutcome::Interrupted
        ));
    }

    #[tokio::test]
    async fn failure_converts_to_failed_outcome() {
        let pipeline = InterceptorPipeline::new();
        pipeline.register(record("bad", 10, true, Arc::new(Exploder)));
        match pipeline.run_incoming(stanza()).await {
            PipelineOutcome::Failed(s) => assert!(s.is_message()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn chains_are_independent() {
        let pipeline = InterceptorPipeline::new();
        pipeline.register(record("in-only", 0, true, Arc::new(Interrupter)));

        // The outbound chain has no interceptors, so the stanza passes.
        assert!(matches!(
            pipeline.run_outgoing(stanza()).await,
            PipelineOutcome::Continue(_)
        ));
        assert!(matches!(
            pipeline.run_incoming(stanza()).await,
            PipelineOutcome::Interrupted
        ));
    }
}
