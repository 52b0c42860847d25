//! SASL authentication.
//!
//! The stream state machine owns no credentials: it drives an
//! [`Authenticator`] that negotiates a mechanism-specific session. The
//! in-tree authenticator offers the SCRAM families selected in `[sasl]`
//! and verifies against the user repository's stored verifier material.

mod scram;

pub use scram::ScramSession;

use crate::config::SaslMechanismName;
use crate::error::SaslError;
use crate::storage::UserRepository;
use std::sync::Arc;

/// Outcome of one SASL round trip.
#[derive(Debug)]
pub enum SaslStep {
    /// Send this challenge and wait for the next client response.
    Challenge(Vec<u8>),
    /// Authentication succeeded.
    Success {
        /// The authenticated local username.
        username: String,
        /// Optional additional data carried in `<success/>`.
        data: Option<Vec<u8>>,
    },
}

/// One in-flight mechanism negotiation.
#[async_trait::async_trait]
pub trait SaslSession: Send + Sync {
    /// Feed the next client message (already base64-decoded).
    async fn step(&mut self, input: &[u8]) -> Result<SaslStep, SaslError>;
}

/// Issues SASL sessions for the mechanisms a stream may offer.
#[async_trait::async_trait]
pub trait Authenticator: Send + Sync {
    /// Mechanism names for the stream features advertisement, preferred
    /// first.
    fn mechanisms(&self) -> Vec<&'static str>;

    /// Begin a session for `mechanism`.
    fn start_session(&self, mechanism: &str) -> Result<Box<dyn SaslSession>, SaslError>;
}

/// The SCRAM-family authenticator backed by the user repository.
pub struct ScramAuthenticator {
    users: Arc<dyn UserRepository>,
    offered: Vec<SaslMechanismName>,
}

impl ScramAuthenticator {
    pub fn new(users: Arc<dyn UserRepository>, offered: Vec<SaslMechanismName>) -> Self {
        Self { users, offered }
    }
}

#[async_trait::async_trait]
impl Authenticator for ScramAuthenticator {
    fn mechanisms(&self) -> Vec<&'static str> {
        self.offered.iter().map(|m| m.as_str()).collect()
    }

    fn start_session(&self, mechanism: &str) -> Result<Box<dyn SaslSession>, SaslError> {
        let known = self
            .offered
            .iter()
            .any(|m| m.as_str().eq_ignore_ascii_case(mechanism));
        if !known {
            return Err(SaslError::InvalidMechanism);
        }
        Ok(Box::new(ScramSession::for_mechanism(
            mechanism,
            Arc::clone(&self.users),
        )?))
    }
}
