//! Server-side SCRAM (RFC 5802) over the four offered hash families.

use super::{SaslSession, SaslStep};
use crate::error::SaslError;
use crate::storage::UserRepository;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Digest;
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Server nonce length in bytes.
const SCRAM_NONCE_LEN: usize = 24;

/// Hash-family operations a SCRAM exchange needs. One concrete impl per
/// offered mechanism keeps the session object-safe.
trait ScramHash: Send + Sync {
    fn digest(&self, data: &[u8]) -> Vec<u8>;
    fn hmac(&self, key: &[u8], data: &[u8]) -> Vec<u8>;
}

macro_rules! scram_hash_impl {
    ($name:ident, $digest:ty) => {
        struct $name;

        impl ScramHash for $name {
            fn digest(&self, data: &[u8]) -> Vec<u8> {
                <$digest>::digest(data).to_vec()
            }

            fn hmac(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
                let mut mac = <Hmac<$digest> as Mac>::new_from_slice(key)
                    .expect("hmac accepts any key length");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    };
}

scram_hash_impl!(ScramSha1, sha1::Sha1);
scram_hash_impl!(ScramSha256, sha2::Sha256);
scram_hash_impl!(ScramSha512, sha2::Sha512);
scram_hash_impl!(ScramSha3_512, sha3::Sha3_512);

enum State {
    /// Waiting for client-first.
    Initial,
    /// Sent server-first, waiting for client-final.
    Challenged {
        username: String,
        salted_password: Vec<u8>,
        combined_nonce: String,
        auth_message_prefix: String,
    },
    Done,
}

/// One SCRAM negotiation.
pub struct ScramSession {
    mechanism: &'static str,
    hash: Box<dyn ScramHash>,
    users: Arc<dyn UserRepository>,
    state: State,
}

impl ScramSession {
    /// Build a session for a mechanism name already vetted by the
    /// authenticator.
    pub(super) fn for_mechanism(
        mechanism: &str,
        users: Arc<dyn UserRepository>,
    ) -> Result<Self, SaslError> {
        let (mechanism, hash): (&'static str, Box<dyn ScramHash>) =
            match mechanism.to_ascii_uppercase().as_str() {
                "SCRAM-SHA-1" => ("SCRAM-SHA-1", Box::new(ScramSha1)),
                "SCRAM-SHA-256" => ("SCRAM-SHA-256", Box::new(ScramSha256)),
                "SCRAM-SHA-512" => ("SCRAM-SHA-512", Box::new(ScramSha512)),
                "SCRAM-SHA3-512" => ("SCRAM-SHA3-512", Box::new(ScramSha3_512)),
                _ => return Err(SaslError::InvalidMechanism),
            };
        Ok(Self {
            mechanism,
            hash,
            users,
            state: State::Initial,
        })
    }

    async fn client_first(&mut self, input: &[u8]) -> Result<SaslStep, SaslError> {
        let client_first =
            std::str::from_utf8(input).map_err(|_| SaslError::MalformedRequest)?;

        // gs2 header: we offer no channel binding, so only "n" and "y" fly.
        let mut parts = client_first.splitn(3, ',');
        match parts.next() {
            Some("n") | Some("y") => {}
            _ => return Err(SaslError::MalformedRequest),
        }
        let _authzid = parts.next().ok_or(SaslError::MalformedRequest)?;
        let bare = parts.next().ok_or(SaslError::MalformedRequest)?;

        let username = attribute(bare, 'n')
            .map(unescape_username)
            .ok_or(SaslError::MalformedRequest)?;
        let client_nonce = attribute(bare, 'r').ok_or(SaslError::MalformedRequest)?;

        let user = self
            .users
            .fetch_user(&username)
            .await
            .map_err(|_| SaslError::TemporaryFailure)?
            .ok_or(SaslError::AccountUnknown)?;
        let salted_password = user
            .salted_password(self.mechanism)
            .ok_or(SaslError::AccountUnknown)?
            .to_vec();

        let combined_nonce = format!("{}{}", client_nonce, generate_server_nonce());
        let server_first = format!(
            "r={},s={},i={}",
            combined_nonce,
            BASE64.encode(&user.salt),
            user.iterations
        );
        let auth_message_prefix = format!("{},{}", bare, server_first);

        self.state = State::Challenged {
            username,
            salted_password,
            combined_nonce,
            auth_message_prefix,
        };
        Ok(SaslStep::Challenge(server_first.into_bytes()))
    }

    fn client_final(
        &self,
        input: &[u8],
        username: &str,
        salted_password: &[u8],
        combined_nonce: &str,
        auth_message_prefix: &str,
    ) -> Result<SaslStep, SaslError> {
        let client_final =
            std::str::from_utf8(input).map_err(|_| SaslError::MalformedRequest)?;

        let final_nonce = attribute(client_final, 'r').ok_or(SaslError::MalformedRequest)?;
        if final_nonce != combined_nonce {
            return Err(SaslError::NotAuthorized);
        }
        let proof_b64 = attribute(client_final, 'p').ok_or(SaslError::MalformedRequest)?;
        let client_proof = BASE64
            .decode(proof_b64)
            .map_err(|_| SaslError::MalformedRequest)?;

        let without_proof = client_final
            .rsplit_once(",p=")
            .map(|(head, _)| head)
            .ok_or(SaslError::MalformedRequest)?;
        let auth_message = format!("{},{}", auth_message_prefix, without_proof);

        let client_key = self.hash.hmac(salted_password, b"Client Key");
        let stored_key = self.hash.digest(&client_key);
        let client_signature = self.hash.hmac(&stored_key, auth_message.as_bytes());
        let expected_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let authenticated: bool = expected_proof.ct_eq(&client_proof).into();
        if !authenticated {
            return Err(SaslError::NotAuthorized);
        }

        let server_key = self.hash.hmac(salted_password, b"Server Key");
        let server_signature = self.hash.hmac(&server_key, auth_message.as_bytes());
        let verifier = format!("v={}", BASE64.encode(server_signature));
        Ok(SaslStep::Success {
            username: username.to_string(),
            data: Some(verifier.into_bytes()),
        })
    }
}

#[async_trait::async_trait]
impl SaslSession for ScramSession {
    async fn step(&mut self, input: &[u8]) -> Result<SaslStep, SaslError> {
        if input == b"*" {
            self.state = State::Done;
            return Err(SaslError::Aborted);
        }
        match std::mem::replace(&mut self.state, State::Done) {
            State::Initial => self.client_first(input).await,
            State::Challenged {
                username,
                salted_password,
                combined_nonce,
                auth_message_prefix,
            } => self.client_final(
                input,
                &username,
                &salted_password,
                &combined_nonce,
                &auth_message_prefix,
            ),
            State::Done => Err(SaslError::MalformedRequest),
        }
    }
}

/// Generate a random server nonce component.
fn generate_server_nonce() -> String {
    let mut nonce = [0u8; SCRAM_NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    BASE64.encode(nonce)
}

/// Extract `<key>=` from a comma-separated SCRAM message.
fn attribute(message: &str, key: char) -> Option<&str> {
    message.split(',').find_map(|field| {
        let mut chars = field.chars();
        if chars.next() == Some(key) && chars.next() == Some('=') {
            Some(&field[2..])
        } else {
            None
        }
    })
}

fn unescape_username(s: &str) -> String {
    s.replace("=2C", ",").replace("=3D", "=")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, UserRecord};

    /// Client-side SCRAM driver over the same primitives, used to exercise
    /// the server end to end.
    struct TestClient {
        username: String,
        password: String,
        nonce: String,
    }

    impl TestClient {
        fn first(&self) -> String {
            format!("n,,n={},r={}", self.username, self.nonce)
        }

        fn final_message(&self, hash: &dyn ScramHash, server_first: &str) -> (String, Vec<u8>) {
            let combined = attribute(server_first, 'r').unwrap();
            let salt = BASE64.decode(attribute(server_first, 's').unwrap()).unwrap();
            let iterations: u32 = attribute(server_first, 'i').unwrap().parse().unwrap();

            let mut salted = vec![0u8; hash.digest(b"").len()];
            match salted.len() {
                20 => pbkdf2::pbkdf2_hmac::<sha1::Sha1>(
                    self.password.as_bytes(),
                    &salt,
                    iterations,
                    &mut salted,
                ),
                32 => pbkdf2::pbkdf2_hmac::<sha2::Sha256>(
                    self.password.as_bytes(),
                    &salt,
                    iterations,
                    &mut salted,
                ),
                _ => unreachable!("test covers sha1/sha256"),
            }

            let client_key = hash.hmac(&salted, b"Client Key");
            let stored_key = hash.digest(&client_key);
            let client_first_bare = format!("n={},r={}", self.username, self.nonce);
            let without_proof = format!("c=biws,r={combined}");
            let auth_message =
                format!("{client_first_bare},{server_first},{without_proof}");
            let signature = hash.hmac(&stored_key, auth_message.as_bytes());
            let proof: Vec<u8> = client_key
                .iter()
                .zip(signature.iter())
                .map(|(k, s)| k ^ s)
                .collect();

            let server_key = hash.hmac(&salted, b"Server Key");
            let expected_server_sig = hash.hmac(&server_key, auth_message.as_bytes());
            (
                format!("{without_proof},p={}", BASE64.encode(proof)),
                expected_server_sig,
            )
        }
    }

    async fn store_with_alice() -> Arc<MemoryStorage> {
        let store = Arc::new(MemoryStorage::new());
        let user = UserRecord::from_password("alice", "wonderland", b"salty", 1024);
        crate::storage::UserRepository::upsert_user(store.as_ref(), &user)
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn full_exchange_succeeds_sha256() {
        let store = store_with_alice().await;
        let mut session = ScramSession::for_mechanism("SCRAM-SHA-256", store).unwrap();
        let client = TestClient {
            username: "alice".into(),
            password: "wonderland".into(),
            nonce: "clientnonce".into(),
        };

        let server_first = match session.step(client.first().as_bytes()).await.unwrap() {
            SaslStep::Challenge(c) => String::from_utf8(c).unwrap(),
            other => panic!("expected challenge, got {other:?}"),
        };
        assert!(server_first.starts_with("r=clientnonce"));

        let (client_final, expected_sig) =
            client.final_message(&ScramSha256, &server_first);
        match session.step(client_final.as_bytes()).await.unwrap() {
            SaslStep::Success { username, data } => {
                assert_eq!(username, "alice");
                let verifier = String::from_utf8(data.unwrap()).unwrap();
                assert_eq!(verifier, format!("v={}", BASE64.encode(expected_sig)));
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_exchange_succeeds_sha1() {
        let store = store_with_alice().await;
        let mut session = ScramSession::for_mechanism("SCRAM-SHA-1", store).unwrap();
        let client = TestClient {
            username: "alice".into(),
            password: "wonderland".into(),
            nonce: "n1".into(),
        };
        let server_first = match session.step(client.first().as_bytes()).await.unwrap() {
            SaslStep::Challenge(c) => String::from_utf8(c).unwrap(),
            other => panic!("expected challenge, got {other:?}"),
        };
        let (client_final, _) = client.final_message(&ScramSha1, &server_first);
        assert!(matches!(
            session.step(client_final.as_bytes()).await,
            Ok(SaslStep::Success { .. })
        ));
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let store = store_with_alice().await;
        let mut session = ScramSession::for_mechanism("SCRAM-SHA-256", store).unwrap();
        let client = TestClient {
            username: "alice".into(),
            password: "not-wonderland".into(),
            nonce: "n2".into(),
        };
        let server_first = match session.step(client.first().as_bytes()).await.unwrap() {
            SaslStep::Challenge(c) => String::from_utf8(c).unwrap(),
            other => panic!("expected challenge, got {other:?}"),
        };
        let (client_final, _) = client.final_message(&ScramSha256, &server_first);
        assert_eq!(
            session.step(client_final.as_bytes()).await.unwrap_err(),
            SaslError::NotAuthorized
        );
    }

    #[tokio::test]
    async fn unknown_user_maps_to_not_authorized_condition() {
        let store = Arc::new(MemoryStorage::new());
        let mut session = ScramSession::for_mechanism("SCRAM-SHA-256", store).unwrap();
        let err = session.step(b"n,,n=ghost,r=abc").await.unwrap_err();
        assert_eq!(err, SaslError::AccountUnknown);
        assert_eq!(err.condition(), "not-authorized");
    }

    #[tokio::test]
    async fn nonce_tampering_is_rejected() {
        let store = store_with_alice().await;
        let mut session = ScramSession::for_mechanism("SCRAM-SHA-256", store).unwrap();
        session.step(b"n,,n=alice,r=abc").await.unwrap();
        let err = session
            .step(b"c=biws,r=evil-nonce,p=AAAA")
            .await
            .unwrap_err();
        assert_eq!(err, SaslError::NotAuthorized);
    }

    #[tokio::test]
    async fn abort_token_aborts() {
        let store = store_with_alice().await;
        let mut session = ScramSession::for_mechanism("SCRAM-SHA-256", store).unwrap();
        assert_eq!(session.step(b"*").await.unwrap_err(), SaslError::Aborted);
    }

    #[test]
    fn username_unescaping() {
        assert_eq!(unescape_username("a=2Cb=3Dc"), "a,b=c");
    }
}
