//! Minimal SCRAM-SHA-256 client for driving the real authenticator.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

pub struct ScramClient {
    username: String,
    password: String,
    nonce: String,
}

impl ScramClient {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            nonce: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    /// The client-first message (no channel binding).
    pub fn first(&self) -> String {
        format!("n,,n={},r={}", self.username, self.nonce)
    }

    /// Build client-final from the server-first challenge.
    pub fn final_message(&self, server_first: &str) -> String {
        let combined = attribute(server_first, 'r').expect("server nonce");
        assert!(
            combined.starts_with(&self.nonce),
            "server must extend the client nonce"
        );
        let salt = BASE64
            .decode(attribute(server_first, 's').expect("salt"))
            .expect("valid salt");
        let iterations: u32 = attribute(server_first, 'i')
            .expect("iterations")
            .parse()
            .expect("numeric iterations");

        let mut salted = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(self.password.as_bytes(), &salt, iterations, &mut salted);

        let client_key = hmac(&salted, b"Client Key");
        let stored_key = Sha256::digest(&client_key);
        let without_proof = format!("c=biws,r={combined}");
        let auth_message = format!("{},{},{}", self.first_bare(), server_first, without_proof);
        let signature = hmac(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();
        format!("{without_proof},p={}", BASE64.encode(proof))
    }

    fn first_bare(&self) -> String {
        format!("n={},r={}", self.username, self.nonce)
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

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
