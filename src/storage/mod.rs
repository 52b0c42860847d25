//! Repository layer for persistent models.
//!
//! The routing core holds references to repository abstractions only; the
//! concrete backends here are a reference in-memory store (tests, default)
//! and a SQLite store.
//!
//! - Users: SCRAM verifier material and account existence
//! - Block lists: per-owner blocked JIDs
//! - Capabilities: XEP-0115 feature sets, content-addressed by (node, ver)

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::error::StorageError;
use rxmpp_proto::Jid;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Iteration count used when provisioning new SCRAM verifiers.
pub const DEFAULT_SCRAM_ITERATIONS: u32 = 4096;

/// A stored account: per-mechanism SCRAM verifier material.
///
/// The plaintext password is never stored; each offered mechanism family
/// keeps its own PBKDF2-salted password, all sharing one salt and
/// iteration count.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UserRecord {
    pub username: String,
    pub salt: Vec<u8>,
    pub iterations: u32,
    /// Mechanism name (e.g. `SCRAM-SHA-256`) to salted password.
    pub salted_passwords: BTreeMap<String, Vec<u8>>,
}

impl UserRecord {
    /// Derive verifier material for every supported mechanism family from a
    /// plaintext password. Used by provisioning tools and tests.
    pub fn from_password(username: &str, password: &str, salt: &[u8], iterations: u32) -> Self {
        let mut salted_passwords = BTreeMap::new();

        let mut sha1 = vec![0u8; 20];
        pbkdf2::pbkdf2_hmac::<sha1::Sha1>(password.as_bytes(), salt, iterations, &mut sha1);
        salted_passwords.insert("SCRAM-SHA-1".to_string(), sha1);

        let mut sha256 = vec![0u8; 32];
        pbkdf2::pbkdf2_hmac::<sha2::Sha256>(password.as_bytes(), salt, iterations, &mut sha256);
        salted_passwords.insert("SCRAM-SHA-256".to_string(), sha256);

        let mut sha512 = vec![0u8; 64];
        pbkdf2::pbkdf2_hmac::<sha2::Sha512>(password.as_bytes(), salt, iterations, &mut sha512);
        salted_passwords.insert("SCRAM-SHA-512".to_string(), sha512);

        let mut sha3_512 = vec![0u8; 64];
        pbkdf2::pbkdf2_hmac::<sha3::Sha3_512>(password.as_bytes(), salt, iterations, &mut sha3_512);
        salted_passwords.insert("SCRAM-SHA3-512".to_string(), sha3_512);

        Self {
            username: username.to_string(),
            salt: salt.to_vec(),
            iterations,
            salted_passwords,
        }
    }

    /// The salted password for a mechanism, if provisioned.
    pub fn salted_password(&self, mechanism: &str) -> Option<&[u8]> {
        self.salted_passwords.get(mechanism).map(Vec::as_slice)
    }
}

/// One block-list entry: `owner` refuses traffic from `jid`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockListItem {
    pub username: String,
    pub jid: Jid,
}

/// A XEP-0115 capabilities record, content-addressed by `(node, ver)`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CapabilitiesRecord {
    pub node: String,
    pub ver: String,
    pub features: Vec<String>,
}

/// Account repository.
#[async_trait::async_trait]
pub trait UserRepository: Send + Sync {
    async fn upsert_user(&self, user: &UserRecord) -> Result<(), StorageError>;
    async fn fetch_user(&self, username: &str) -> Result<Option<UserRecord>, StorageError>;
    async fn user_exists(&self, username: &str) -> Result<bool, StorageError>;
    async fn delete_user(&self, username: &str) -> Result<(), StorageError>;
}

/// Block-list repository. Upserts are idempotent; deleting an absent item
/// is a successful no-op.
#[async_trait::async_trait]
pub trait BlockListRepository: Send + Sync {
    async fn fetch_block_list_items(
        &self,
        username: &str,
    ) -> Result<Vec<BlockListItem>, StorageError>;
    async fn upsert_block_list_item(&self, item: &BlockListItem) -> Result<(), StorageError>;
    async fn delete_block_list_item(&self, item: &BlockListItem) -> Result<(), StorageError>;
    async fn delete_block_list_items(&self, username: &str) -> Result<(), StorageError>;
}

/// Capabilities repository.
#[async_trait::async_trait]
pub trait CapabilitiesRepository: Send + Sync {
    async fn upsert_capabilities(&self, caps: &CapabilitiesRecord) -> Result<(), StorageError>;
    async fn fetch_capabilities(
        &self,
        node: &str,
        ver: &str,
    ) -> Result<Option<CapabilitiesRecord>, StorageError>;
    async fn capabilities_exist(&self, node: &str, ver: &str) -> Result<bool, StorageError>;
}

/// Handle bundling the three repositories behind one clone-cheap facade.
#[derive(Clone)]
pub struct Storage {
    pub users: Arc<dyn UserRepository>,
    pub blocklist: Arc<dyn BlockListRepository>,
    pub capabilities: Arc<dyn CapabilitiesRepository>,
}

impl Storage {
    /// The in-memory reference backend.
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStorage::new());
        Self {
            users: store.clone(),
            blocklist: store.clone(),
            capabilities: store,
        }
    }

    /// The SQLite backend, creating the schema when missing.
    pub async fn sqlite(path: &str) -> Result<Self, StorageError> {
        let store = Arc::new(SqliteStorage::new(path).await?);
        Ok(Self {
            users: store.clone(),
            blocklist: store.clone(),
            capabilities: store,
        })
    }
}
