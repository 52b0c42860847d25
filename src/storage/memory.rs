//! In-memory reference backend.
//!
//! Backs single-node deployments without persistence and every test suite.

use super::{
    BlockListItem, BlockListRepository, CapabilitiesRecord, CapabilitiesRepository, UserRecord,
    UserRepository,
};
use crate::error::StorageError;
use dashmap::DashMap;

/// All three repositories over process-local maps.
#[derive(Default)]
pub struct MemoryStorage {
    users: DashMap<String, UserRecord>,
    blocklist: DashMap<String, Vec<BlockListItem>>,
    capabilities: DashMap<(String, String), CapabilitiesRecord>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl UserRepository for MemoryStorage {
    async fn upsert_user(&self, user: &UserRecord) -> Result<(), StorageError> {
        self.users.insert(user.username.clone(), user.clone());
        Ok(())
    }

    async fn fetch_user(&self, username: &str) -> Result<Option<UserRecord>, StorageError> {
        Ok(self.users.get(username).map(|u| u.clone()))
    }

    async fn user_exists(&self, username: &str) -> Result<bool, StorageError> {
        Ok(self.users.contains_key(username))
    }

    async fn delete_user(&self, username: &str) -> Result<(), StorageError> {
        self.users.remove(username);
        Ok(())
    }
}

#[async_trait::async_trait]
impl BlockListRepository for MemoryStorage {
    async fn fetch_block_list_items(
        &self,
        username: &str,
    ) -> Result<Vec<BlockListItem>, StorageError> {
        Ok(self
            .blocklist
            .get(username)
            .map(|items| items.clone())
            .unwrap_or_default())
    }

    async fn upsert_block_list_item(&self, item: &BlockListItem) -> Result<(), StorageError> {
        let mut items = self.blocklist.entry(item.username.clone()).or_default();
        if !items.iter().any(|i| i.jid == item.jid) {
            items.push(item.clone());
        }
        Ok(())
    }

    async fn delete_block_list_item(&self, item: &BlockListItem) -> Result<(), StorageError> {
        if let Some(mut items) = self.blocklist.get_mut(&item.username) {
            items.retain(|i| i.jid != item.jid);
        }
        Ok(())
    }

    async fn delete_block_list_items(&self, username: &str) -> Result<(), StorageError> {
        self.blocklist.remove(username);
        Ok(())
    }
}

#[async_trait::async_trait]
impl CapabilitiesRepository for MemoryStorage {
    async fn upsert_capabilities(&self, caps: &CapabilitiesRecord) -> Result<(), StorageError> {
        self.capabilities
            .insert((caps.node.clone(), caps.ver.clone()), caps.clone());
        Ok(())
    }

    async fn fetch_capabilities(
        &self,
        node: &str,
        ver: &str,
    ) -> Result<Option<CapabilitiesRecord>, StorageError> {
        Ok(self
            .capabilities
            .get(&(node.to_string(), ver.to_string()))
            .map(|c| c.clone()))
    }

    async fn capabilities_exist(&self, node: &str, ver: &str) -> Result<bool, StorageError> {
        Ok(self
            .capabilities
            .contains_key(&(node.to_string(), ver.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(owner: &str, jid: &str) -> BlockListItem {
        BlockListItem {
            username: owner.into(),
            jid: jid.parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn users_round_trip() {
        let store = MemoryStorage::new();
        let user = UserRecord::from_password("alice", "pw", b"salt", 256);
        store.upsert_user(&user).await.unwrap();
        assert!(store.user_exists("alice").await.unwrap());
        assert_eq!(store.fetch_user("alice").await.unwrap(), Some(user));
        store.delete_user("alice").await.unwrap();
        assert!(!store.user_exists("alice").await.unwrap());
    }

    #[tokio::test]
    async fn blocklist_upsert_is_idempotent() {
        let store = MemoryStorage::new();
        let it = item("alice", "mallory@ev.org");
        store.upsert_block_list_item(&it).await.unwrap();
        store.upsert_block_list_item(&it).await.unwrap();
        assert_eq!(store.fetch_block_list_items("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn blocklist_delete_absent_is_noop() {
        let store = MemoryStorage::new();
        store
            .delete_block_list_item(&item("alice", "nobody@ev.org"))
            .await
            .unwrap();
        assert!(store.fetch_block_list_items("alice").await.unwrap().is_empty());

        store.upsert_block_list_item(&item("alice", "a@ev.org")).await.unwrap();
        store.upsert_block_list_item(&item("alice", "b@ev.org")).await.unwrap();
        store.delete_block_list_item(&item("alice", "a@ev.org")).await.unwrap();
        let left = store.fetch_block_list_items("alice").await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].jid.to_string(), "b@ev.org");

        store.delete_block_list_items("alice").await.unwrap();
        assert!(store.fetch_block_list_items("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn capabilities_are_content_addressed() {
        let store = MemoryStorage::new();
        let caps = CapabilitiesRecord {
            node: "https://client.example".into(),
            ver: "abc=".into(),
            features: vec!["urn:xmpp:ping".into()],
        };
        store.upsert_capabilities(&caps).await.unwrap();
        assert!(store.capabilities_exist("https://client.example", "abc=").await.unwrap());
        assert!(!store.capabilities_exist("https://client.example", "zzz=").await.unwrap());
        assert_eq!(
            store
                .fetch_capabilities("https://client.example", "abc=")
                .await
                .unwrap(),
            Some(caps)
        );
    }
}
