//! SQLite backend over sqlx.

use super::{
    BlockListItem, BlockListRepository, CapabilitiesRecord, CapabilitiesRepository, UserRecord,
    UserRepository,
};
use crate::error::StorageError;
use rxmpp_proto::Jid;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::time::Duration;

/// All three repositories over one SQLite pool.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Connection acquire timeout - prevents connection storms from blocking indefinitely.
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Open (creating if missing) and ensure the schema.
    pub async fn new(path: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Self::ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                salt BLOB NOT NULL,
                iterations INTEGER NOT NULL,
                salted_passwords TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blocklist_items (
                username TEXT NOT NULL,
                jid TEXT NOT NULL,
                PRIMARY KEY (username, jid)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS capabilities (
                node TEXT NOT NULL,
                ver TEXT NOT NULL,
                features TEXT NOT NULL,
                PRIMARY KEY (node, ver)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl UserRepository for SqliteStorage {
    async fn upsert_user(&self, user: &UserRecord) -> Result<(), StorageError> {
        let verifiers = serde_json::to_string(&user.salted_passwords)
            .map_err(|e| StorageError::Decode(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO users (username, salt, iterations, salted_passwords)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(username) DO UPDATE SET
                salt = excluded.salt,
                iterations = excluded.iterations,
                salted_passwords = excluded.salted_passwords
            "#,
        )
        .bind(&user.username)
        .bind(&user.salt)
        .bind(user.iterations as i64)
        .bind(verifiers)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_user(&self, username: &str) -> Result<Option<UserRecord>, StorageError> {
        let row = sqlx::query(
            "SELECT username, salt, iterations, salted_passwords FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let verifiers: String = row.get("salted_passwords");
        Ok(Some(UserRecord {
            username: row.get("username"),
            salt: row.get("salt"),
            iterations: row.get::<i64, _>("iterations") as u32,
            salted_passwords: serde_json::from_str(&verifiers)
                .map_err(|e| StorageError::Decode(e.to_string()))?,
        }))
    }

    async fn user_exists(&self, username: &str) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn delete_user(&self, username: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM users WHERE username = ?")
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl BlockListRepository for SqliteStorage {
    async fn fetch_block_list_items(
        &self,
        username: &str,
    ) -> Result<Vec<BlockListItem>, StorageError> {
        let rows = sqlx::query("SELECT jid FROM blocklist_items WHERE username = ?")
            .bind(username)
            .fetch_all(&self.pool)
            .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.get("jid");
            let jid: Jid = raw
                .parse()
                .map_err(|e| StorageError::Decode(format!("stored jid {raw:?}: {e}")))?;
            items.push(BlockListItem {
                username: username.to_string(),
                jid,
            });
        }
        Ok(items)
    }

    async fn upsert_block_list_item(&self, item: &BlockListItem) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO blocklist_items (username, jid) VALUES (?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(&item.username)
        .bind(item.jid.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_block_list_item(&self, item: &BlockListItem) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM blocklist_items WHERE username = ? AND jid = ?")
            .bind(&item.username)
            .bind(item.jid.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_block_list_items(&self, username: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM blocklist_items WHERE username = ?")
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl CapabilitiesRepository for SqliteStorage {
    async fn upsert_capabilities(&self, caps: &CapabilitiesRecord) -> Result<(), StorageError> {
        let features = serde_json::to_string(&caps.features)
            .map_err(|e| StorageError::Decode(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO capabilities (node, ver, features) VALUES (?, ?, ?)
            ON CONFLICT(node, ver) DO UPDATE SET features = excluded.features
            "#,
        )
        .bind(&caps.node)
        .bind(&caps.ver)
        .bind(features)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_capabilities(
        &self,
        node: &str,
        ver: &str,
    ) -> Result<Option<CapabilitiesRecord>, StorageError> {
        let row = sqlx::query("SELECT features FROM capabilities WHERE node = ? AND ver = ?")
            .bind(node)
            .bind(ver)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let features: String = row.get("features");
        Ok(Some(CapabilitiesRecord {
            node: node.to_string(),
            ver: ver.to_string(),
            features: serde_json::from_str(&features)
                .map_err(|e| StorageError::Decode(e.to_string()))?,
        }))
    }

    async fn capabilities_exist(&self, node: &str, ver: &str) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 FROM capabilities WHERE node = ? AND ver = ?")
            .bind(node)
            .bind(ver)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn tmp_store() -> (tempfile::TempDir, SqliteStorage) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = SqliteStorage::new(path.to_str().unwrap()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn users_round_trip() {
        let (_dir, store) = tmp_store().await;
        let user = UserRecord::from_password("alice", "pw", b"salt", 256);
        store.upsert_user(&user).await.unwrap();
        assert_eq!(store.fetch_user("alice").await.unwrap(), Some(user.clone()));

        // Upsert replaces.
        let rotated = UserRecord::from_password("alice", "pw2", b"salt2", 512);
        store.upsert_user(&rotated).await.unwrap();
        assert_eq!(store.fetch_user("alice").await.unwrap(), Some(rotated));
    }

    #[tokio::test]
    async fn blocklist_semantics() {
        let (_dir, store) = tmp_store().await;
        let it = BlockListItem {
            username: "alice".into(),
            jid: "mallory@ev.org".parse().unwrap(),
        };
        store.upsert_block_list_item(&it).await.unwrap();
        store.upsert_block_list_item(&it).await.unwrap();
        assert_eq!(store.fetch_block_list_items("alice").await.unwrap().len(), 1);

        store.delete_block_list_item(&it).await.unwrap();
        store.delete_block_list_item(&it).await.unwrap(); // absent: no-op
        assert!(store.fetch_block_list_items("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn capabilities_round_trip() {
        let (_dir, store) = tmp_store().await;
        let caps = CapabilitiesRecord {
            node: "https://client.example".into(),
            ver: "abc=".into(),
            features: vec!["urn:xmpp:ping".into(), "jabber:iq:version".into()],
        };
        store.upsert_capabilities(&caps).await.unwrap();
        assert_eq!(
            store
                .fetch_capabilities("https://client.example", "abc=")
                .await
                .unwrap(),
            Some(caps)
        );
        assert!(!store.capabilities_exist("x", "y").await.unwrap());
    }
}
