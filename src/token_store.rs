//! Persisted auth tokens: one JSON settings document, edited atomically.
//!
//! The document has the shape `{ "auth_token": [ {"type": ..., "id": ...,
//! ...provider fields} ] }`. `save` does a read-modify-write matching on
//! `(type, id)`; `remove` filters the entry out and deletes the file (and an
//! empty parent directory) when the list becomes empty.

use std::path::PathBuf;

use serde_json::{Value, json};
use tokio::fs;
use tracing::warn;

use crate::atomic::AtomicFile;
use crate::auth::AuthToken;
use crate::error::{Error, Result};
use crate::provider::ProviderKind;

/// One entry loaded from the settings file.
#[derive(Clone, Debug)]
pub struct StoredToken {
    pub kind: ProviderKind,
    pub id: String,
    pub token: AuthToken,
}

pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn read_document(&self) -> Value {
        match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!(error = %err, "settings file is malformed, starting empty");
                json!({})
            }),
            Err(_) => json!({}),
        }
    }

    async fn write_document(&self, document: &Value) -> Result<()> {
        let mut atomic = AtomicFile::new(&self.path).await?;
        let rendered = serde_json::to_vec_pretty(document)?;
        if let Err(err) = atomic.write_all(&rendered).await {
            atomic.cleanup().await;
            return Err(Error::from(err));
        }
        atomic.finalize().await?;
        Ok(())
    }

    /// All recognisable entries; malformed ones are skipped.
    pub async fn load(&self) -> Vec<StoredToken> {
        let document = self.read_document().await;
        let Some(entries) = document["auth_token"].as_array() else {
            return Vec::new();
        };
        entries
            .iter()
            .filter_map(|entry| {
                let kind = ProviderKind::from_id(entry["type"].as_str()?)?;
                let id = entry["id"].as_str()?.to_string();
                let token = AuthToken {
                    access_token: entry["access_token"].as_str()?.to_string(),
                    refresh_token: entry["refresh_token"].as_str().map(str::to_string),
                };
                Some(StoredToken { kind, id, token })
            })
            .collect()
    }

    /// Match-or-append by `(type, id)`.
    pub async fn save(&self, kind: ProviderKind, id: &str, token: &AuthToken) -> Result<()> {
        let mut document = self.read_document().await;
        let mut entry = serde_json::to_value(token)?;
        entry["type"] = json!(kind.id());
        entry["id"] = json!(id);

        let entries = document["auth_token"]
            .as_array_mut()
            .map(std::mem::take)
            .unwrap_or_default();
        let mut replaced = false;
        let mut result: Vec<Value> = entries
            .into_iter()
            .map(|existing| {
                if existing["type"] == kind.id() && existing["id"] == id {
                    replaced = true;
                    entry.clone()
                } else {
                    existing
                }
            })
            .collect();
        if !replaced {
            result.push(entry);
        }
        document["auth_token"] = Value::Array(result);
        self.write_document(&document).await
    }

    /// Filter out the entry; delete the file and an empty parent directory
    /// when nothing remains.
    pub async fn remove(&self, kind: ProviderKind, id: &str) -> Result<()> {
        let mut document = self.read_document().await;
        let entries = document["auth_token"]
            .as_array_mut()
            .map(std::mem::take)
            .unwrap_or_default();
        let remaining: Vec<Value> = entries
            .into_iter()
            .filter(|entry| !(entry["type"] == kind.id() && entry["id"] == id))
            .collect();

        if remaining.is_empty() {
            let _ = fs::remove_file(&self.path).await;
            if let Some(parent) = self.path.parent() {
                // Succeeds only when the directory is empty.
                let _ = fs::remove_dir(parent).await;
            }
            return Ok(());
        }
        document["auth_token"] = Value::Array(remaining);
        self.write_document(&document).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn token(access: &str) -> AuthToken {
        AuthToken {
            access_token: access.into(),
            refresh_token: Some("refresh".into()),
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let temp = tempdir().expect("tempdir");
        let store = TokenStore::new(temp.path().join("settings.json"));

        store
            .save(ProviderKind::GoogleDrive, "alice@example.com", &token("A"))
            .await
            .expect("save");
        store
            .save(ProviderKind::Box, "bob", &token("B"))
            .await
            .expect("save");

        let loaded = store.load().await;
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().any(|t| {
            t.kind == ProviderKind::GoogleDrive
                && t.id == "alice@example.com"
                && t.token.access_token == "A"
        }));
    }

    #[tokio::test]
    async fn save_replaces_matching_entry() {
        let temp = tempdir().expect("tempdir");
        let store = TokenStore::new(temp.path().join("settings.json"));

        store
            .save(ProviderKind::Box, "bob", &token("old"))
            .await
            .expect("save");
        store
            .save(ProviderKind::Box, "bob", &token("new"))
            .await
            .expect("save");

        let loaded = store.load().await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].token.access_token, "new");
    }

    #[tokio::test]
    async fn remove_deletes_empty_file_and_directory() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().join("nested");
        let path = dir.join("settings.json");
        let store = TokenStore::new(path.clone());

        store
            .save(ProviderKind::Box, "bob", &token("A"))
            .await
            .expect("save");
        store
            .remove(ProviderKind::Box, "bob")
            .await
            .expect("remove");

        assert!(store.load().await.is_empty());
        assert!(!path.exists());
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn remove_keeps_other_entries() {
        let temp = tempdir().expect("tempdir");
        let store = TokenStore::new(temp.path().join("settings.json"));

        store
            .save(ProviderKind::Box, "bob", &token("A"))
            .await
            .expect("save");
        store
            .save(ProviderKind::Dropbox, "bob", &token("B"))
            .await
            .expect("save");
        store
            .remove(ProviderKind::Box, "bob")
            .await
            .expect("remove");

        let loaded = store.load().await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].kind, ProviderKind::Dropbox);
    }

    #[tokio::test]
    async fn malformed_entries_are_skipped() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("settings.json");
        tokio::fs::write(
            &path,
            serde_json::to_vec(&serde_json::json!({
                "auth_token": [
                    {"type": "box", "id": "bob", "access_token": "A"},
                    {"type": "unknown-provider", "id": "x", "access_token": "B"},
                    {"type": "dropbox"}
                ]
            }))
            .expect("render"),
        )
        .await
        .expect("seed");

        let store = TokenStore::new(path);
        let loaded = store.load().await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "bob");
    }
}
