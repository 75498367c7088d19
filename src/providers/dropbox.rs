//! Dropbox provider. Items are addressed by path rather than opaque ids.

use std::sync::Arc;

use chrono::DateTime;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::auth::AuthManager;
use crate::error::{Error, Result};
use crate::http_client::{ByteStream, HttpRequest};
use crate::provider::{
    DirectoryItem, FileContent, FileItem, GeneralData, Item, ItemPayload, PageData, Provider,
    ProviderKind, Range, Thumbnail,
};

const ENDPOINT: &str = "https://api.dropboxapi.com/2";
const CONTENT_ENDPOINT: &str = "https://content.dropboxapi.com/2";

pub struct Dropbox {
    auth: Arc<AuthManager>,
}

impl Dropbox {
    pub fn new(auth: Arc<AuthManager>) -> Self {
        Self { auth }
    }

    fn to_item(entry: &Value) -> Result<Item> {
        let id = entry["path_display"]
            .as_str()
            .or_else(|| entry["path_lower"].as_str())
            .ok_or_else(|| Error::parse("dropbox entry missing path"))?
            .to_string();
        let name = entry["name"].as_str().unwrap_or_default().to_string();
        let timestamp = entry["server_modified"]
            .as_str()
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|v| v.to_utc());
        let payload = ItemPayload::Dropbox(entry.clone());
        if entry[".tag"] == "folder" {
            Ok(Item::Directory(DirectoryItem {
                id,
                name,
                timestamp,
                payload,
            }))
        } else {
            let mime_type = mime_guess::from_path(&name)
                .first()
                .map(|m| m.essence_str().to_string());
            Ok(Item::File(FileItem {
                id,
                size: entry["size"].as_u64(),
                timestamp,
                mime_type,
                payload,
                name,
            }))
        }
    }

    /// Metadata-shaped responses come back either bare or under `metadata`.
    fn unwrap_metadata(json: &Value) -> &Value {
        if json["metadata"].is_object() {
            &json["metadata"]
        } else {
            json
        }
    }

    fn parent_path(path: &str) -> &str {
        path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
    }

    async fn rpc(
        &self,
        path: &str,
        body: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.auth
            .fetch_json(
                HttpRequest::post(format!("{ENDPOINT}{path}")).json(&body),
                cancel,
            )
            .await
    }
}

#[async_trait::async_trait]
impl Provider for Dropbox {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Dropbox
    }

    async fn get_root(&self, _cancel: &CancellationToken) -> Result<DirectoryItem> {
        Ok(DirectoryItem {
            id: String::new(),
            name: String::new(),
            timestamp: None,
            payload: ItemPayload::Dropbox(json!({".tag": "folder", "path_display": ""})),
        })
    }

    async fn get_general_data(&self, cancel: &CancellationToken) -> Result<GeneralData> {
        let account = self
            .rpc("/users/get_current_account", Value::Null, cancel)
            .await?;
        let usage = self.rpc("/users/get_space_usage", Value::Null, cancel).await?;
        Ok(GeneralData {
            username: account["email"]
                .as_str()
                .ok_or_else(|| Error::parse("dropbox account missing email"))?
                .to_string(),
            space_used: usage["used"].as_u64(),
            space_total: usage["allocation"]["allocated"].as_u64(),
        })
    }

    async fn list_directory_page(
        &self,
        directory: &DirectoryItem,
        page_token: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<PageData> {
        let json = match page_token {
            Some(cursor) => {
                self.rpc("/files/list_folder/continue", json!({"cursor": cursor}), cancel)
                    .await?
            }
            None => {
                self.rpc("/files/list_folder", json!({"path": directory.id}), cancel)
                    .await?
            }
        };
        let mut page = PageData::default();
        for entry in json["entries"].as_array().into_iter().flatten() {
            page.items.push(Self::to_item(entry)?);
        }
        if json["has_more"].as_bool().unwrap_or(false) {
            page.next_page_token = json["cursor"].as_str().map(str::to_string);
        }
        Ok(page)
    }

    async fn get_file_content(
        &self,
        file: &FileItem,
        range: Range,
        cancel: &CancellationToken,
    ) -> Result<ByteStream> {
        let arg = json!({"path": file.id}).to_string();
        let response = self
            .auth
            .fetch(
                HttpRequest::post(format!("{CONTENT_ENDPOINT}/files/download"))
                    .header("Dropbox-API-Arg", arg)
                    .header("Range", range.to_header()),
                cancel,
            )
            .await?
            .error_for_status()?;
        Ok(response.body)
    }

    async fn create_file(
        &self,
        parent: &DirectoryItem,
        name: &str,
        content: FileContent,
        cancel: &CancellationToken,
    ) -> Result<FileItem> {
        let arg = json!({"path": format!("{}/{name}", parent.id), "mode": "overwrite"});
        let json: Value = self
            .auth
            .fetch(
                HttpRequest::post(format!("{CONTENT_ENDPOINT}/files/upload"))
                    .header("Dropbox-API-Arg", arg.to_string())
                    .header("Content-Type", "application/octet-stream")
                    .stream(content.data),
                cancel,
            )
            .await?
            .error_for_status()?
            .json()
            .await?;
        Self::to_item(Self::unwrap_metadata(&json))?.into_file()
    }

    async fn create_directory(
        &self,
        parent: &DirectoryItem,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<DirectoryItem> {
        let json = self
            .rpc(
                "/files/create_folder_v2",
                json!({"path": format!("{}/{name}", parent.id)}),
                cancel,
            )
            .await?;
        let mut item = Self::to_item(Self::unwrap_metadata(&json))?;
        // create_folder_v2 metadata carries no .tag; force the directory arm.
        if let Item::File(file) = item {
            item = Item::Directory(DirectoryItem {
                id: file.id,
                name: file.name,
                timestamp: file.timestamp,
                payload: file.payload,
            });
        }
        item.into_directory()
    }

    async fn rename_item(
        &self,
        item: &Item,
        new_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Item> {
        let from = item.id();
        let to = format!("{}/{new_name}", Self::parent_path(from));
        let json = self
            .rpc(
                "/files/move_v2",
                json!({"from_path": from, "to_path": to}),
                cancel,
            )
            .await?;
        Self::to_item(Self::unwrap_metadata(&json))
    }

    async fn move_item(
        &self,
        source: &Item,
        destination: &DirectoryItem,
        cancel: &CancellationToken,
    ) -> Result<Item> {
        let to = format!("{}/{}", destination.id, source.name());
        let json = self
            .rpc(
                "/files/move_v2",
                json!({"from_path": source.id(), "to_path": to}),
                cancel,
            )
            .await?;
        Self::to_item(Self::unwrap_metadata(&json))
    }

    async fn remove_item(&self, item: &Item, cancel: &CancellationToken) -> Result<()> {
        self.rpc("/files/delete_v2", json!({"path": item.id()}), cancel)
            .await?;
        Ok(())
    }

    async fn get_item_thumbnail(
        &self,
        file: &FileItem,
        range: Range,
        cancel: &CancellationToken,
    ) -> Result<Thumbnail> {
        let arg = json!({
            "resource": {".tag": "path", "path": file.id},
            "size": {".tag": "w256h256"}
        });
        let response = self
            .auth
            .fetch(
                HttpRequest::post(format!("{CONTENT_ENDPOINT}/files/get_thumbnail_v2"))
                    .header("Dropbox-API-Arg", arg.to_string())
                    .header("Range", range.to_header()),
                cancel,
            )
            .await?
            .error_for_status()?;
        Ok(Thumbnail {
            size: response.content_length(),
            mime_type: "image/jpeg".into(),
            data: response.body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthToken, DiscardTokens};
    use crate::http_client::testing::{MockClient, Scripted};

    fn provider(http: Arc<MockClient>) -> Dropbox {
        Dropbox::new(Arc::new(AuthManager::new(
            http,
            ProviderKind::Dropbox,
            Default::default(),
            AuthToken {
                access_token: "T".into(),
                refresh_token: None,
            },
            Arc::new(DiscardTokens),
        )))
    }

    #[tokio::test]
    async fn listing_chains_cursor_pages() {
        let http = Arc::new(MockClient::new());
        http.push(Scripted::ok(
            serde_json::to_string(&json!({
                "entries": [
                    {".tag": "folder", "name": "docs", "path_display": "/docs"},
                    {".tag": "file", "name": "a.txt", "path_display": "/a.txt",
                     "size": 7, "server_modified": "2024-03-01T10:00:00Z"}
                ],
                "cursor": "c1",
                "has_more": true
            }))
            .unwrap(),
        ));

        let provider = provider(http.clone());
        let root = provider.get_root(&CancellationToken::new()).await.unwrap();
        let page = provider
            .list_directory_page(&root, None, &CancellationToken::new())
            .await
            .expect("page");

        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].id(), "/docs");
        assert_eq!(page.next_page_token.as_deref(), Some("c1"));
        assert!(http.requests()[0].url.ends_with("/files/list_folder"));
    }

    #[tokio::test]
    async fn rename_moves_within_the_parent() {
        let http = Arc::new(MockClient::new());
        http.push(Scripted::ok(
            serde_json::to_string(&json!({
                "metadata": {".tag": "file", "name": "b.txt", "path_display": "/docs/b.txt"}
            }))
            .unwrap(),
        ));

        let provider = provider(http.clone());
        let item = Item::File(FileItem {
            id: "/docs/a.txt".into(),
            name: "a.txt".into(),
            size: None,
            timestamp: None,
            mime_type: None,
            payload: ItemPayload::Dropbox(json!({".tag": "file"})),
        });
        let renamed = provider
            .rename_item(&item, "b.txt", &CancellationToken::new())
            .await
            .expect("rename");
        assert_eq!(renamed.id(), "/docs/b.txt");
        assert_eq!(renamed.name(), "b.txt");
    }

    #[tokio::test]
    async fn download_passes_api_arg_and_range() {
        let http = Arc::new(MockClient::new());
        http.push(Scripted::ok("data"));

        let provider = provider(http.clone());
        let file = FileItem {
            id: "/a.txt".into(),
            name: "a.txt".into(),
            size: Some(7),
            timestamp: None,
            mime_type: None,
            payload: ItemPayload::Dropbox(json!({".tag": "file"})),
        };
        provider
            .get_file_content(
                &file,
                Range {
                    start: 0,
                    end: Some(3),
                },
                &CancellationToken::new(),
            )
            .await
            .expect("content");

        let recorded = &http.requests()[0];
        assert!(recorded.url.ends_with("/files/download"));
        assert_eq!(
            recorded.header("Dropbox-API-Arg"),
            Some(r#"{"path":"/a.txt"}"#)
        );
        assert_eq!(recorded.header("Range"), Some("bytes=0-3"));
    }
}
