//! OneDrive provider, backed by the Microsoft Graph drive API.

use std::sync::Arc;

use chrono::DateTime;
use http::Method;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::auth::AuthManager;
use crate::error::{Error, Result};
use crate::http_client::{ByteStream, HttpRequest};
use crate::provider::{
    DirectoryItem, FileContent, FileItem, GeneralData, Item, ItemPayload, PageData, Provider,
    ProviderKind, Range, Thumbnail,
};

const ENDPOINT: &str = "https://graph.microsoft.com/v1.0";

pub struct OneDrive {
    auth: Arc<AuthManager>,
}

impl OneDrive {
    pub fn new(auth: Arc<AuthManager>) -> Self {
        Self { auth }
    }

    /// `root` is a Graph path alias, everything else an item id.
    fn item_url(id: &str, suffix: &str) -> String {
        if id == "root" {
            format!("{ENDPOINT}/me/drive/root{suffix}")
        } else {
            format!("{ENDPOINT}/me/drive/items/{id}{suffix}")
        }
    }

    fn to_item(entry: &Value) -> Result<Item> {
        let id = entry["id"]
            .as_str()
            .ok_or_else(|| Error::parse("graph item missing id"))?
            .to_string();
        let name = entry["name"].as_str().unwrap_or_default().to_string();
        let timestamp = entry["lastModifiedDateTime"]
            .as_str()
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|v| v.to_utc());
        let payload = ItemPayload::OneDrive(entry.clone());
        if entry["folder"].is_object() {
            Ok(Item::Directory(DirectoryItem {
                id,
                name,
                timestamp,
                payload,
            }))
        } else {
            Ok(Item::File(FileItem {
                id,
                name,
                size: entry["size"].as_u64(),
                timestamp,
                mime_type: entry["file"]["mimeType"].as_str().map(str::to_string),
                payload,
            }))
        }
    }
}

#[async_trait::async_trait]
impl Provider for OneDrive {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OneDrive
    }

    async fn get_root(&self, _cancel: &CancellationToken) -> Result<DirectoryItem> {
        Ok(DirectoryItem {
            id: "root".into(),
            name: String::new(),
            timestamp: None,
            payload: ItemPayload::OneDrive(json!({"id": "root", "folder": {}})),
        })
    }

    async fn get_general_data(&self, cancel: &CancellationToken) -> Result<GeneralData> {
        let me = self
            .auth
            .fetch_json(HttpRequest::get(format!("{ENDPOINT}/me")), cancel)
            .await?;
        let drive = self
            .auth
            .fetch_json(HttpRequest::get(format!("{ENDPOINT}/me/drive")), cancel)
            .await?;
        Ok(GeneralData {
            username: me["userPrincipalName"]
                .as_str()
                .ok_or_else(|| Error::parse("graph user missing userPrincipalName"))?
                .to_string(),
            space_used: drive["quota"]["used"].as_u64(),
            space_total: drive["quota"]["total"].as_u64(),
        })
    }

    async fn list_directory_page(
        &self,
        directory: &DirectoryItem,
        page_token: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<PageData> {
        // The continuation token is the full @odata.nextLink URL.
        let url = match page_token {
            Some(next_link) => next_link,
            None => Self::item_url(&directory.id, "/children?$top=200"),
        };
        let json = self.auth.fetch_json(HttpRequest::get(url), cancel).await?;

        let mut page = PageData::default();
        for entry in json["value"].as_array().into_iter().flatten() {
            page.items.push(Self::to_item(entry)?);
        }
        page.next_page_token = json["@odata.nextLink"].as_str().map(str::to_string);
        Ok(page)
    }

    async fn get_file_content(
        &self,
        file: &FileItem,
        range: Range,
        cancel: &CancellationToken,
    ) -> Result<ByteStream> {
        // Graph answers with a 302 to a pre-signed URL; the HTTP client
        // re-applies the Range header on every hop.
        let response = self
            .auth
            .fetch(
                HttpRequest::get(Self::item_url(&file.id, "/content"))
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
        let session_url = Self::item_url(&parent.id, &format!(":/{name}:/createUploadSession"));
        let session = self
            .auth
            .fetch_json(HttpRequest::post(session_url).json(&json!({})), cancel)
            .await?;
        let upload_url = session["uploadUrl"]
            .as_str()
            .ok_or_else(|| Error::parse("upload session missing uploadUrl"))?
            .to_string();

        let mut request = HttpRequest::new(Method::PUT, upload_url).stream(content.data);
        if let Some(size) = content.size {
            request = request
                .header("Content-Length", size.to_string())
                .header("Content-Range", format!("bytes 0-{}/{size}", size.saturating_sub(1)));
        }
        let json: Value = self
            .auth
            .http()
            .fetch(request, cancel)
            .await?
            .error_for_status()?
            .json()
            .await?;
        Self::to_item(&json)?.into_file()
    }

    async fn create_directory(
        &self,
        parent: &DirectoryItem,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<DirectoryItem> {
        let body = json!({"name": name, "folder": {}});
        let json = self
            .auth
            .fetch_json(
                HttpRequest::post(Self::item_url(&parent.id, "/children")).json(&body),
                cancel,
            )
            .await?;
        Self::to_item(&json)?.into_directory()
    }

    async fn rename_item(
        &self,
        item: &Item,
        new_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Item> {
        let json = self
            .auth
            .fetch_json(
                HttpRequest::new(Method::PATCH, Self::item_url(item.id(), ""))
                    .json(&json!({"name": new_name})),
                cancel,
            )
            .await?;
        Self::to_item(&json)
    }

    async fn move_item(
        &self,
        source: &Item,
        destination: &DirectoryItem,
        cancel: &CancellationToken,
    ) -> Result<Item> {
        let json = self
            .auth
            .fetch_json(
                HttpRequest::new(Method::PATCH, Self::item_url(source.id(), ""))
                    .json(&json!({"parentReference": {"id": destination.id}})),
                cancel,
            )
            .await?;
        Self::to_item(&json)
    }

    async fn remove_item(&self, item: &Item, cancel: &CancellationToken) -> Result<()> {
        self.auth
            .fetch(
                HttpRequest::new(Method::DELETE, Self::item_url(item.id(), "")),
                cancel,
            )
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn get_item_thumbnail(
        &self,
        file: &FileItem,
        range: Range,
        cancel: &CancellationToken,
    ) -> Result<Thumbnail> {
        let response = self
            .auth
            .fetch(
                HttpRequest::get(Self::item_url(&file.id, "/thumbnails/0/medium/content"))
                    .header("Range", range.to_header()),
                cancel,
            )
            .await?
            .error_for_status()?;
        Ok(Thumbnail {
            size: response.content_length(),
            mime_type: response
                .header("content-type")
                .unwrap_or("image/jpeg")
                .to_string(),
            data: response.body,
        })
    }

    async fn get_item_by_id(&self, id: &str, cancel: &CancellationToken) -> Result<Item> {
        let json = self
            .auth
            .fetch_json(HttpRequest::get(Self::item_url(id, "")), cancel)
            .await?;
        Self::to_item(&json)
    }
}
