//! Google Drive provider.

use std::sync::Arc;

use chrono::DateTime;
use http::Method;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::auth::AuthManager;
use crate::error::{Error, Result};
use crate::http_client::{ByteStream, HttpRequest, form_encode};
use crate::provider::{
    DirectoryItem, FileContent, FileItem, GeneralData, Item, ItemPayload, PageData, Provider,
    ProviderKind, Range, Thumbnail,
};

const ENDPOINT: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_ENDPOINT: &str = "https://www.googleapis.com/upload/drive/v3/files";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "id,name,mimeType,size,modifiedTime,parents,thumbnailLink";

pub struct GoogleDrive {
    auth: Arc<AuthManager>,
}

impl GoogleDrive {
    pub fn new(auth: Arc<AuthManager>) -> Self {
        Self { auth }
    }

    fn endpoint(path: &str) -> String {
        format!("{ENDPOINT}{path}")
    }

    fn to_item(entry: &Value) -> Result<Item> {
        let id = entry["id"]
            .as_str()
            .ok_or_else(|| Error::parse("drive file missing id"))?
            .to_string();
        let name = entry["name"].as_str().unwrap_or_default().to_string();
        let timestamp = entry["modifiedTime"]
            .as_str()
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|v| v.to_utc());
        let mime_type = entry["mimeType"].as_str().map(str::to_string);
        let payload = ItemPayload::GoogleDrive(entry.clone());
        if mime_type.as_deref() == Some(FOLDER_MIME) {
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
                size: entry["size"].as_str().and_then(|v| v.parse().ok()),
                timestamp,
                mime_type,
                payload,
            }))
        }
    }
}

#[async_trait::async_trait]
impl Provider for GoogleDrive {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GoogleDrive
    }

    async fn get_root(&self, _cancel: &CancellationToken) -> Result<DirectoryItem> {
        Ok(DirectoryItem {
            id: "root".into(),
            name: String::new(),
            timestamp: None,
            payload: ItemPayload::GoogleDrive(json!({"id": "root", "mimeType": FOLDER_MIME})),
        })
    }

    async fn get_general_data(&self, cancel: &CancellationToken) -> Result<GeneralData> {
        let url = format!(
            "{}?{}",
            Self::endpoint("/about"),
            form_encode(&[("fields", "user(emailAddress),storageQuota")])
        );
        let json = self.auth.fetch_json(HttpRequest::get(url), cancel).await?;
        Ok(GeneralData {
            username: json["user"]["emailAddress"]
                .as_str()
                .ok_or_else(|| Error::parse("drive about missing emailAddress"))?
                .to_string(),
            space_used: json["storageQuota"]["usage"]
                .as_str()
                .and_then(|v| v.parse().ok()),
            space_total: json["storageQuota"]["limit"]
                .as_str()
                .and_then(|v| v.parse().ok()),
        })
    }

    async fn list_directory_page(
        &self,
        directory: &DirectoryItem,
        page_token: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<PageData> {
        let query = format!("'{}' in parents and trashed = false", directory.id);
        let fields = format!("files({FILE_FIELDS}),nextPageToken");
        let mut params = vec![
            ("q", query.as_str()),
            ("fields", fields.as_str()),
            ("pageSize", "100"),
        ];
        if let Some(token) = page_token.as_deref() {
            params.push(("pageToken", token));
        }
        let url = format!("{}?{}", Self::endpoint("/files"), form_encode(&params));
        let json = self.auth.fetch_json(HttpRequest::get(url), cancel).await?;

        let mut page = PageData::default();
        for entry in json["files"].as_array().into_iter().flatten() {
            page.items.push(Self::to_item(entry)?);
        }
        page.next_page_token = json["nextPageToken"].as_str().map(str::to_string);
        Ok(page)
    }

    async fn get_file_content(
        &self,
        file: &FileItem,
        range: Range,
        cancel: &CancellationToken,
    ) -> Result<ByteStream> {
        let url = format!("{}?alt=media", Self::endpoint(&format!("/files/{}", file.id)));
        let response = self
            .auth
            .fetch(
                HttpRequest::get(url).header("Range", range.to_header()),
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
        let metadata = json!({"name": name, "parents": [parent.id]});
        let session = self
            .auth
            .fetch(
                HttpRequest::post(format!("{UPLOAD_ENDPOINT}?uploadType=resumable"))
                    .json(&metadata),
                cancel,
            )
            .await?
            .error_for_status()?;
        let upload_url = session
            .header("location")
            .ok_or_else(|| Error::parse("resumable session missing location"))?
            .to_string();

        let mut request = HttpRequest::new(Method::PUT, upload_url).stream(content.data);
        if let Some(size) = content.size {
            request = request.header("Content-Length", size.to_string());
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
        let body = json!({"name": name, "mimeType": FOLDER_MIME, "parents": [parent.id]});
        let url = format!(
            "{}?{}",
            Self::endpoint("/files"),
            form_encode(&[("fields", FILE_FIELDS)])
        );
        let json = self
            .auth
            .fetch_json(HttpRequest::post(url).json(&body), cancel)
            .await?;
        Self::to_item(&json)?.into_directory()
    }

    async fn rename_item(
        &self,
        item: &Item,
        new_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Item> {
        let url = format!(
            "{}?{}",
            Self::endpoint(&format!("/files/{}", item.id())),
            form_encode(&[("fields", FILE_FIELDS)])
        );
        let json = self
            .auth
            .fetch_json(
                HttpRequest::new(Method::PATCH, url).json(&json!({"name": new_name})),
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
        let payload = match source {
            Item::File(f) => &f.payload,
            Item::Directory(d) => &d.payload,
        };
        let previous_parents = payload
            .json(ProviderKind::GoogleDrive)?["parents"]
            .as_array()
            .map(|parents| {
                parents
                    .iter()
                    .filter_map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();
        let url = format!(
            "{}?{}",
            Self::endpoint(&format!("/files/{}", source.id())),
            form_encode(&[
                ("addParents", destination.id.as_str()),
                ("removeParents", previous_parents.as_str()),
                ("fields", FILE_FIELDS),
            ])
        );
        let json = self
            .auth
            .fetch_json(HttpRequest::new(Method::PATCH, url).json(&json!({})), cancel)
            .await?;
        Self::to_item(&json)
    }

    async fn remove_item(&self, item: &Item, cancel: &CancellationToken) -> Result<()> {
        let url = Self::endpoint(&format!("/files/{}", item.id()));
        self.auth
            .fetch(HttpRequest::new(Method::DELETE, url), cancel)
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
        let link = file.payload.json(ProviderKind::GoogleDrive)?["thumbnailLink"]
            .as_str()
            .ok_or(Error::NotFound)?
            .to_string();
        let response = self
            .auth
            .fetch(
                HttpRequest::get(link).header("Range", range.to_header()),
                cancel,
            )
            .await?
            .error_for_status()?;
        Ok(Thumbnail {
            size: response.content_length(),
            mime_type: response
                .header("content-type")
                .unwrap_or("image/png")
                .to_string(),
            data: response.body,
        })
    }

    async fn get_item_by_id(&self, id: &str, cancel: &CancellationToken) -> Result<Item> {
        let url = format!(
            "{}?{}",
            Self::endpoint(&format!("/files/{id}")),
            form_encode(&[("fields", FILE_FIELDS)])
        );
        let json = self.auth.fetch_json(HttpRequest::get(url), cancel).await?;
        Self::to_item(&json)
    }
}
