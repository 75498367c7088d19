//! Box provider.
//!
//! Listing is offset-paginated; uploads go through a pre-negotiated session
//! URL followed by a multipart POST with a fixed boundary.

use std::sync::Arc;

use chrono::DateTime;
use futures::StreamExt;
use http::Method;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::auth::AuthManager;
use crate::error::{Error, Result};
use crate::http_client::{ByteStream, HttpRequest, form_encode};
use crate::provider::{
    DirectoryItem, FileContent, FileItem, GeneralData, Item, ItemPayload, PageData, Provider,
    ProviderKind, Range, Thumbnail, list_directory,
};

const ENDPOINT: &str = "https://api.box.com/2.0";
const UPLOAD_BOUNDARY: &str = "cirrusZmvFyLPtQ9wSgJHh";
const FILE_PROPERTIES: &str = "name,id,size,modified_at";

pub struct BoxDrive {
    auth: Arc<AuthManager>,
}

impl BoxDrive {
    pub fn new(auth: Arc<AuthManager>) -> Self {
        Self { auth }
    }

    fn endpoint(path: &str) -> String {
        format!("{ENDPOINT}{path}")
    }

    fn to_item(entry: &Value) -> Result<Item> {
        let id = entry["id"]
            .as_str()
            .ok_or_else(|| Error::parse("box entry missing id"))?
            .to_string();
        let name = entry["name"].as_str().unwrap_or_default().to_string();
        let timestamp = entry["modified_at"]
            .as_str()
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|v| v.to_utc());
        let payload = ItemPayload::Box(entry.clone());
        if entry["type"] == "folder" {
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

    fn item_endpoint(item: &Item) -> String {
        match item {
            Item::File(f) => Self::endpoint(&format!("/files/{}", f.id)),
            Item::Directory(d) => Self::endpoint(&format!("/folders/{}", d.id)),
        }
    }

    fn multipart_body(parent_id: &str, name: &str, content: FileContent) -> ByteStream {
        let attributes = json!({"name": name, "parent": {"id": parent_id}});
        let preamble = format!(
            "--{UPLOAD_BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"attributes\"\r\n\r\n\
             {attributes}\r\n\
             --{UPLOAD_BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        );
        let epilogue = format!("\r\n--{UPLOAD_BOUNDARY}--");
        futures::stream::once(async move { Ok(preamble.into()) })
            .chain(content.data)
            .chain(futures::stream::once(async move { Ok(epilogue.into()) }))
            .boxed()
    }
}

#[async_trait::async_trait]
impl Provider for BoxDrive {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Box
    }

    async fn get_root(&self, _cancel: &CancellationToken) -> Result<DirectoryItem> {
        Ok(DirectoryItem {
            id: "0".into(),
            name: String::new(),
            timestamp: None,
            payload: ItemPayload::Box(json!({"id": "0", "type": "folder"})),
        })
    }

    async fn get_general_data(&self, cancel: &CancellationToken) -> Result<GeneralData> {
        let json = self
            .auth
            .fetch_json(HttpRequest::get(Self::endpoint("/users/me")), cancel)
            .await?;
        Ok(GeneralData {
            username: json["login"]
                .as_str()
                .ok_or_else(|| Error::parse("box user missing login"))?
                .to_string(),
            space_used: json["space_used"].as_u64(),
            space_total: json["space_amount"].as_u64(),
        })
    }

    async fn list_directory_page(
        &self,
        directory: &DirectoryItem,
        page_token: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<PageData> {
        let mut params = vec![("fields", FILE_PROPERTIES)];
        if let Some(offset) = page_token.as_deref() {
            params.push(("offset", offset));
        }
        let url = format!(
            "{}?{}",
            Self::endpoint(&format!("/folders/{}/items", directory.id)),
            form_encode(&params)
        );
        let json = self.auth.fetch_json(HttpRequest::get(url), cancel).await?;

        let mut page = PageData::default();
        for entry in json["entries"].as_array().into_iter().flatten() {
            page.items.push(Self::to_item(entry)?);
        }
        let offset = json["offset"].as_u64().unwrap_or_default();
        let limit = json["limit"].as_u64().unwrap_or_default();
        let total = json["total_count"].as_u64().unwrap_or_default();
        if offset + limit < total {
            page.next_page_token = Some((offset + limit).to_string());
        }
        Ok(page)
    }

    async fn get_file_content(
        &self,
        file: &FileItem,
        range: Range,
        cancel: &CancellationToken,
    ) -> Result<ByteStream> {
        let request = HttpRequest::get(Self::endpoint(&format!("/files/{}/content", file.id)))
            .header("Range", range.to_header())
            .no_redirects();
        let response = self.auth.fetch(request, cancel).await?;
        // Box answers with a redirect to a pre-signed URL; fetch that one
        // without the Authorization header but with the Range re-applied.
        let response = if (300..400).contains(&response.status) {
            let location = response
                .header("location")
                .ok_or_else(|| Error::parse("redirect without location"))?
                .to_string();
            self.auth
                .http()
                .fetch(
                    HttpRequest::get(location).header("Range", range.to_header()),
                    cancel,
                )
                .await?
        } else {
            response
        };
        Ok(response.error_for_status()?.body)
    }

    async fn create_file(
        &self,
        parent: &DirectoryItem,
        name: &str,
        content: FileContent,
        cancel: &CancellationToken,
    ) -> Result<FileItem> {
        // An existing item of the same name turns the upload into a new
        // version of that file.
        let existing = list_directory(self, parent, cancel)
            .await?
            .into_iter()
            .find(|item| item.name() == name)
            .map(|item| item.id().to_string());

        let preflight_url = match &existing {
            Some(id) => Self::endpoint(&format!("/files/{id}/content")),
            None => Self::endpoint("/files/content"),
        };
        let mut preflight = json!({"size": content.size});
        if existing.is_none() {
            preflight["name"] = json!(name);
            preflight["parent"] = json!({"id": parent.id});
        }
        let session = self
            .auth
            .fetch_json(
                HttpRequest::new(Method::OPTIONS, preflight_url)
                    .header("Accept", "application/json")
                    .json(&preflight),
                cancel,
            )
            .await?;
        let upload_url = session["upload_url"]
            .as_str()
            .ok_or_else(|| Error::parse("box preflight missing upload_url"))?
            .to_string();
        let bearer = match session["upload_token"].as_str() {
            Some(token) => token.to_string(),
            None => self.auth.current_token().await.access_token.clone(),
        };

        let request = HttpRequest::post(upload_url)
            .header("Accept", "application/json")
            .header(
                "Content-Type",
                format!("multipart/form-data; boundary={UPLOAD_BOUNDARY}"),
            )
            .header("Authorization", format!("Bearer {bearer}"))
            .stream(Self::multipart_body(&parent.id, name, content));
        let json: Value = self
            .auth
            .http()
            .fetch(request, cancel)
            .await?
            .error_for_status()?
            .json()
            .await?;
        Self::to_item(&json["entries"][0])?.into_file()
    }

    async fn create_directory(
        &self,
        parent: &DirectoryItem,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<DirectoryItem> {
        let body = json!({"name": name, "parent": {"id": parent.id}});
        let json = self
            .auth
            .fetch_json(HttpRequest::post(Self::endpoint("/folders")).json(&body), cancel)
            .await?;
        Self::to_item(&json)?.into_directory()
    }

    async fn rename_item(
        &self,
        item: &Item,
        new_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Item> {
        let body = json!({"name": new_name});
        let json = self
            .auth
            .fetch_json(
                HttpRequest::new(Method::PUT, Self::item_endpoint(item)).json(&body),
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
        let body = json!({"parent": {"id": destination.id}});
        let json = self
            .auth
            .fetch_json(
                HttpRequest::new(Method::PUT, Self::item_endpoint(source)).json(&body),
                cancel,
            )
            .await?;
        Self::to_item(&json)
    }

    async fn remove_item(&self, item: &Item, cancel: &CancellationToken) -> Result<()> {
        let url = match item {
            Item::File(_) => Self::item_endpoint(item),
            Item::Directory(_) => format!("{}?recursive=true", Self::item_endpoint(item)),
        };
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
        let url = Self::endpoint(&format!(
            "/files/{}/thumbnail.png?min_width=256&min_height=256",
            file.id
        ));
        let response = self
            .auth
            .fetch(
                HttpRequest::get(url).header("Range", range.to_header()),
                cancel,
            )
            .await?
            .error_for_status()?;
        let size = response.content_length();
        if size == Some(0) {
            return Err(Error::NotFound);
        }
        Ok(Thumbnail {
            size,
            mime_type: "image/png".into(),
            data: response.body,
        })
    }
}
