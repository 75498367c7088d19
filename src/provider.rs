//! Uniform asynchronous provider abstraction.
//!
//! Every remote service implements [`Provider`] for the subset of operations
//! it supports; unimplemented capabilities fall through to default methods
//! returning [`Error::Unsupported`]. Items carry a provider-opaque payload so
//! mutations can round-trip the original wire record back into provider calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::http_client::ByteStream;
use crate::providers::youtube::YouTubeItem;

/// Supported remote services.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    GoogleDrive,
    Dropbox,
    OneDrive,
    Box,
    YouTube,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::GoogleDrive,
        ProviderKind::Dropbox,
        ProviderKind::OneDrive,
        ProviderKind::Box,
        ProviderKind::YouTube,
    ];

    /// Stable identifier used in URLs and the settings file.
    pub fn id(self) -> &'static str {
        match self {
            ProviderKind::GoogleDrive => "google",
            ProviderKind::Dropbox => "dropbox",
            ProviderKind::OneDrive => "onedrive",
            ProviderKind::Box => "box",
            ProviderKind::YouTube => "youtube",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.id() == id)
    }

    pub fn display_name(self) -> &'static str {
        match self {
            ProviderKind::GoogleDrive => "Google Drive",
            ProviderKind::Dropbox => "Dropbox",
            ProviderKind::OneDrive => "OneDrive",
            ProviderKind::Box => "Box",
            ProviderKind::YouTube => "YouTube",
        }
    }
}

/// One authenticated binding of a provider to a user identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AccountId {
    pub kind: ProviderKind,
    pub username: String,
}

impl AccountId {
    pub fn new(kind: ProviderKind, username: impl Into<String>) -> Self {
        Self {
            kind,
            username: username.into(),
        }
    }

    /// Percent-encoded form usable as a single URL path segment.
    pub fn encoded(&self) -> String {
        crate::http_client::encode_uri_component(&self.to_string())
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (kind, username) = value.split_once('/')?;
        Some(Self {
            kind: ProviderKind::from_id(kind)?,
            username: username.to_string(),
        })
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind.id(), self.username)
    }
}

/// Original provider record an [`Item`] was built from.
#[derive(Clone, Debug)]
pub enum ItemPayload {
    GoogleDrive(serde_json::Value),
    Dropbox(serde_json::Value),
    OneDrive(serde_json::Value),
    Box(serde_json::Value),
    YouTube(YouTubeItem),
}

impl ItemPayload {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ItemPayload::GoogleDrive(_) => ProviderKind::GoogleDrive,
            ItemPayload::Dropbox(_) => ProviderKind::Dropbox,
            ItemPayload::OneDrive(_) => ProviderKind::OneDrive,
            ItemPayload::Box(_) => ProviderKind::Box,
            ItemPayload::YouTube(_) => ProviderKind::YouTube,
        }
    }

    /// Raw JSON record, for providers that round-trip wire objects.
    pub fn json(&self, expected: ProviderKind) -> Result<&serde_json::Value> {
        let value = match self {
            ItemPayload::GoogleDrive(v)
            | ItemPayload::Dropbox(v)
            | ItemPayload::OneDrive(v)
            | ItemPayload::Box(v) => v,
            ItemPayload::YouTube(_) => return Err(Error::Unsupported),
        };
        if self.kind() == expected {
            Ok(value)
        } else {
            Err(Error::Unsupported)
        }
    }
}

#[derive(Clone, Debug)]
pub struct FileItem {
    pub id: String,
    pub name: String,
    pub size: Option<u64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub mime_type: Option<String>,
    pub payload: ItemPayload,
}

#[derive(Clone, Debug)]
pub struct DirectoryItem {
    pub id: String,
    pub name: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub payload: ItemPayload,
}

/// File or directory, tagged.
#[derive(Clone, Debug)]
pub enum Item {
    File(FileItem),
    Directory(DirectoryItem),
}

impl Item {
    pub fn id(&self) -> &str {
        match self {
            Item::File(f) => &f.id,
            Item::Directory(d) => &d.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Item::File(f) => &f.name,
            Item::Directory(d) => &d.name,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Item::Directory(_))
    }

    pub fn size(&self) -> Option<u64> {
        match self {
            Item::File(f) => f.size,
            Item::Directory(_) => None,
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Item::File(f) => f.timestamp,
            Item::Directory(d) => d.timestamp,
        }
    }

    pub fn into_directory(self) -> Result<DirectoryItem> {
        match self {
            Item::Directory(d) => Ok(d),
            Item::File(_) => Err(Error::Unsupported),
        }
    }

    pub fn into_file(self) -> Result<FileItem> {
        match self {
            Item::File(f) => Ok(f),
            Item::Directory(_) => Err(Error::Unsupported),
        }
    }
}

/// One page of a directory listing.
#[derive(Debug, Default)]
pub struct PageData {
    pub items: Vec<Item>,
    pub next_page_token: Option<String>,
}

/// Inclusive byte range, HTTP semantics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Range {
    pub start: u64,
    pub end: Option<u64>,
}

impl Range {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn is_full(&self) -> bool {
        self.start == 0 && self.end.is_none()
    }

    /// `Range` header value for an upstream request.
    pub fn to_header(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }

    /// Number of bytes covered, when the resource size is known.
    pub fn length(&self, size: u64) -> u64 {
        let end = self.end.unwrap_or(size.saturating_sub(1)).min(size.saturating_sub(1));
        end.saturating_sub(self.start) + 1
    }
}

/// Account-level metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GeneralData {
    pub username: String,
    pub space_used: Option<u64>,
    pub space_total: Option<u64>,
}

/// Payload for `create_file`.
pub struct FileContent {
    pub data: ByteStream,
    pub size: Option<u64>,
}

/// Thumbnail bytes plus metadata.
pub struct Thumbnail {
    pub data: ByteStream,
    pub size: Option<u64>,
    pub mime_type: String,
}

/// Uniform asynchronous API over heterogeneous remote object stores.
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn get_root(&self, cancel: &CancellationToken) -> Result<DirectoryItem>;

    async fn get_general_data(&self, cancel: &CancellationToken) -> Result<GeneralData>;

    async fn list_directory_page(
        &self,
        directory: &DirectoryItem,
        page_token: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<PageData>;

    async fn get_file_content(
        &self,
        file: &FileItem,
        range: Range,
        cancel: &CancellationToken,
    ) -> Result<ByteStream>;

    async fn create_file(
        &self,
        parent: &DirectoryItem,
        name: &str,
        content: FileContent,
        cancel: &CancellationToken,
    ) -> Result<FileItem> {
        let _ = (parent, name, content, cancel);
        Err(Error::Unsupported)
    }

    async fn create_directory(
        &self,
        parent: &DirectoryItem,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<DirectoryItem> {
        let _ = (parent, name, cancel);
        Err(Error::Unsupported)
    }

    async fn rename_item(
        &self,
        item: &Item,
        new_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Item> {
        let _ = (item, new_name, cancel);
        Err(Error::Unsupported)
    }

    async fn move_item(
        &self,
        source: &Item,
        destination: &DirectoryItem,
        cancel: &CancellationToken,
    ) -> Result<Item> {
        let _ = (source, destination, cancel);
        Err(Error::Unsupported)
    }

    async fn remove_item(&self, item: &Item, cancel: &CancellationToken) -> Result<()> {
        let _ = (item, cancel);
        Err(Error::Unsupported)
    }

    async fn get_item_thumbnail(
        &self,
        file: &FileItem,
        range: Range,
        cancel: &CancellationToken,
    ) -> Result<Thumbnail> {
        let _ = (file, range, cancel);
        Err(Error::Unsupported)
    }

    async fn get_item_by_id(&self, id: &str, cancel: &CancellationToken) -> Result<Item> {
        let _ = (id, cancel);
        Err(Error::Unsupported)
    }
}

/// Concatenate listing pages by chaining continuation tokens.
pub async fn list_directory(
    provider: &dyn Provider,
    directory: &DirectoryItem,
    cancel: &CancellationToken,
) -> Result<Vec<Item>> {
    let mut items = Vec::new();
    let mut page_token = None;
    loop {
        let page = provider
            .list_directory_page(directory, page_token, cancel)
            .await?;
        items.extend(page.items);
        match page.next_page_token {
            Some(token) => page_token = Some(token),
            None => return Ok(items),
        }
    }
}

/// Walk slash-separated name components from the provider root.
pub async fn get_item_by_path(
    provider: &dyn Provider,
    path: &str,
    cancel: &CancellationToken,
) -> Result<Item> {
    let mut current = Item::Directory(provider.get_root(cancel).await?);
    for component in path.split('/').filter(|c| !c.is_empty()) {
        let directory = current.into_directory().map_err(|_| Error::NotFound)?;
        let items = list_directory(provider, &directory, cancel).await?;
        current = items
            .into_iter()
            .find(|item| item.name() == component)
            .ok_or(Error::NotFound)?;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_id_round_trip() {
        let id = AccountId::new(ProviderKind::GoogleDrive, "alice@example.com");
        assert_eq!(id.to_string(), "google/alice@example.com");
        assert_eq!(AccountId::parse("google/alice@example.com"), Some(id));
        assert_eq!(AccountId::parse("nosuch/alice"), None);
    }

    #[test]
    fn account_id_encoding_survives_separator() {
        let id = AccountId::new(ProviderKind::Dropbox, "a/b c");
        let encoded = id.encoded();
        assert!(!encoded.contains('/'));
        assert!(encoded.contains("%2F"));
    }

    #[test]
    fn range_header_and_length() {
        let range = Range {
            start: 10,
            end: Some(29),
        };
        assert_eq!(range.to_header(), "bytes=10-29");
        assert_eq!(range.length(100), 20);

        let open = Range {
            start: 10,
            end: None,
        };
        assert_eq!(open.to_header(), "bytes=10-");
        assert_eq!(open.length(100), 90);
    }

    #[test]
    fn payload_kind_mismatch_is_unsupported() {
        let payload = ItemPayload::Box(serde_json::json!({"id": "1"}));
        assert!(payload.json(ProviderKind::Box).is_ok());
        assert!(matches!(
            payload.json(ProviderKind::GoogleDrive),
            Err(Error::Unsupported)
        ));
    }
}
