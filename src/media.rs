//! Seams to the external media tooling.
//!
//! Thumbnail frame extraction and muxing are performed by external
//! collaborators; the gateway only supplies seekable byte-range readers over
//! provider content and consumes the produced byte streams.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::http_client::ByteStream;
use crate::provider::{FileItem, Provider, Range, Thumbnail};

/// Output container for muxed streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaContainer {
    Mp4,
    Webm,
}

impl MediaContainer {
    pub fn mime_type(self) -> &'static str {
        match self {
            MediaContainer::Mp4 => "video/mp4",
            MediaContainer::Webm => "video/webm",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThumbnailCodec {
    Png,
    Jpeg,
}

#[derive(Clone, Copy, Debug)]
pub struct ThumbnailOptions {
    pub codec: ThumbnailCodec,
    pub size: u32,
}

impl Default for ThumbnailOptions {
    fn default() -> Self {
        Self {
            codec: ThumbnailCodec::Png,
            size: 256,
        }
    }
}

/// Seekable byte-range reader over one provider file, consumed by the muxer.
pub struct RangeReader {
    provider: Arc<dyn Provider>,
    file: FileItem,
    cancel: CancellationToken,
}

impl RangeReader {
    pub fn new(provider: Arc<dyn Provider>, file: FileItem, cancel: CancellationToken) -> Self {
        Self {
            provider,
            file,
            cancel,
        }
    }

    pub fn size(&self) -> Option<u64> {
        self.file.size
    }

    pub async fn stream(&self, range: Range) -> Result<ByteStream> {
        self.provider
            .get_file_content(&self.file, range, &self.cancel)
            .await
    }

    pub async fn read(&self, range: Range) -> Result<Bytes> {
        let mut stream = self.stream(range).await?;
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk?);
        }
        Ok(Bytes::from(chunks.concat()))
    }
}

/// Extracts a thumbnail frame from provider content.
#[async_trait]
pub trait ThumbnailGenerator: Send + Sync {
    async fn generate(
        &self,
        provider: &Arc<dyn Provider>,
        file: &FileItem,
        options: ThumbnailOptions,
        cancel: &CancellationToken,
    ) -> Result<Bytes>;
}

/// Muxes one video and one audio stream into a single container.
#[async_trait]
pub trait Muxer: Send + Sync {
    async fn mux(
        &self,
        video: RangeReader,
        audio: RangeReader,
        container: MediaContainer,
        cancel: &CancellationToken,
    ) -> Result<ByteStream>;
}

/// Placeholder collaborators for deployments without the media tooling.
pub struct MediaToolsUnavailable;

#[async_trait]
impl ThumbnailGenerator for MediaToolsUnavailable {
    async fn generate(
        &self,
        _provider: &Arc<dyn Provider>,
        _file: &FileItem,
        _options: ThumbnailOptions,
        _cancel: &CancellationToken,
    ) -> Result<Bytes> {
        Err(Error::Unsupported)
    }
}

#[async_trait]
impl Muxer for MediaToolsUnavailable {
    async fn mux(
        &self,
        _video: RangeReader,
        _audio: RangeReader,
        _container: MediaContainer,
        _cancel: &CancellationToken,
    ) -> Result<ByteStream> {
        Err(Error::Unsupported)
    }
}

/// Broad media classification by MIME prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Audio,
    Image,
    Video,
    Unknown,
}

pub fn file_type(mime_type: &str) -> FileType {
    if mime_type.starts_with("audio") {
        FileType::Audio
    } else if mime_type.starts_with("image") {
        FileType::Image
    } else if mime_type.starts_with("video") {
        FileType::Video
    } else {
        FileType::Unknown
    }
}

fn trim_to_range(data: Bytes, range: Range) -> Bytes {
    if range.is_full() {
        return data;
    }
    let start = (range.start as usize).min(data.len());
    let end = range
        .end
        .map(|end| (end as usize + 1).min(data.len()))
        .unwrap_or(data.len());
    data.slice(start..end.max(start))
}

/// Provider thumbnail when available, generated frame otherwise. Items that
/// are neither images nor videos have no generated fallback.
pub async fn thumbnail_with_fallback(
    generator: &dyn ThumbnailGenerator,
    provider: &Arc<dyn Provider>,
    file: &FileItem,
    range: Range,
    cancel: &CancellationToken,
) -> Result<Thumbnail> {
    match provider.get_item_thumbnail(file, range, cancel).await {
        Ok(thumbnail) => return Ok(thumbnail),
        Err(Error::Cancelled) => return Err(Error::Cancelled),
        Err(_) => {}
    }
    let mime = file.mime_type.as_deref().unwrap_or("");
    if !matches!(file_type(mime), FileType::Image | FileType::Video) {
        return Err(Error::NotFound);
    }
    let image = generator
        .generate(provider, file, ThumbnailOptions::default(), cancel)
        .await?;
    let size = image.len() as u64;
    let trimmed = trim_to_range(image, range);
    Ok(Thumbnail {
        data: futures::stream::once(async move { Ok(trimmed) }).boxed(),
        size: Some(size),
        mime_type: "image/png".into(),
    })
}
