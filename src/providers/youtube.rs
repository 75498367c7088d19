//! YouTube provider.
//!
//! The channel's related playlists are exposed under four virtual roots: `/`
//! presents videos as synthesised DASH manifests, `/streams/` as per-video
//! directories of raw formats, `/muxed-webm/` and `/muxed-mp4/` as single
//! files produced by the external muxer. Media URLs are reconstructed from
//! the watch page: the player response JSON carries the format list and the
//! player script carries the descrambling functions for protected streams.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;
use futures::{SinkExt, StreamExt};
use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthManager;
use crate::config::{DASH_MANIFEST_SIZE, STREAM_CACHE_CAPACITY, STREAM_CHUNK_SIZE};
use crate::dash;
use crate::error::{Error, Result};
use crate::http_client::{ByteStream, HttpClient, HttpRequest, form_encode};
use crate::media::{MediaContainer, Muxer, RangeReader};
use crate::provider::{
    DirectoryItem, FileItem, GeneralData, Item, ItemPayload, PageData, Provider, ProviderKind,
    Range, Thumbnail,
};
use crate::stream_cache::{CoalescedCache, ValueFetcher};

const API_ENDPOINT: &str = "https://www.googleapis.com/youtube/v3";
const WATCH_ENDPOINT: &str = "https://www.youtube.com/watch";
const USERINFO_ENDPOINT: &str = "https://openidconnect.googleapis.com/v1/userinfo";

/// How playlist members are presented under a virtual root.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presentation {
    Dash,
    Stream,
    MuxedWebm,
    MuxedMp4,
}

impl Presentation {
    fn container(self) -> Option<MediaContainer> {
        match self {
            Presentation::MuxedWebm => Some(MediaContainer::Webm),
            Presentation::MuxedMp4 => Some(MediaContainer::Mp4),
            _ => None,
        }
    }
}

/// Provider-side item record.
#[derive(Clone, Debug)]
pub enum YouTubeItem {
    Root {
        presentation: Presentation,
    },
    Playlist {
        playlist_id: String,
        presentation: Presentation,
    },
    StreamDirectory {
        video_id: String,
    },
    Stream {
        video_id: String,
        itag: i64,
        size: u64,
    },
    DashManifest {
        video_id: String,
        thumbnail_url: Option<String>,
    },
    MuxedStream {
        video_id: String,
        container: MediaContainer,
        thumbnail_url: Option<String>,
    },
}

/// Pure string transformation reconstructed from the player script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Descrambler {
    ops: Vec<DescrambleOp>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DescrambleOp {
    Reverse,
    Swap(usize),
    Splice(usize),
}

impl Descrambler {
    pub fn apply(&self, input: &str) -> String {
        let mut chars: Vec<char> = input.chars().collect();
        for op in &self.ops {
            match op {
                DescrambleOp::Reverse => chars.reverse(),
                DescrambleOp::Swap(n) => {
                    if !chars.is_empty() {
                        let n = n % chars.len();
                        chars.swap(0, n);
                    }
                }
                DescrambleOp::Splice(n) => {
                    chars.drain(..(*n).min(chars.len()));
                }
            }
        }
        chars.into_iter().collect()
    }
}

/// Per-video stream metadata cached by the provider.
#[derive(Clone, Debug, Default)]
pub struct StreamData {
    pub adaptive_formats: Vec<Value>,
    pub formats: Vec<Value>,
    pub descrambler: Option<Descrambler>,
    pub new_descrambler: Option<Descrambler>,
}

impl StreamData {
    fn all_formats(&self) -> impl Iterator<Item = &Value> {
        self.adaptive_formats.iter().chain(self.formats.iter())
    }

    fn best_format(&self, mime_prefix: &str) -> Result<&Value> {
        self.adaptive_formats
            .iter()
            .filter(|f| {
                f["mimeType"]
                    .as_str()
                    .is_some_and(|m| m.starts_with(mime_prefix))
                    && f["contentLength"].is_string()
            })
            .max_by_key(|f| f["bitrate"].as_u64().unwrap_or_default())
            .ok_or(Error::NotFound)
    }

    pub fn best_video(&self, container: MediaContainer) -> Result<&Value> {
        self.best_format(match container {
            MediaContainer::Webm => "video/webm",
            MediaContainer::Mp4 => "video/mp4",
        })
    }

    pub fn best_audio(&self, container: MediaContainer) -> Result<&Value> {
        self.best_format(match container {
            MediaContainer::Webm => "audio/webm",
            MediaContainer::Mp4 => "audio/mp4",
        })
    }
}

/// Extract the `ytInitialPlayerResponse` JSON object from the watch page.
pub fn get_config(page: &str) -> Result<Value> {
    let marker = "ytInitialPlayerResponse";
    let start = page
        .find(marker)
        .ok_or_else(|| Error::parse("player response not found in watch page"))?;
    let brace = page[start..]
        .find('{')
        .map(|i| start + i)
        .ok_or_else(|| Error::parse("player response has no object"))?;

    let bytes = page.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[brace..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Ok(serde_json::from_str(&page[brace..=brace + offset])?);
                }
            }
            _ => {}
        }
    }
    Err(Error::parse("player response object is unterminated"))
}

/// Absolute URL of the player script referenced by the watch page.
pub fn get_player_url(page: &str) -> Result<String> {
    let re = Regex::new(r#""jsUrl":"([^"]+)""#).expect("player url pattern");
    let path = re
        .captures(page)
        .and_then(|c| c.get(1))
        .ok_or_else(|| Error::parse("player script url not found"))?
        .as_str();
    if path.starts_with("http") {
        Ok(path.to_string())
    } else {
        Ok(format!("https://www.youtube.com{path}"))
    }
}

fn parse_op_table(player: &str, body: &str) -> Result<Vec<DescrambleOp>> {
    let call_re =
        Regex::new(r"([a-zA-Z0-9$_]+)\.([a-zA-Z0-9$_]+)\(a,(\d+)\)").expect("call pattern");
    let mut ops = Vec::new();
    for call in call_re.captures_iter(body) {
        let member = &call[2];
        let argument: usize = call[3]
            .parse()
            .map_err(|_| Error::parse("descrambler argument is not a number"))?;
        let member_re = Regex::new(&format!(
            r"{}:function\([^)]*\)\{{([^}}]*)\}}",
            regex::escape(member)
        ))
        .expect("member pattern");
        let member_body = member_re
            .captures(player)
            .and_then(|c| c.get(1))
            .ok_or_else(|| Error::parse("descrambler helper not found in player script"))?
            .as_str();
        if member_body.contains("reverse") {
            ops.push(DescrambleOp::Reverse);
        } else if member_body.contains("splice") {
            ops.push(DescrambleOp::Splice(argument));
        } else {
            ops.push(DescrambleOp::Swap(argument));
        }
    }
    if ops.is_empty() {
        return Err(Error::parse("descrambler body has no helper calls"));
    }
    Ok(ops)
}

/// Signature descrambler extracted from the player script by pattern match.
pub fn get_descrambler(player: &str) -> Result<Descrambler> {
    let main_re = Regex::new(
        r#"[a-zA-Z0-9$_]+=function\(a\)\{a=a\.split\(""\);([^}]*);return a\.join\(""\)\}"#,
    )
    .expect("descrambler pattern");
    let body = main_re
        .captures(player)
        .and_then(|c| c.get(1))
        .ok_or_else(|| Error::parse("descrambler function not found in player script"))?
        .as_str();
    Ok(Descrambler {
        ops: parse_op_table(player, body)?,
    })
}

/// Throttling-parameter descrambler. Only the op-table shape is recognised;
/// newer player scripts fall outside it and yield `None`, in which case the
/// `n` parameter is passed through unchanged.
pub fn get_new_descrambler(player: &str) -> Option<Descrambler> {
    let name_re = Regex::new(r#"\.get\("n"\)\)&&\(b=([a-zA-Z0-9$_]+)"#).ok()?;
    let name = name_re.captures(player)?.get(1)?.as_str();
    let fn_re = Regex::new(&format!(
        r#"{}=function\(a\)\{{a=a\.split\(""\);([^}}]*);return a\.join\(""\)\}}"#,
        regex::escape(name)
    ))
    .ok()?;
    let body = fn_re.captures(player)?.get(1)?.as_str();
    let ops = parse_op_table(player, body).ok()?;
    Some(Descrambler { ops })
}

/// Resolve a `signatureCipher` value into a playable URL.
fn resolve_cipher(cipher: &str, descrambler: &Descrambler) -> Result<String> {
    let params: HashMap<String, String> = url::form_urlencoded::parse(cipher.as_bytes())
        .into_owned()
        .collect();
    let scrambled = params
        .get("s")
        .ok_or_else(|| Error::parse("cipher missing s parameter"))?;
    let url = params
        .get("url")
        .ok_or_else(|| Error::parse("cipher missing url parameter"))?;
    let parameter = params.get("sp").map(String::as_str).unwrap_or("signature");
    let signature = descrambler.apply(scrambled);
    Ok(format!(
        "{url}&{}",
        form_encode(&[(parameter, signature.as_str())])
    ))
}

fn stream_data_fetcher(http: Arc<dyn HttpClient>) -> Arc<dyn ValueFetcher<StreamData>> {
    struct Fetcher {
        http: Arc<dyn HttpClient>,
    }

    #[async_trait::async_trait]
    impl ValueFetcher<StreamData> for Fetcher {
        async fn fetch(&self, video_id: &str, cancel: &CancellationToken) -> Result<StreamData> {
            let watch_url = format!("{WATCH_ENDPOINT}?{}", form_encode(&[("v", video_id)]));
            let page = self
                .http
                .fetch(HttpRequest::get(watch_url), cancel)
                .await?
                .error_for_status()?
                .text()
                .await?;
            let config = get_config(&page)?;
            let mut data = StreamData {
                adaptive_formats: config["streamingData"]["adaptiveFormats"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default(),
                formats: config["streamingData"]["formats"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default(),
                descrambler: None,
                new_descrambler: None,
            };
            let player = self
                .http
                .fetch(HttpRequest::get(get_player_url(&page)?), cancel)
                .await?
                .error_for_status()?
                .text()
                .await?;
            data.new_descrambler = get_new_descrambler(&player);
            if data.all_formats().any(|f| f.get("url").is_none()) {
                data.descrambler = Some(get_descrambler(&player)?);
            }
            Ok(data)
        }
    }

    Arc::new(Fetcher { http })
}

#[derive(Clone)]
pub struct YouTube {
    auth: Arc<AuthManager>,
    muxer: Arc<dyn Muxer>,
    stream_cache: Arc<CoalescedCache<StreamData>>,
}

impl YouTube {
    pub fn new(auth: Arc<AuthManager>, muxer: Arc<dyn Muxer>, cancel: CancellationToken) -> Self {
        let fetcher = stream_data_fetcher(auth.http().clone());
        Self {
            auth,
            muxer,
            stream_cache: Arc::new(CoalescedCache::new(STREAM_CACHE_CAPACITY, fetcher, cancel)),
        }
    }

    fn endpoint(path: &str, params: &[(&str, &str)]) -> String {
        format!("{API_ENDPOINT}{path}?{}", form_encode(params))
    }

    fn payload(item_payload: &ItemPayload) -> Result<&YouTubeItem> {
        match item_payload {
            ItemPayload::YouTube(item) => Ok(item),
            _ => Err(Error::Unsupported),
        }
    }

    fn encode_name(name: &str) -> String {
        crate::http_client::encode_uri_component(name)
    }

    async fn get_video_url(
        &self,
        video_id: &str,
        itag: i64,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let data = self.stream_cache.get(video_id, cancel).await?;
        let format = data
            .all_formats()
            .find(|f| f["itag"].as_i64() == Some(itag))
            .ok_or(Error::NotFound)?;
        let mut url = match format["url"].as_str() {
            Some(url) => url.to_string(),
            None => {
                let cipher = format["signatureCipher"]
                    .as_str()
                    .ok_or_else(|| Error::parse("format has neither url nor cipher"))?;
                let descrambler = data
                    .descrambler
                    .as_ref()
                    .ok_or_else(|| Error::parse("cipher present without descrambler"))?;
                resolve_cipher(cipher, descrambler)?
            }
        };
        if let Some(new_descrambler) = &data.new_descrambler {
            let mut parsed =
                url::Url::parse(&url).map_err(|err| Error::parse(err.to_string()))?;
            let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
            if pairs.iter().any(|(key, _)| key == "n") {
                parsed.query_pairs_mut().clear().extend_pairs(
                    pairs.into_iter().map(|(key, value)| {
                        let value = if key == "n" {
                            new_descrambler.apply(&value)
                        } else {
                            value
                        };
                        (key, value)
                    }),
                );
                url = parsed.to_string();
            }
        }
        Ok(url)
    }

    /// One ranged media request; a 4xx invalidates the cache entry and the
    /// URL is derived and fetched once more.
    async fn fetch_stream_chunk(
        &self,
        video_id: &str,
        itag: i64,
        range: Range,
        cancel: &CancellationToken,
    ) -> Result<ByteStream> {
        let url = self.get_video_url(video_id, itag, cancel).await?;
        let request = HttpRequest::get(url).header("Range", range.to_header());
        let response = self.auth.http().fetch(request, cancel).await?;
        let response = if (400..500).contains(&response.status) {
            self.stream_cache.invalidate(video_id);
            let url = self.get_video_url(video_id, itag, cancel).await?;
            self.auth
                .http()
                .fetch(
                    HttpRequest::get(url).header("Range", range.to_header()),
                    cancel,
                )
                .await?
        } else {
            response
        };
        Ok(response.error_for_status()?.body)
    }

    fn stream_content(
        &self,
        video_id: String,
        itag: i64,
        size: u64,
        range: Range,
        cancel: &CancellationToken,
    ) -> ByteStream {
        let (mut tx, rx) = futures::channel::mpsc::channel::<Result<bytes::Bytes>>(4);
        let provider = self.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let end = range.end.unwrap_or(size.saturating_sub(1));
            let mut position = range.start;
            'chunks: while position <= end {
                let sub_end = (position + STREAM_CHUNK_SIZE - 1).min(end);
                let sub_range = Range {
                    start: position,
                    end: Some(sub_end),
                };
                match provider
                    .fetch_stream_chunk(&video_id, itag, sub_range, &cancel)
                    .await
                {
                    Ok(mut stream) => {
                        while let Some(chunk) = stream.next().await {
                            let failed = chunk.is_err();
                            if tx.send(chunk).await.is_err() || failed {
                                break 'chunks;
                            }
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        break 'chunks;
                    }
                }
                position = sub_end + 1;
            }
        });
        rx.boxed()
    }

    async fn muxed_content(
        &self,
        video_id: &str,
        container: MediaContainer,
        range: Range,
        cancel: &CancellationToken,
    ) -> Result<ByteStream> {
        if !range.is_full() {
            return Err(Error::RangeNotSatisfiable { size: None });
        }
        let data = self.stream_cache.get(video_id, cancel).await?;
        let to_reader = |format: &Value| -> Result<RangeReader> {
            let itag = format["itag"].as_i64().ok_or(Error::NotFound)?;
            let size: u64 = format["contentLength"]
                .as_str()
                .and_then(|v| v.parse().ok())
                .ok_or(Error::NotFound)?;
            let name = dash::stream_file_name(format).ok_or(Error::NotFound)?;
            let file = FileItem {
                id: format!("{video_id}/{itag}"),
                mime_type: format["mimeType"].as_str().map(str::to_string),
                size: Some(size),
                timestamp: None,
                payload: ItemPayload::YouTube(YouTubeItem::Stream {
                    video_id: video_id.to_string(),
                    itag,
                    size,
                }),
                name,
            };
            Ok(RangeReader::new(
                Arc::new(self.clone()),
                file,
                cancel.clone(),
            ))
        };
        let video = to_reader(data.best_video(container)?)?;
        let audio = to_reader(data.best_audio(container)?)?;
        self.muxer.mux(video, audio, container, cancel).await
    }

    fn playlist_entry(
        directory_id: &str,
        presentation: Presentation,
        entry: &Value,
    ) -> Option<Item> {
        let snippet = &entry["snippet"];
        let video_id = snippet["resourceId"]["videoId"].as_str()?.to_string();
        let title = snippet["title"].as_str()?.to_string();
        let timestamp = snippet["publishedAt"]
            .as_str()
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|v| v.to_utc());
        let thumbnail_url = snippet["thumbnails"]["default"]["url"]
            .as_str()
            .map(str::to_string);

        match presentation {
            Presentation::Dash => {
                let name = format!("{title}.mpd");
                Some(Item::File(FileItem {
                    id: format!("{directory_id}{}", Self::encode_name(&name)),
                    size: Some(DASH_MANIFEST_SIZE),
                    timestamp,
                    mime_type: Some("application/dash+xml".into()),
                    payload: ItemPayload::YouTube(YouTubeItem::DashManifest {
                        video_id,
                        thumbnail_url,
                    }),
                    name,
                }))
            }
            Presentation::Stream => Some(Item::Directory(DirectoryItem {
                id: format!("{directory_id}{}/", Self::encode_name(&title)),
                name: title,
                timestamp,
                payload: ItemPayload::YouTube(YouTubeItem::StreamDirectory { video_id }),
            })),
            Presentation::MuxedWebm | Presentation::MuxedMp4 => {
                let container = presentation.container()?;
                let extension = match container {
                    MediaContainer::Webm => "webm",
                    MediaContainer::Mp4 => "mp4",
                };
                let name = format!("{title}.{extension}");
                Some(Item::File(FileItem {
                    id: format!("{directory_id}{}", Self::encode_name(&name)),
                    size: None,
                    timestamp,
                    mime_type: Some("application/octet-stream".into()),
                    payload: ItemPayload::YouTube(YouTubeItem::MuxedStream {
                        video_id,
                        container,
                        thumbnail_url,
                    }),
                    name,
                }))
            }
        }
    }
}

#[async_trait::async_trait]
impl Provider for YouTube {
    fn kind(&self) -> ProviderKind {
        ProviderKind::YouTube
    }

    async fn get_root(&self, _cancel: &CancellationToken) -> Result<DirectoryItem> {
        Ok(DirectoryItem {
            id: "/".into(),
            name: String::new(),
            timestamp: None,
            payload: ItemPayload::YouTube(YouTubeItem::Root {
                presentation: Presentation::Dash,
            }),
        })
    }

    async fn get_general_data(&self, cancel: &CancellationToken) -> Result<GeneralData> {
        let json = self
            .auth
            .fetch_json(HttpRequest::get(USERINFO_ENDPOINT), cancel)
            .await?;
        Ok(GeneralData {
            username: json["email"]
                .as_str()
                .ok_or_else(|| Error::parse("userinfo missing email"))?
                .to_string(),
            space_used: None,
            space_total: None,
        })
    }

    async fn list_directory_page(
        &self,
        directory: &DirectoryItem,
        page_token: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<PageData> {
        match Self::payload(&directory.payload)?.clone() {
            YouTubeItem::Root { presentation } => {
                let url = Self::endpoint(
                    "/channels",
                    &[
                        ("mine", "true"),
                        ("part", "contentDetails,snippet"),
                        ("maxResults", "50"),
                    ],
                );
                let json = self.auth.fetch_json(HttpRequest::get(url), cancel).await?;
                let mut page = PageData::default();
                let playlists = &json["items"][0]["contentDetails"]["relatedPlaylists"];
                if let Some(playlists) = playlists.as_object() {
                    for (key, value) in playlists {
                        let Some(playlist_id) = value.as_str() else {
                            continue;
                        };
                        page.items.push(Item::Directory(DirectoryItem {
                            id: format!("{}{key}/", directory.id),
                            name: key.clone(),
                            timestamp: None,
                            payload: ItemPayload::YouTube(YouTubeItem::Playlist {
                                playlist_id: playlist_id.to_string(),
                                presentation,
                            }),
                        }));
                    }
                }
                if presentation == Presentation::Dash {
                    for (id, name, presentation) in [
                        ("/streams/", "streams", Presentation::Stream),
                        ("/muxed-webm/", "muxed-webm", Presentation::MuxedWebm),
                        ("/muxed-mp4/", "muxed-mp4", Presentation::MuxedMp4),
                    ] {
                        page.items.push(Item::Directory(DirectoryItem {
                            id: id.into(),
                            name: name.into(),
                            timestamp: None,
                            payload: ItemPayload::YouTube(YouTubeItem::Root { presentation }),
                        }));
                    }
                }
                Ok(page)
            }
            YouTubeItem::Playlist {
                playlist_id,
                presentation,
            } => {
                let mut params = vec![
                    ("part", "snippet"),
                    ("playlistId", playlist_id.as_str()),
                    ("maxResults", "50"),
                ];
                if let Some(token) = page_token.as_deref() {
                    params.push(("pageToken", token));
                }
                let url = Self::endpoint("/playlistItems", &params);
                let json = self.auth.fetch_json(HttpRequest::get(url), cancel).await?;
                let mut page = PageData::default();
                for entry in json["items"].as_array().into_iter().flatten() {
                    if let Some(item) = Self::playlist_entry(&directory.id, presentation, entry) {
                        page.items.push(item);
                    }
                }
                page.next_page_token = json["nextPageToken"].as_str().map(str::to_string);
                Ok(page)
            }
            YouTubeItem::StreamDirectory { video_id } => {
                let data = self.stream_cache.get(&video_id, cancel).await?;
                let mut page = PageData::default();
                for format in data.all_formats() {
                    let Some(size) = format["contentLength"]
                        .as_str()
                        .and_then(|v| v.parse::<u64>().ok())
                    else {
                        continue;
                    };
                    let Some(itag) = format["itag"].as_i64() else {
                        continue;
                    };
                    let Some(name) = dash::stream_file_name(format) else {
                        continue;
                    };
                    let mime_type = format["mimeType"]
                        .as_str()
                        .map(|m| m.split(';').next().unwrap_or(m).trim().to_string());
                    page.items.push(Item::File(FileItem {
                        id: format!("{}{name}", directory.id),
                        size: Some(size),
                        timestamp: directory.timestamp,
                        mime_type,
                        payload: ItemPayload::YouTube(YouTubeItem::Stream {
                            video_id: video_id.clone(),
                            itag,
                            size,
                        }),
                        name,
                    }));
                }
                Ok(page)
            }
            _ => Err(Error::Unsupported),
        }
    }

    async fn get_file_content(
        &self,
        file: &FileItem,
        range: Range,
        cancel: &CancellationToken,
    ) -> Result<ByteStream> {
        match Self::payload(&file.payload)?.clone() {
            YouTubeItem::Stream {
                video_id,
                itag,
                size,
            } => Ok(self.stream_content(video_id, itag, size, range, cancel)),
            YouTubeItem::DashManifest { video_id, .. } => {
                let data = self.stream_cache.get(&video_id, cancel).await?;
                // The manifest references sibling streams relative to its own
                // URL: "/<playlist>/<name>.mpd" maps to
                // "../streams/<playlist>/<name>/".
                let without_extension = file.id.strip_suffix(".mpd").unwrap_or(&file.id);
                let base_path = format!("../streams{without_extension}/");
                let manifest = dash::generate_manifest(&base_path, &data.adaptive_formats);
                let body = dash::render_padded(manifest, range)?;
                Ok(futures::stream::once(async move { Ok(body) }).boxed())
            }
            YouTubeItem::MuxedStream {
                video_id,
                container,
                ..
            } => self.muxed_content(&video_id, container, range, cancel).await,
            _ => Err(Error::Unsupported),
        }
    }

    async fn get_item_thumbnail(
        &self,
        file: &FileItem,
        range: Range,
        cancel: &CancellationToken,
    ) -> Result<Thumbnail> {
        let thumbnail_url = match Self::payload(&file.payload)? {
            YouTubeItem::DashManifest { thumbnail_url, .. }
            | YouTubeItem::MuxedStream { thumbnail_url, .. } => {
                thumbnail_url.clone().ok_or(Error::NotFound)?
            }
            _ => return Err(Error::NotFound),
        };
        let response = self
            .auth
            .fetch(
                HttpRequest::get(thumbnail_url).header("Range", range.to_header()),
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthToken, DiscardTokens};
    use crate::http_client::testing::{MockClient, Scripted};
    use crate::media::MediaToolsUnavailable;
    use serde_json::json;

    const PLAYER_SCRIPT: &str = concat!(
        "var Nv={xK:function(a){a.reverse()},",
        "dQ:function(a,b){var c=a[0];a[0]=a[b%a.length];a[b%a.length]=c},",
        "pW:function(a,b){a.splice(0,b)}};",
        r#"var decodeSig=function(a){a=a.split("");Nv.pW(a,2);Nv.xK(a,24);Nv.dQ(a,3);return a.join("")};"#,
    );

    fn watch_page(config: &Value) -> String {
        format!(
            "<html><script>var ytInitialPlayerResponse = {config};var other = {{}};</script>\
             <script>\"jsUrl\":\"/s/player/abcdef/base.js\"</script></html>"
        )
    }

    fn provider(http: Arc<MockClient>) -> YouTube {
        YouTube::new(
            Arc::new(AuthManager::new(
                http,
                ProviderKind::YouTube,
                Default::default(),
                AuthToken {
                    access_token: "T".into(),
                    refresh_token: None,
                },
                Arc::new(DiscardTokens),
            )),
            Arc::new(MediaToolsUnavailable),
            CancellationToken::new(),
        )
    }

    fn plain_config(url: &str) -> Value {
        json!({
            "streamingData": {
                "adaptiveFormats": [{
                    "itag": 248,
                    "mimeType": "video/webm; codecs=\"vp9\"",
                    "bitrate": 1000,
                    "contentLength": "64",
                    "url": url
                }],
                "formats": []
            }
        })
    }

    #[test]
    fn config_extraction_scans_braces() {
        let config = json!({"streamingData": {"formats": [{"itag": 18, "url": "u"}]}});
        let page = watch_page(&config);
        let extracted = get_config(&page).expect("config");
        assert_eq!(extracted["streamingData"]["formats"][0]["itag"], 18);
    }

    #[test]
    fn player_url_is_absolutised() {
        let page = watch_page(&json!({}));
        assert_eq!(
            get_player_url(&page).expect("player url"),
            "https://www.youtube.com/s/player/abcdef/base.js"
        );
    }

    #[test]
    fn descrambler_extraction_builds_op_table() {
        let descrambler = get_descrambler(PLAYER_SCRIPT).expect("descrambler");
        assert_eq!(
            descrambler.ops,
            vec![
                DescrambleOp::Splice(2),
                DescrambleOp::Reverse,
                DescrambleOp::Swap(3)
            ]
        );
        assert_eq!(descrambler.apply("0123456789"), "68795432");
    }

    #[test]
    fn missing_descrambler_pattern_is_parse_error() {
        assert!(matches!(
            get_descrambler("var nothing = 1;"),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn cipher_resolution_appends_signature() {
        let descrambler = Descrambler {
            ops: vec![DescrambleOp::Reverse],
        };
        let cipher = "s=cba&sp=sig&url=https%3A%2F%2Fmedia.example%2Fv%3Fid%3D1";
        let url = resolve_cipher(cipher, &descrambler).expect("url");
        assert_eq!(url, "https://media.example/v?id=1&sig=abc");
    }

    #[tokio::test]
    async fn concurrent_stream_data_gets_fetch_once() {
        let http = Arc::new(MockClient::new());
        let config = plain_config("https://media.example/v");
        http.push(Scripted::ok(watch_page(&config)));
        http.push(Scripted::ok(PLAYER_SCRIPT));

        let provider = Arc::new(provider(http.clone()));
        let mut tasks = Vec::new();
        for _ in 0..5 {
            let provider = provider.clone();
            tasks.push(tokio::spawn(async move {
                provider
                    .stream_cache
                    .get("vidX", &CancellationToken::new())
                    .await
            }));
        }
        for task in tasks {
            let data = task.await.expect("join").expect("stream data");
            assert_eq!(data.adaptive_formats.len(), 1);
        }
        // One watch page, one player script.
        assert_eq!(http.requests().len(), 2);
    }

    #[tokio::test]
    async fn media_4xx_invalidates_and_retries_once() {
        let http = Arc::new(MockClient::new());
        let config = plain_config("https://media.example/v");
        http.push(Scripted::ok(watch_page(&config)));
        http.push(Scripted::ok(PLAYER_SCRIPT));
        http.push(Scripted::status(403, ""));
        http.push(Scripted::ok(watch_page(&config)));
        http.push(Scripted::ok(PLAYER_SCRIPT));
        http.push(Scripted::ok("media-bytes"));

        let provider = provider(http.clone());
        let stream = provider
            .fetch_stream_chunk(
                "vidX",
                248,
                Range {
                    start: 0,
                    end: Some(63),
                },
                &CancellationToken::new(),
            )
            .await
            .expect("chunk");
        let body: Vec<_> = stream.collect().await;
        assert_eq!(body.len(), 1);
        assert_eq!(http.requests().len(), 6);
        assert_eq!(
            http.requests()[2].header("Range"),
            Some("bytes=0-63")
        );
    }

    #[tokio::test]
    async fn dash_manifest_content_is_padded_and_range_checked() {
        let http = Arc::new(MockClient::new());
        let config = plain_config("https://media.example/v");
        http.push(Scripted::ok(watch_page(&config)));
        http.push(Scripted::ok(PLAYER_SCRIPT));

        let provider = provider(http);
        let file = FileItem {
            id: "/uploads/My%20Video.mpd".into(),
            name: "My Video.mpd".into(),
            size: Some(DASH_MANIFEST_SIZE),
            timestamp: None,
            mime_type: Some("application/dash+xml".into()),
            payload: ItemPayload::YouTube(YouTubeItem::DashManifest {
                video_id: "vidX".into(),
                thumbnail_url: None,
            }),
        };
        let stream = provider
            .get_file_content(
                &file,
                Range {
                    start: 0,
                    end: Some(15_999),
                },
                &CancellationToken::new(),
            )
            .await
            .expect("content");
        let chunks: Vec<_> = stream.collect().await;
        let total: usize = chunks.iter().map(|c| c.as_ref().unwrap().len()).sum();
        assert_eq!(total, 16_000);

        let out_of_range = provider
            .get_file_content(
                &file,
                Range {
                    start: 20_000,
                    end: None,
                },
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(
            out_of_range,
            Err(Error::RangeNotSatisfiable { .. })
        ));
    }

    #[tokio::test]
    async fn muxed_stream_rejects_partial_range() {
        let http = Arc::new(MockClient::new());
        let provider = provider(http);
        let file = FileItem {
            id: "/muxed-mp4/uploads/v.mp4".into(),
            name: "v.mp4".into(),
            size: None,
            timestamp: None,
            mime_type: Some("application/octet-stream".into()),
            payload: ItemPayload::YouTube(YouTubeItem::MuxedStream {
                video_id: "vidX".into(),
                container: MediaContainer::Mp4,
                thumbnail_url: None,
            }),
        };
        let result = provider
            .get_file_content(
                &file,
                Range {
                    start: 100,
                    end: None,
                },
                &CancellationToken::new(),
            )
            .await;
        // No partial bytes are ever produced for muxed output.
        assert!(matches!(result, Err(Error::RangeNotSatisfiable { .. })));
    }

    #[tokio::test]
    async fn video_url_applies_both_descramblers() {
        let http = Arc::new(MockClient::new());
        let config = json!({
            "streamingData": {
                "adaptiveFormats": [{
                    "itag": 248,
                    "mimeType": "video/webm; codecs=\"vp9\"",
                    "contentLength": "64",
                    "signatureCipher":
                        "s=cba&sp=sig&url=https%3A%2F%2Fmedia.example%2Fv%3Fn%3Dzyx"
                }],
                "formats": []
            }
        });
        // Player with both the signature function and the n-function.
        let player = concat!(
            "var Nv={xK:function(a){a.reverse()}};",
            r#"var decodeSig=function(a){a=a.split("");Nv.xK(a,1);return a.join("")};"#,
            r#"c.get("n"))&&(b=nFn[0](b);"#,
            r#"nFn=function(a){a=a.split("");Nv.xK(a,1);return a.join("")};"#,
        );
        http.push(Scripted::ok(watch_page(&config)));
        http.push(Scripted::ok(player));

        let provider = provider(http);
        let url = provider
            .get_video_url("vidX", 248, &CancellationToken::new())
            .await
            .expect("url");
        let parsed = url::Url::parse(&url).expect("parse");
        let pairs: std::collections::HashMap<String, String> =
            parsed.query_pairs().into_owned().collect();
        // signature "cba" reversed, throttle parameter "zyx" reversed.
        assert_eq!(pairs.get("sig").map(String::as_str), Some("abc"));
        assert_eq!(pairs.get("n").map(String::as_str), Some("xyz"));
    }
}
