//! Request routing and the per-account proxy.
//!
//! Static routes cover the auth callback, account removal, assets, theme, and
//! the size summary; everything else falls through to the proxy dispatcher,
//! which decodes the first path segment into an account id and serves the
//! account's file tree. Request cancellation is composed with the account's
//! cancellation signal so either source aborts downstream fetches.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::{Extension, Path, Query, Request};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::Router;
use bytes::Bytes;
use futures::StreamExt;
use percent_encoding::percent_decode_str;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::accounts::{Account, AccountManager};
use crate::auth::exchange_code;
use crate::error::{Error, Result};
use crate::http_client::{ByteStream, link_tokens};
use crate::media::{ThumbnailGenerator, thumbnail_with_fallback};
use crate::pages;
use crate::provider::{
    AccountId, DirectoryItem, FileContent, FileItem, Item, ProviderKind, Range, list_directory,
};
use crate::webdav::{ElementData, element, multi_status};

#[derive(Clone)]
pub struct Gateway {
    pub manager: Arc<AccountManager>,
    pub thumbnailer: Arc<dyn ThumbnailGenerator>,
}

pub fn build_router(gateway: Gateway) -> Router {
    Router::new()
        .route("/", any(root_handler))
        .route("/static/{name}", get(pages::static_asset))
        .route("/theme-toggle", get(pages::theme_toggle))
        .route("/size", get(pages::size_summary))
        .route("/auth/{provider}", any(auth_callback))
        .route("/remove/{account_id}", post(remove_account))
        .fallback(proxy_dispatch)
        // The CORS layer sits inside `intercept_options` so the preflight
        // response it produces can be decorated with the WebDAV headers.
        .layer(build_cors_layer())
        .layer(middleware::from_fn(intercept_options))
        .layer(Extension(gateway.manager.clone()))
        .layer(Extension(gateway))
}

fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

const ALLOWED_METHODS: &str =
    "OPTIONS, GET, HEAD, POST, PUT, DELETE, MOVE, MKCOL, PROPFIND, PATCH, PROPPATCH";

/// Step 1 of request handling: every OPTIONS request is answered by the
/// inner [`CorsLayer`] (allow-all headers) and completed here with the
/// method list and WebDAV compliance class.
pub async fn intercept_options(request: Request, next: Next) -> Response {
    let is_options = request.method() == Method::OPTIONS;
    let mut response = next.run(request).await;
    if is_options {
        *response.status_mut() = StatusCode::NO_CONTENT;
        let headers = response.headers_mut();
        headers.insert(header::ALLOW, HeaderValue::from_static(ALLOWED_METHODS));
        headers.insert("DAV", HeaderValue::from_static("1"));
    }
    response
}

fn encode_segment(name: &str) -> String {
    crate::http_client::encode_uri_component(name)
}

fn found(location: &str) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(location) {
        headers.insert(header::LOCATION, value);
    }
    (StatusCode::FOUND, headers).into_response()
}

/// `/`: WebDAV multi-status of accounts on PROPFIND, home page otherwise.
async fn root_handler(
    Extension(manager): Extension<Arc<AccountManager>>,
    jar: axum_extra::extract::CookieJar,
    request: Request,
) -> Response {
    if request.method().as_str() == "PROPFIND" {
        let mut elements = vec![element(&ElementData {
            path: "/".into(),
            name: "root".into(),
            is_directory: true,
            size: None,
            timestamp: None,
            mime_type: None,
        })];
        if depth_of(request.headers()) != "0" {
            for account in manager.accounts().await {
                if !account.is_active() {
                    continue;
                }
                let id = account.account_id();
                elements.push(element(&ElementData {
                    path: format!("/{}/", id.encoded()),
                    name: id.to_string(),
                    is_directory: true,
                    size: None,
                    timestamp: None,
                    mime_type: None,
                }));
            }
        }
        return multi_status_response(&elements);
    }
    pages::home_page(&manager, &jar).await.into_response()
}

fn depth_of(headers: &HeaderMap) -> &str {
    headers
        .get("Depth")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("1")
}

fn multi_status_response(elements: &[String]) -> Response {
    (
        StatusCode::from_u16(207).expect("multi-status code"),
        [(header::CONTENT_TYPE, "text/xml")],
        multi_status(elements),
    )
        .into_response()
}

#[derive(serde::Deserialize)]
struct AuthCallbackQuery {
    code: Option<String>,
    #[allow(dead_code)]
    state: Option<String>,
}

/// `GET|POST /auth/<provider>`: exchange the code, create the account, and
/// land on its tree.
async fn auth_callback(
    Path(provider): Path<String>,
    Query(query): Query<AuthCallbackQuery>,
    Extension(manager): Extension<Arc<AccountManager>>,
) -> Result<Response> {
    let kind = ProviderKind::from_id(&provider).ok_or(Error::NotFound)?;
    let code = query.code.ok_or(Error::Unauthenticated)?;
    let cancel = CancellationToken::new();
    let token = exchange_code(
        &**manager.factory().http(),
        kind,
        &manager.factory().auth_data(kind),
        &code,
        &cancel,
    )
    .await?;
    let account = manager.create_account(kind, token, &cancel).await?;
    Ok(found(&format!("/{}", account.account_id().encoded())))
}

/// `POST /remove/<account_id>`.
async fn remove_account(
    Path(account_id): Path<String>,
    Extension(manager): Extension<Arc<AccountManager>>,
) -> Result<Response> {
    let id = AccountId::parse(&account_id).ok_or(Error::NotFound)?;
    manager.remove_account(&id).await;
    Ok(found("/"))
}

/// Response body that keeps the request's cancellation guard alive until the
/// client has consumed (or dropped) the stream.
struct GuardedBody {
    inner: ByteStream,
    _guard: DropGuard,
}

impl futures::Stream for GuardedBody {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

fn guarded_body(stream: ByteStream, guard: DropGuard) -> Body {
    Body::from_stream(GuardedBody {
        inner: stream,
        _guard: guard,
    })
}

/// Fallback handler: `/<account_id>/<path...>`.
async fn proxy_dispatch(Extension(gateway): Extension<Gateway>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let raw_path = parts.uri.path().to_string();
    let segments: Vec<String> = raw_path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
        .collect();

    let account = match segments
        .first()
        .and_then(|segment| AccountId::parse(segment))
    {
        Some(id) => gateway.manager.find(&id).await,
        None => None,
    };
    let Some(account) = account else {
        // No handler matches: anything that is not the root redirects home.
        return found("/");
    };

    info!(method = %parts.method, path = %raw_path, "proxy request");

    let request_token = CancellationToken::new();
    let guard = request_token.clone().drop_guard();
    let cancel = link_tokens(&account.cancel, &request_token);
    let item_path = segments[1..].join("/");

    let result = match parts.method.as_str() {
        "GET" | "HEAD" => {
            serve_item(&gateway, &account, &parts, &raw_path, &item_path, cancel, guard).await
        }
        "PROPFIND" => propfind(&account, &parts.headers, &raw_path, &item_path, cancel).await,
        "PUT" => put_file(&account, &parts.headers, &item_path, body, cancel).await,
        "MKCOL" => make_directory(&account, &item_path, cancel).await,
        "DELETE" => delete_item(&account, &item_path, cancel).await,
        "MOVE" => move_item(&account, &parts.headers, &segments, &item_path, cancel).await,
        _ => Err(Error::Unsupported),
    };
    result.unwrap_or_else(|err| err.into_response())
}

/// Parse a client `Range` header against an optionally known size. Malformed
/// headers are ignored; unsatisfiable ones fail with 416.
fn parse_range_header(value: Option<&str>, size: Option<u64>) -> Result<Option<Range>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let Some(spec) = value.strip_prefix("bytes=") else {
        return Ok(None);
    };
    if spec.contains(',') {
        return Ok(None);
    }
    let Some((start_part, end_part)) = spec.split_once('-') else {
        return Ok(None);
    };

    if start_part.is_empty() {
        // Suffix form needs a known size.
        let Some(size) = size else {
            return Ok(None);
        };
        let Ok(suffix) = end_part.parse::<u64>() else {
            return Ok(None);
        };
        if suffix == 0 {
            return Ok(None);
        }
        return Ok(Some(Range {
            start: size.saturating_sub(suffix),
            end: Some(size.saturating_sub(1)),
        }));
    }

    let Ok(start) = start_part.parse::<u64>() else {
        return Ok(None);
    };
    let end = if end_part.is_empty() {
        None
    } else {
        match end_part.parse::<u64>() {
            Ok(end) => Some(end),
            Err(_) => return Ok(None),
        }
    };
    if end.is_some_and(|end| start > end) {
        return Err(Error::RangeNotSatisfiable { size });
    }
    if let Some(size) = size {
        if start >= size {
            return Err(Error::RangeNotSatisfiable { size: Some(size) });
        }
        return Ok(Some(Range {
            start,
            end: Some(end.unwrap_or(size - 1).min(size - 1)),
        }));
    }
    Ok(Some(Range { start, end }))
}

fn wants_thumbnail(parts: &axum::http::request::Parts) -> bool {
    parts
        .uri
        .query()
        .is_some_and(|q| q.split('&').any(|pair| pair == "thumbnail"))
}

async fn serve_item(
    gateway: &Gateway,
    account: &Arc<Account>,
    parts: &axum::http::request::Parts,
    raw_path: &str,
    item_path: &str,
    cancel: CancellationToken,
    guard: DropGuard,
) -> Result<Response> {
    let item = account.resolve_path(item_path, &cancel).await?;
    match item {
        Item::Directory(directory) => {
            serve_directory(account, parts, raw_path, &directory, cancel).await
        }
        Item::File(file) => {
            if wants_thumbnail(parts) {
                return serve_thumbnail(gateway, account, parts, &file, cancel, guard).await;
            }
            serve_file(account, parts, &file, cancel, guard).await
        }
    }
}

async fn serve_file(
    account: &Arc<Account>,
    parts: &axum::http::request::Parts,
    file: &FileItem,
    cancel: CancellationToken,
    guard: DropGuard,
) -> Result<Response> {
    let range_header = parts
        .headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());
    let client_range = parse_range_header(range_header, file.size)?;
    let effective = client_range.unwrap_or_default();

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(file.mime_type.as_deref().unwrap_or("application/octet-stream"))
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    if let Ok(disposition) =
        HeaderValue::from_str(&format!("inline; filename=\"{}\"", file.name.replace('"', "")))
    {
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    }
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    let mut status = StatusCode::OK;
    if let Some(size) = file.size {
        headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&effective.length(size).to_string())
                .map_err(|_| Error::parse("content length"))?,
        );
        if client_range.is_some() {
            let end = effective.end.unwrap_or(size.saturating_sub(1));
            headers.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes {}-{end}/{size}", effective.start))
                    .map_err(|_| Error::parse("content range"))?,
            );
            status = StatusCode::PARTIAL_CONTENT;
        }
    }

    if parts.method == Method::HEAD {
        return Ok((status, headers, Body::empty()).into_response());
    }
    let stream = account
        .provider
        .get_file_content(file, effective, &cancel)
        .await?;
    Ok((status, headers, guarded_body(stream, guard)).into_response())
}

async fn serve_thumbnail(
    gateway: &Gateway,
    account: &Arc<Account>,
    parts: &axum::http::request::Parts,
    file: &FileItem,
    cancel: CancellationToken,
    guard: DropGuard,
) -> Result<Response> {
    let thumbnail = thumbnail_with_fallback(
        &*gateway.thumbnailer,
        &account.provider,
        file,
        Range::full(),
        &cancel,
    )
    .await?;
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&thumbnail.mime_type)
            .unwrap_or(HeaderValue::from_static("image/png")),
    );
    if let Some(size) = thumbnail.size
        && let Ok(value) = HeaderValue::from_str(&size.to_string())
    {
        headers.insert(header::CONTENT_LENGTH, value);
    }
    if parts.method == Method::HEAD {
        return Ok((StatusCode::OK, headers, Body::empty()).into_response());
    }
    Ok((StatusCode::OK, headers, guarded_body(thumbnail.data, guard)).into_response())
}

async fn serve_directory(
    account: &Arc<Account>,
    parts: &axum::http::request::Parts,
    raw_path: &str,
    directory: &DirectoryItem,
    cancel: CancellationToken,
) -> Result<Response> {
    let items = list_directory(&*account.provider, directory, &cancel).await?;
    let base = if raw_path.ends_with('/') {
        raw_path.to_string()
    } else {
        format!("{raw_path}/")
    };

    let mut rows = String::new();
    let parent = parent_of(&base);
    rows.push_str(&format!(
        "<tr><td>[DIR]</td><td><a href=\"{parent}\">..</a></td></tr>"
    ));
    for item in &items {
        let encoded = encode_segment(item.name());
        let (tag, href) = if item.is_directory() {
            ("DIR", format!("{base}{encoded}/"))
        } else {
            ("FILE", format!("{base}{encoded}"))
        };
        rows.push_str(&format!(
            "<tr><td>[{tag}]</td><td><a href=\"{href}\">{}</a></td></tr>",
            crate::webdav::xml_escape(item.name())
        ));
    }
    let page = format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
         <link rel=\"stylesheet\" href=\"/static/style.css\"></head>\
         <body><table>{rows}</table></body></html>"
    );

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
    if parts.method == Method::HEAD {
        return Ok((StatusCode::OK, headers, Body::empty()).into_response());
    }
    Ok((StatusCode::OK, headers, page).into_response())
}

fn parent_of(base: &str) -> String {
    let trimmed = base.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(index) => trimmed[..=index].to_string(),
        None => "/".to_string(),
    }
}

async fn propfind(
    account: &Arc<Account>,
    headers: &HeaderMap,
    raw_path: &str,
    item_path: &str,
    cancel: CancellationToken,
) -> Result<Response> {
    let item = account.resolve_path(item_path, &cancel).await?;
    let base = if raw_path.ends_with('/') {
        raw_path.to_string()
    } else {
        format!("{raw_path}/")
    };
    let self_path = if item.is_directory() {
        base.clone()
    } else {
        raw_path.to_string()
    };
    let mut elements = vec![element(&propfind_element(&item, self_path))];
    if depth_of(headers) != "0"
        && let Item::Directory(directory) = &item
    {
        for child in list_directory(&*account.provider, directory, &cancel).await? {
            let encoded = encode_segment(child.name());
            let path = if child.is_directory() {
                format!("{base}{encoded}/")
            } else {
                format!("{base}{encoded}")
            };
            elements.push(element(&propfind_element(&child, path)));
        }
    }
    Ok(multi_status_response(&elements))
}

fn propfind_element(item: &Item, path: String) -> ElementData {
    ElementData {
        path,
        name: item.name().to_string(),
        is_directory: item.is_directory(),
        size: item.size(),
        timestamp: item.timestamp(),
        mime_type: match item {
            Item::File(file) => file.mime_type.clone(),
            Item::Directory(_) => None,
        },
    }
}

fn split_parent(item_path: &str) -> Result<(&str, &str)> {
    match item_path.rsplit_once('/') {
        Some((parent, name)) if !name.is_empty() => Ok((parent, name)),
        None if !item_path.is_empty() => Ok(("", item_path)),
        _ => Err(Error::NotFound),
    }
}

async fn put_file(
    account: &Arc<Account>,
    headers: &HeaderMap,
    item_path: &str,
    body: Body,
    cancel: CancellationToken,
) -> Result<Response> {
    let (parent_path, name) = split_parent(item_path)?;
    let parent = account
        .resolve_path(parent_path, &cancel)
        .await?
        .into_directory()
        .map_err(|_| Error::NotFound)?;
    let size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    let data = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(|err| Error::Transport(err.to_string())))
        .boxed();
    account
        .provider
        .create_file(&parent, name, FileContent { data, size }, &cancel)
        .await?;
    account.invalidate_path(item_path);
    Ok(StatusCode::CREATED.into_response())
}

async fn make_directory(
    account: &Arc<Account>,
    item_path: &str,
    cancel: CancellationToken,
) -> Result<Response> {
    let (parent_path, name) = split_parent(item_path)?;
    let parent = account
        .resolve_path(parent_path, &cancel)
        .await?
        .into_directory()
        .map_err(|_| Error::NotFound)?;
    account
        .provider
        .create_directory(&parent, name, &cancel)
        .await?;
    account.invalidate_path(item_path);
    Ok(StatusCode::CREATED.into_response())
}

async fn delete_item(
    account: &Arc<Account>,
    item_path: &str,
    cancel: CancellationToken,
) -> Result<Response> {
    let item = account.resolve_path(item_path, &cancel).await?;
    account.provider.remove_item(&item, &cancel).await?;
    account.invalidate_path(item_path);
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn move_item(
    account: &Arc<Account>,
    headers: &HeaderMap,
    source_segments: &[String],
    item_path: &str,
    cancel: CancellationToken,
) -> Result<Response> {
    let destination = headers
        .get("Destination")
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::Unsupported)?;
    let destination_path = match url::Url::parse(destination) {
        Ok(url) => url.path().to_string(),
        Err(_) => destination.to_string(),
    };
    let destination_segments: Vec<String> = destination_path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
        .collect();

    // Cross-account moves are out of scope.
    if destination_segments.first() != source_segments.first() {
        return Err(Error::Unsupported);
    }
    let (destination_parent, destination_name) = match destination_segments[1..].split_last() {
        Some((name, parent)) => (parent.join("/"), name.clone()),
        None => return Err(Error::Unsupported),
    };

    let source = account.resolve_path(item_path, &cancel).await?;
    let (source_parent, _) = split_parent(item_path)?;

    if destination_parent == source_parent {
        account
            .provider
            .rename_item(&source, &destination_name, &cancel)
            .await?;
    } else if destination_name == source.name() {
        let parent = account
            .resolve_path(&destination_parent, &cancel)
            .await?
            .into_directory()
            .map_err(|_| Error::NotFound)?;
        account.provider.move_item(&source, &parent, &cancel).await?;
    } else {
        return Err(Error::Unsupported);
    }
    account.invalidate_path(item_path);
    account.invalidate_path(&destination_segments[1..].join("/"));
    Ok(StatusCode::CREATED.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_math_matches_http_semantics() {
        // 100-byte file, bytes=10-29.
        let range = parse_range_header(Some("bytes=10-29"), Some(100))
            .expect("parse")
            .expect("range");
        assert_eq!(range.start, 10);
        assert_eq!(range.end, Some(29));
        assert_eq!(range.length(100), 20);
    }

    #[test]
    fn open_ended_range_is_clamped_to_size() {
        let range = parse_range_header(Some("bytes=10-"), Some(100))
            .expect("parse")
            .expect("range");
        assert_eq!(range.end, Some(99));
        let range = parse_range_header(Some("bytes=0-200"), Some(100))
            .expect("parse")
            .expect("range");
        assert_eq!(range.end, Some(99));
    }

    #[test]
    fn suffix_range_counts_from_the_end() {
        let range = parse_range_header(Some("bytes=-10"), Some(100))
            .expect("parse")
            .expect("range");
        assert_eq!(range.start, 90);
        assert_eq!(range.end, Some(99));
        // Without a known size the suffix form is ignored.
        assert_eq!(
            parse_range_header(Some("bytes=-10"), None).expect("parse"),
            None
        );
    }

    #[test]
    fn unsatisfiable_ranges_are_rejected() {
        assert!(matches!(
            parse_range_header(Some("bytes=100-"), Some(100)),
            Err(Error::RangeNotSatisfiable { size: Some(100) })
        ));
        assert!(matches!(
            parse_range_header(Some("bytes=30-10"), Some(100)),
            Err(Error::RangeNotSatisfiable { .. })
        ));
    }

    #[test]
    fn malformed_ranges_are_ignored() {
        assert_eq!(
            parse_range_header(Some("bytes=a-b"), Some(100)).expect("parse"),
            None
        );
        assert_eq!(
            parse_range_header(Some("bytes=0-1,5-9"), Some(100)).expect("parse"),
            None
        );
        assert_eq!(
            parse_range_header(Some("items=0-1"), Some(100)).expect("parse"),
            None
        );
    }

    #[test]
    fn parent_paths() {
        assert_eq!(parent_of("/acct/dir/"), "/acct/");
        assert_eq!(parent_of("/acct/"), "/");
    }

    #[test]
    fn split_parent_separates_the_leaf() {
        assert_eq!(split_parent("a/b/c").expect("split"), ("a/b", "c"));
        assert_eq!(split_parent("c").expect("split"), ("", "c"));
        assert!(split_parent("").is_err());
    }

    mod scenarios {
        use super::*;
        use crate::accounts::LogListener;
        use crate::auth::AuthToken;
        use crate::config::OauthSettings;
        use crate::http_client::testing::{MockClient, Scripted};
        use crate::media::MediaToolsUnavailable;
        use crate::providers::CloudFactory;
        use crate::token_store::TokenStore;
        use tower::ServiceExt;

        fn gateway(http: Arc<MockClient>) -> (Router, Arc<AccountManager>, tempfile::TempDir) {
            let temp = tempfile::tempdir().expect("tempdir");
            let store = Arc::new(TokenStore::new(temp.path().join("settings.json")));
            let factory = CloudFactory::new(
                http.clone(),
                Arc::new(MediaToolsUnavailable),
                OauthSettings::default(),
                "http://localhost:8080".into(),
            );
            let manager = Arc::new(AccountManager::new(
                http,
                factory,
                store,
                Box::new(LogListener),
            ));
            let router = build_router(Gateway {
                manager: manager.clone(),
                thumbnailer: Arc::new(MediaToolsUnavailable),
            });
            (router, manager, temp)
        }

        async fn install_box_account(manager: &AccountManager) {
            manager
                .create_account(
                    ProviderKind::Box,
                    AuthToken {
                        access_token: "T".into(),
                        refresh_token: None,
                    },
                    &CancellationToken::new(),
                )
                .await
                .expect("create account");
        }

        fn box_listing() -> Scripted {
            Scripted::ok(
                serde_json::to_string(&serde_json::json!({
                    "entries": [
                        {"type": "file", "id": "11", "name": "a.mp4", "size": 100,
                         "modified_at": "2024-03-01T11:00:00Z"}
                    ],
                    "offset": 0, "limit": 1, "total_count": 1
                }))
                .unwrap(),
            )
        }

        async fn read_body(response: Response) -> Bytes {
            axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .expect("body")
        }

        #[tokio::test]
        async fn options_preflight_is_handled_everywhere() {
            let http = Arc::new(MockClient::new());
            let (router, _manager, _temp) = gateway(http);
            let response = router
                .oneshot(
                    axum::http::Request::builder()
                        .method("OPTIONS")
                        .uri("/anything/at/all")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
            assert_eq!(
                response.headers().get("DAV").and_then(|v| v.to_str().ok()),
                Some("1")
            );
            assert_eq!(
                response
                    .headers()
                    .get(header::ALLOW)
                    .and_then(|v| v.to_str().ok()),
                Some(ALLOWED_METHODS)
            );
            // Allow-all CORS comes from the CorsLayer.
            assert_eq!(
                response
                    .headers()
                    .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                    .and_then(|v| v.to_str().ok()),
                Some("*")
            );
        }

        #[tokio::test]
        async fn unknown_path_redirects_home() {
            let http = Arc::new(MockClient::new());
            let (router, _manager, _temp) = gateway(http);
            let response = router
                .oneshot(
                    axum::http::Request::builder()
                        .uri("/no-such-account/file")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::FOUND);
            assert_eq!(
                response
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|v| v.to_str().ok()),
                Some("/")
            );
        }

        #[tokio::test]
        async fn range_request_streams_partial_content() {
            let http = Arc::new(MockClient::new());
            http.push(Scripted::ok(
                r#"{"login": "alice", "space_used": 1, "space_amount": 2}"#,
            ));
            let (router, manager, _temp) = gateway(http.clone());
            install_box_account(&manager).await;

            http.push(box_listing());
            http.push(Scripted::status(206, "ABCDEFGHIJKLMNOPQRST"));

            let response = router
                .oneshot(
                    axum::http::Request::builder()
                        .uri("/box%2Falice/a.mp4")
                        .header(header::RANGE, "bytes=10-29")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
            assert_eq!(
                response
                    .headers()
                    .get(header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok()),
                Some("20")
            );
            assert_eq!(
                response
                    .headers()
                    .get(header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok()),
                Some("bytes 10-29/100")
            );
            assert_eq!(
                response
                    .headers()
                    .get(header::ACCEPT_RANGES)
                    .and_then(|v| v.to_str().ok()),
                Some("bytes")
            );
            let body = read_body(response).await;
            assert_eq!(&body[..], b"ABCDEFGHIJKLMNOPQRST");

            // The upstream content request carried the client's range.
            let content_request = http.requests().into_iter().last().expect("request");
            assert!(content_request.url.contains("/files/11/content"));
            assert_eq!(content_request.header("Range"), Some("bytes=10-29"));
        }

        #[tokio::test]
        async fn root_propfind_lists_accounts_at_depth_one() {
            let http = Arc::new(MockClient::new());
            http.push(Scripted::ok(
                r#"{"login": "alice", "space_used": 1, "space_amount": 2}"#,
            ));
            let (router, manager, _temp) = gateway(http.clone());
            install_box_account(&manager).await;

            let response = router
                .clone()
                .oneshot(
                    axum::http::Request::builder()
                        .method("PROPFIND")
                        .uri("/")
                        .header("Depth", "1")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status().as_u16(), 207);
            let body = String::from_utf8(read_body(response).await.to_vec()).unwrap();
            assert!(body.contains("<d:href>/box%2Falice/</d:href>"));

            // Depth 0 keeps the root only.
            let response = router
                .oneshot(
                    axum::http::Request::builder()
                        .method("PROPFIND")
                        .uri("/")
                        .header("Depth", "0")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            let body = String::from_utf8(read_body(response).await.to_vec()).unwrap();
            assert!(!body.contains("box%2Falice"));
        }

        #[tokio::test]
        async fn home_page_renders_provider_links() {
            let http = Arc::new(MockClient::new());
            let (router, _manager, _temp) = gateway(http);
            let response = router
                .oneshot(
                    axum::http::Request::builder()
                        .uri("/")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = String::from_utf8(read_body(response).await.to_vec()).unwrap();
            assert!(body.contains("accounts.google.com"));
            assert!(body.contains("account.box.com"));
            assert!(body.contains("theme-toggle"));
        }
    }
}
