//! HTTP client contract used by every provider.
//!
//! The gateway talks to remote services through the [`HttpClient`] trait so
//! tests can substitute a scripted transport. The production implementation
//! wraps `reqwest` with redirect handling done by hand: some providers answer
//! with a 302 to a pre-signed URL and expect the original `Range` header to be
//! re-applied on the next hop, which automatic redirect policies drop.

use std::task::Poll;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http::{HeaderMap, Method};
use tokio_util::sync::CancellationToken;

use crate::config::MAX_REDIRECT_HOPS;
use crate::error::{Error, Result};

/// Lazy, finite, non-restartable byte-chunk sequence.
pub type ByteStream = futures::stream::BoxStream<'static, Result<Bytes>>;

/// Outgoing request body.
pub enum RequestBody {
    Empty,
    Bytes(Bytes),
    Stream(ByteStream),
}

/// Outgoing request description.
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    pub follow_redirects: bool,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
            follow_redirects: true,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn bearer(self, access_token: &str) -> Self {
        self.header("Authorization", format!("Bearer {access_token}"))
    }

    /// `application/x-www-form-urlencoded` body.
    pub fn form(mut self, pairs: &[(&str, &str)]) -> Self {
        self.headers.push((
            "Content-Type".into(),
            "application/x-www-form-urlencoded".into(),
        ));
        self.body = RequestBody::Bytes(Bytes::from(form_encode(pairs)));
        self
    }

    /// JSON body.
    pub fn json(mut self, value: &serde_json::Value) -> Self {
        self.headers
            .push(("Content-Type".into(), "application/json".into()));
        self.body = RequestBody::Bytes(Bytes::from(value.to_string()));
        self
    }

    pub fn bytes(mut self, data: Bytes) -> Self {
        self.body = RequestBody::Bytes(data);
        self
    }

    pub fn stream(mut self, data: ByteStream) -> Self {
        self.body = RequestBody::Stream(data);
        self
    }

    pub fn no_redirects(mut self) -> Self {
        self.follow_redirects = false;
        self
    }

    /// Clone for a retry. Streaming bodies are not replayable.
    pub fn try_clone(&self) -> Option<Self> {
        let body = match &self.body {
            RequestBody::Empty => RequestBody::Empty,
            RequestBody::Bytes(b) => RequestBody::Bytes(b.clone()),
            RequestBody::Stream(_) => return None,
        };
        Some(Self {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body,
            follow_redirects: self.follow_redirects,
        })
    }
}

/// Response with a streaming body.
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }

    /// Fail unless the status is 2xx.
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::from_status(self.status))
        }
    }

    pub async fn bytes(self) -> Result<Bytes> {
        let mut chunks = Vec::new();
        let mut body = self.body;
        while let Some(chunk) = body.next().await {
            chunks.push(chunk?);
        }
        Ok(Bytes::from(chunks.concat()))
    }

    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|err| Error::parse(err.to_string()))
    }

    pub async fn json<T: serde::de::DeserializeOwned>(self) -> Result<T> {
        let bytes = self.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Asynchronous fetch with cooperative cancellation.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn fetch(&self, request: HttpRequest, cancel: &CancellationToken) -> Result<HttpResponse>;
}

/// Encode key/value pairs as a form/query string.
pub fn form_encode(pairs: &[(&str, &str)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

/// Characters escaped when a name becomes one URL path segment. Matches the
/// classic `encodeURIComponent` set so extensions like `.mpd` survive.
const URI_COMPONENT: &percent_encoding::AsciiSet = &percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'!')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

pub fn encode_uri_component(value: &str) -> String {
    percent_encoding::utf8_percent_encode(value, URI_COMPONENT).to_string()
}

/// Child token that fires when either parent fires.
pub fn link_tokens(a: &CancellationToken, b: &CancellationToken) -> CancellationToken {
    let child = a.child_token();
    let out = child.clone();
    let b = b.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = b.cancelled() => child.cancel(),
            _ = child.cancelled() => {}
        }
    });
    out
}

/// Terminate `stream` when `cancel` fires, surfacing the cancellation in-band.
pub fn guard_stream(stream: ByteStream, cancel: CancellationToken) -> ByteStream {
    let tail = cancel.clone();
    let mut reported = false;
    stream
        .take_until(Box::pin(cancel.cancelled_owned()))
        .chain(futures::stream::poll_fn(move |_| {
            if reported || !tail.is_cancelled() {
                Poll::Ready(None)
            } else {
                reported = true;
                Poll::Ready(Some(Err(Error::Cancelled)))
            }
        }))
        .boxed()
}

fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

/// Production transport backed by `reqwest`.
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        headers: &[(String, String)],
        body: Option<reqwest::Body>,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse> {
        let mut builder = self.client.request(method.clone(), url);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = builder.send() => result?,
        };
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(Error::from))
            .boxed();
        Ok(HttpResponse {
            status,
            headers,
            body: guard_stream(body, cancel.clone()),
        })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn fetch(&self, request: HttpRequest, cancel: &CancellationToken) -> Result<HttpResponse> {
        let HttpRequest {
            mut method,
            mut url,
            headers,
            body,
            follow_redirects,
        } = request;

        // A streaming body cannot be replayed across hops.
        let mut replay = match body {
            RequestBody::Empty => None,
            RequestBody::Bytes(bytes) => Some(bytes),
            RequestBody::Stream(stream) => {
                return self
                    .send_once(
                        &method,
                        &url,
                        &headers,
                        Some(reqwest::Body::wrap_stream(stream)),
                        cancel,
                    )
                    .await;
            }
        };

        let mut hops = 0;
        loop {
            let body = replay.clone().map(reqwest::Body::from);
            let response = self.send_once(&method, &url, &headers, body, cancel).await?;
            if !follow_redirects || !is_redirect(response.status) || hops >= MAX_REDIRECT_HOPS {
                return Ok(response);
            }
            let Some(location) = response.header("location").map(str::to_string) else {
                return Ok(response);
            };
            url = url::Url::parse(&url)
                .and_then(|base| base.join(&location))
                .map(String::from)
                .map_err(|err| Error::parse(err.to_string()))?;
            if response.status == 303 {
                method = Method::GET;
                replay = None;
            }
            hops += 1;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn response_helpers_decode_body() {
        let response = HttpResponse {
            status: 200,
            headers: HeaderMap::new(),
            body: futures::stream::iter(vec![
                Ok(Bytes::from_static(b"{\"a\":")),
                Ok(Bytes::from_static(b"1}")),
            ])
            .boxed(),
        };
        let value: serde_json::Value = response.json().await.expect("json");
        assert_eq!(value["a"], 1);
    }

    #[tokio::test]
    async fn guarded_stream_reports_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stream = futures::stream::pending().boxed();
        let mut guarded = guard_stream(stream, cancel);
        match guarded.next().await {
            Some(Err(Error::Cancelled)) => {}
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert!(guarded.next().await.is_none());
    }

    #[tokio::test]
    async fn linked_token_fires_on_either_parent() {
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        let linked = link_tokens(&a, &b);
        assert!(!linked.is_cancelled());
        b.cancel();
        linked.cancelled().await;
    }

    #[test]
    fn form_encoding() {
        assert_eq!(
            form_encode(&[("grant_type", "refresh_token"), ("code", "a b")]),
            "grant_type=refresh_token&code=a+b"
        );
    }
}
