//! OAuth flows and the per-account auth manager.
//!
//! The auth manager owns the current token cell for one account. Refreshes are
//! serialised behind a single-slot mutex: the first caller hitting a 401
//! performs the round-trip, later waiters detect the already-swapped cell by
//! comparing the token reference and reuse the result. Every successful
//! refresh is persisted through the [`TokenSink`] before the cell is replaced.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::http_client::{HttpClient, HttpRequest, HttpResponse, form_encode};
use crate::provider::ProviderKind;

/// OAuth token pair. Provider-specific extras round-trip through the stored
/// JSON blob in the token store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// OAuth client registration plus the gateway's callback URI.
#[derive(Clone, Debug, Default)]
pub struct AuthData {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

fn token_endpoint(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::GoogleDrive | ProviderKind::YouTube => "https://oauth2.googleapis.com/token",
        ProviderKind::Dropbox => "https://api.dropboxapi.com/oauth2/token",
        ProviderKind::OneDrive => "https://login.microsoftonline.com/common/oauth2/v2.0/token",
        ProviderKind::Box => "https://api.box.com/oauth2/token",
    }
}

/// Fixed-format provider consent URL.
pub fn authorization_url(kind: ProviderKind, data: &AuthData, state: &str) -> String {
    match kind {
        ProviderKind::GoogleDrive | ProviderKind::YouTube => {
            let scope = if kind == ProviderKind::YouTube {
                "https://www.googleapis.com/auth/youtube.readonly openid email"
            } else {
                "https://www.googleapis.com/auth/drive openid email"
            };
            format!(
                "https://accounts.google.com/o/oauth2/auth?{}",
                form_encode(&[
                    ("response_type", "code"),
                    ("client_id", &data.client_id),
                    ("redirect_uri", &data.redirect_uri),
                    ("scope", scope),
                    ("access_type", "offline"),
                    ("prompt", "consent"),
                    ("state", state),
                ])
            )
        }
        ProviderKind::Dropbox => format!(
            "https://www.dropbox.com/oauth2/authorize?{}",
            form_encode(&[
                ("response_type", "code"),
                ("client_id", &data.client_id),
                ("redirect_uri", &data.redirect_uri),
                ("token_access_type", "offline"),
                ("state", state),
            ])
        ),
        ProviderKind::OneDrive => format!(
            "https://login.microsoftonline.com/common/oauth2/v2.0/authorize?{}",
            form_encode(&[
                ("response_type", "code"),
                ("client_id", &data.client_id),
                ("redirect_uri", &data.redirect_uri),
                ("scope", "offline_access user.read files.readwrite"),
                ("state", state),
            ])
        ),
        ProviderKind::Box => format!(
            "https://account.box.com/api/oauth2/authorize?{}",
            form_encode(&[
                ("response_type", "code"),
                ("client_id", &data.client_id),
                ("redirect_uri", &data.redirect_uri),
                ("state", state),
            ])
        ),
    }
}

fn decode_token(json: serde_json::Value, previous_refresh: Option<&str>) -> Result<AuthToken> {
    let access_token = json["access_token"]
        .as_str()
        .ok_or_else(|| Error::parse("token response missing access_token"))?
        .to_string();
    // Providers that do not rotate refresh tokens omit the field; keep the
    // old one in that case.
    let refresh_token = json["refresh_token"]
        .as_str()
        .map(str::to_string)
        .or_else(|| previous_refresh.map(str::to_string));
    Ok(AuthToken {
        access_token,
        refresh_token,
    })
}

/// POST the authorization code to the provider's token endpoint.
pub async fn exchange_code(
    http: &dyn HttpClient,
    kind: ProviderKind,
    data: &AuthData,
    code: &str,
    cancel: &CancellationToken,
) -> Result<AuthToken> {
    let request = HttpRequest::post(token_endpoint(kind)).form(&[
        ("grant_type", "authorization_code"),
        ("client_id", &data.client_id),
        ("client_secret", &data.client_secret),
        ("redirect_uri", &data.redirect_uri),
        ("code", code),
    ]);
    let json: serde_json::Value = http
        .fetch(request, cancel)
        .await?
        .error_for_status()?
        .json()
        .await?;
    decode_token(json, None)
}

/// Trade the refresh token for a fresh access token.
pub async fn refresh_access_token(
    http: &dyn HttpClient,
    kind: ProviderKind,
    data: &AuthData,
    token: &AuthToken,
    cancel: &CancellationToken,
) -> Result<AuthToken> {
    let refresh_token = token
        .refresh_token
        .as_deref()
        .ok_or(Error::Unauthenticated)?;
    let request = HttpRequest::post(token_endpoint(kind)).form(&[
        ("grant_type", "refresh_token"),
        ("client_id", &data.client_id),
        ("client_secret", &data.client_secret),
        ("refresh_token", refresh_token),
    ]);
    let json: serde_json::Value = http
        .fetch(request, cancel)
        .await?
        .error_for_status()?
        .json()
        .await?;
    decode_token(json, token.refresh_token.as_deref())
}

/// Persistence hook invoked before a refreshed token replaces the cell.
#[async_trait]
pub trait TokenSink: Send + Sync {
    async fn persist(&self, token: &AuthToken) -> Result<()>;
}

/// Sink for accounts that have nothing to persist (tests, provisioning).
pub struct DiscardTokens;

#[async_trait]
impl TokenSink for DiscardTokens {
    async fn persist(&self, _token: &AuthToken) -> Result<()> {
        Ok(())
    }
}

/// Per-account token cell plus authenticated fetch helpers.
pub struct AuthManager {
    http: Arc<dyn HttpClient>,
    kind: ProviderKind,
    data: AuthData,
    token: Mutex<Arc<AuthToken>>,
    refresh_slot: Mutex<()>,
    sink: Arc<dyn TokenSink>,
}

impl AuthManager {
    pub fn new(
        http: Arc<dyn HttpClient>,
        kind: ProviderKind,
        data: AuthData,
        token: AuthToken,
        sink: Arc<dyn TokenSink>,
    ) -> Self {
        Self {
            http,
            kind,
            data,
            token: Mutex::new(Arc::new(token)),
            refresh_slot: Mutex::new(()),
            sink,
        }
    }

    pub fn http(&self) -> &Arc<dyn HttpClient> {
        &self.http
    }

    pub async fn current_token(&self) -> Arc<AuthToken> {
        self.token.lock().await.clone()
    }

    /// Fetch with `Authorization: Bearer`; on 401 refresh once and retry the
    /// original request exactly once.
    pub async fn fetch(
        &self,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse> {
        let token = self.current_token().await;
        let retry = request.try_clone();
        let response = self
            .http
            .fetch(request.bearer(&token.access_token), cancel)
            .await?;
        if response.status != 401 {
            return Ok(response);
        }
        let Some(retry) = retry else {
            // Streaming bodies cannot be replayed; surface the 401.
            return Ok(response);
        };
        let refreshed = self.refresh(token, cancel).await?;
        self.http
            .fetch(retry.bearer(&refreshed.access_token), cancel)
            .await
    }

    /// Fetch and decode the body as JSON, failing on non-2xx.
    pub async fn fetch_json(
        &self,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        self.fetch(request, cancel)
            .await?
            .error_for_status()?
            .json()
            .await
    }

    /// Serialised refresh. `observed` is the token the caller saw fail; when
    /// the cell no longer holds it, another waiter already refreshed and the
    /// current cell is reused.
    async fn refresh(
        &self,
        observed: Arc<AuthToken>,
        cancel: &CancellationToken,
    ) -> Result<Arc<AuthToken>> {
        let _slot = self.refresh_slot.lock().await;
        let current = self.token.lock().await.clone();
        if !Arc::ptr_eq(&current, &observed) {
            return Ok(current);
        }
        debug!(provider = self.kind.id(), "refreshing access token");
        let refreshed =
            refresh_access_token(&*self.http, self.kind, &self.data, &current, cancel)
                .await
                .map_err(|err| match err {
                    Error::Cancelled => Error::Cancelled,
                    other => Error::AuthRefreshFailed(other.to_string()),
                })?;
        self.sink.persist(&refreshed).await?;
        let replacement = Arc::new(refreshed);
        *self.token.lock().await = replacement.clone();
        Ok(replacement)
    }
}
