//! Concrete provider implementations and their factory.

pub mod boxdrive;
pub mod dropbox;
pub mod google_drive;
pub mod onedrive;
pub mod youtube;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::auth::{AuthData, AuthManager};
use crate::config::OauthSettings;
use crate::http_client::HttpClient;
use crate::media::Muxer;
use crate::provider::{Provider, ProviderKind};

/// Builds provider instances and their OAuth client data.
pub struct CloudFactory {
    http: Arc<dyn HttpClient>,
    muxer: Arc<dyn Muxer>,
    oauth: OauthSettings,
    external_origin: String,
}

impl CloudFactory {
    pub fn new(
        http: Arc<dyn HttpClient>,
        muxer: Arc<dyn Muxer>,
        oauth: OauthSettings,
        external_origin: String,
    ) -> Self {
        Self {
            http,
            muxer,
            oauth,
            external_origin,
        }
    }

    pub fn http(&self) -> &Arc<dyn HttpClient> {
        &self.http
    }

    /// OAuth client registration plus the gateway's callback URI.
    pub fn auth_data(&self, kind: ProviderKind) -> AuthData {
        let app = self.oauth.app(kind);
        AuthData {
            client_id: app.client_id.clone(),
            client_secret: app.client_secret.clone(),
            redirect_uri: format!("{}/auth/{}", self.external_origin, kind.id()),
        }
    }

    /// Instantiate the provider for one account. `account_cancel` scopes the
    /// provider's internal caches to the account lifetime.
    pub fn create(
        &self,
        kind: ProviderKind,
        auth: Arc<AuthManager>,
        account_cancel: &CancellationToken,
    ) -> Arc<dyn Provider> {
        match kind {
            ProviderKind::GoogleDrive => Arc::new(google_drive::GoogleDrive::new(auth)),
            ProviderKind::Dropbox => Arc::new(dropbox::Dropbox::new(auth)),
            ProviderKind::OneDrive => Arc::new(onedrive::OneDrive::new(auth)),
            ProviderKind::Box => Arc::new(boxdrive::BoxDrive::new(auth)),
            ProviderKind::YouTube => Arc::new(youtube::YouTube::new(
                auth,
                self.muxer.clone(),
                account_cancel.clone(),
            )),
        }
    }
}
