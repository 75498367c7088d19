//! CLI arguments and gateway configuration defaults.

use clap::Parser;

use crate::provider::ProviderKind;

/// Chunk size for YouTube media sub-requests.
pub const STREAM_CHUNK_SIZE: u64 = 10_000_000;
/// Maximum redirect hops followed by the HTTP client.
pub const MAX_REDIRECT_HOPS: u32 = 8;
/// Fixed rendered size of a synthesised DASH manifest.
pub const DASH_MANIFEST_SIZE: u64 = 16_192;
/// Capacity of the per-account stream-metadata cache.
pub const STREAM_CACHE_CAPACITY: usize = 32;
/// Capacity of the per-account path-resolution cache.
pub const ITEM_CACHE_CAPACITY: usize = 512;
/// Cookie carrying the selected UI theme.
pub const THEME_COOKIE_NAME: &str = "CIRRUS_THEME";
/// Default location of the persisted token file.
pub const DEFAULT_TOKEN_FILE: &str = ".cirrus/settings.json";

/// CLI arguments and environment configuration for the gateway.
#[derive(Parser, Debug)]
#[command(name = "cirrus", version, about = "Cirrus cloud-storage gateway")]
pub struct Args {
    #[arg(
        short = 'b',
        long,
        env = "CIRRUS_BIND",
        default_value = "127.0.0.1",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "CIRRUS_PORT",
        default_value_t = 8080,
        help = "Listen port"
    )]
    pub port: u16,
    #[arg(
        short = 't',
        long,
        env = "CIRRUS_TOKEN_FILE",
        default_value = DEFAULT_TOKEN_FILE,
        help = "Path of the persisted auth-token file"
    )]
    pub token_file: String,
    #[arg(
        long,
        env = "CIRRUS_REDIRECT_HOST",
        help = "External origin used in OAuth redirect URIs (defaults to http://<bind>:<port>)"
    )]
    pub redirect_host: Option<String>,
}

impl Args {
    /// Origin that OAuth providers redirect back to.
    pub fn external_origin(&self) -> String {
        self.redirect_host
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
    }
}

/// OAuth client credentials for one provider.
#[derive(Clone, Debug, Default)]
pub struct OauthApp {
    pub client_id: String,
    pub client_secret: String,
}

/// OAuth client registrations, read from `CIRRUS_<PROVIDER>_CLIENT_{ID,SECRET}`.
#[derive(Clone, Debug, Default)]
pub struct OauthSettings {
    pub google_drive: OauthApp,
    pub dropbox: OauthApp,
    pub one_drive: OauthApp,
    pub boxcom: OauthApp,
    pub youtube: OauthApp,
}

impl OauthSettings {
    pub fn from_env() -> Self {
        fn app(prefix: &str) -> OauthApp {
            OauthApp {
                client_id: std::env::var(format!("CIRRUS_{prefix}_CLIENT_ID")).unwrap_or_default(),
                client_secret: std::env::var(format!("CIRRUS_{prefix}_CLIENT_SECRET"))
                    .unwrap_or_default(),
            }
        }
        Self {
            google_drive: app("GOOGLE"),
            dropbox: app("DROPBOX"),
            one_drive: app("ONEDRIVE"),
            boxcom: app("BOX"),
            youtube: app("YOUTUBE"),
        }
    }

    pub fn app(&self, kind: ProviderKind) -> &OauthApp {
        match kind {
            ProviderKind::GoogleDrive => &self.google_drive,
            ProviderKind::Dropbox => &self.dropbox,
            ProviderKind::OneDrive => &self.one_drive,
            ProviderKind::Box => &self.boxcom,
            ProviderKind::YouTube => &self.youtube,
        }
    }
}
