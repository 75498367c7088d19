//! Cirrus gateway binary.
//!
//! This crate presents multiple remote cloud-storage accounts as one
//! HTTP/WebDAV file tree with streaming ranged reads, OAuth token
//! management, and on-the-fly DASH manifest synthesis. The main entry point
//! wires the HTTP client, token store, and account manager into the axum
//! router and serves until shutdown.

mod accounts;
mod atomic;
mod auth;
mod config;
mod dash;
mod error;
mod http_client;
mod logging;
mod media;
mod pages;
mod provider;
mod providers;
mod router;
mod stream_cache;
mod token_store;
mod webdav;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::Request;
use axum_server::Handle;
use clap::Parser;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::accounts::{AccountManager, LogListener};
use crate::config::{Args, OauthSettings};
use crate::http_client::{HttpClient, ReqwestClient};
use crate::media::MediaToolsUnavailable;
use crate::providers::CloudFactory;
use crate::router::Gateway;
use crate::token_store::TokenStore;

/// Starts the gateway and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let http: Arc<dyn HttpClient> = Arc::new(
        ReqwestClient::new()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?,
    );
    let token_store = Arc::new(TokenStore::new(PathBuf::from(&args.token_file)));
    let factory = CloudFactory::new(
        http.clone(),
        Arc::new(MediaToolsUnavailable),
        OauthSettings::from_env(),
        args.external_origin(),
    );
    let manager = Arc::new(AccountManager::new(
        http,
        factory,
        token_store,
        Box::new(LogListener),
    ));
    manager.load_persisted().await;

    let gateway = Gateway {
        manager: manager.clone(),
        thumbnailer: Arc::new(MediaToolsUnavailable),
    };
    let app = router::build_router(gateway).layer(
        TraceLayer::new_for_http()
            .make_span_with(|request: &Request<_>| {
                info_span!(
                    env!("CARGO_CRATE_NAME"),
                    method = ?request.method(),
                    path = ?request.uri().path(),
                )
            })
            .on_request(DefaultOnRequest::new().level(Level::DEBUG))
            .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
    );

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!("🚀 Starting gateway at http://{addr}");
    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service());

    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle, manager) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle, manager: Arc<AccountManager>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal, draining accounts");
    manager.shutdown().await;
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
