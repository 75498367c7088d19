//! Home page, embedded static assets, theme cookie, and the size summary.

use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{Html, IntoResponse, Json as JsonResponse, Redirect, Response};
use axum_extra::extract::{CookieJar, cookie::Cookie};
use rust_embed::RustEmbed;
use serde::Serialize;

use crate::accounts::AccountManager;
use crate::auth::authorization_url;
use crate::config::THEME_COOKIE_NAME;
use crate::error::Error;
use crate::provider::ProviderKind;
use crate::webdav::xml_escape;

#[derive(RustEmbed)]
#[folder = "assets/static"]
/// Embedded gateway assets served under `/static`.
pub struct StaticAssets;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Theme {
    Light,
    Dark,
}

impl Theme {
    fn as_str(self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
        }
    }

    fn toggled(self) -> Self {
        match self {
            Theme::Light => Theme::Dark,
            Theme::Dark => Theme::Light,
        }
    }
}

pub fn theme_from_cookies(jar: &CookieJar) -> Theme {
    match jar.get(THEME_COOKIE_NAME).map(Cookie::value) {
        Some("dark") => Theme::Dark,
        _ => Theme::Light,
    }
}

/// `GET /static/<name>`.
pub async fn static_asset(Path(name): Path<String>) -> Result<Response, Error> {
    let asset = StaticAssets::get(&name).ok_or(Error::NotFound)?;
    let mime = mime_guess::from_path(&name).first_or_octet_stream();
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| Error::parse("invalid asset mime type"))?,
    );
    Ok((headers, asset.data.into_owned()).into_response())
}

/// `GET /theme-toggle`: flip the cookie and bounce back.
pub async fn theme_toggle(jar: CookieJar, headers: HeaderMap) -> (CookieJar, Redirect) {
    let next = theme_from_cookies(&jar).toggled();
    let cookie = Cookie::build((THEME_COOKIE_NAME, next.as_str().to_string()))
        .path("/")
        .build();
    let back = headers
        .get(header::REFERER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("/")
        .to_string();
    (jar.add(cookie), Redirect::to(&back))
}

#[derive(Serialize)]
pub struct AccountSize {
    pub account: String,
    pub space_used: Option<u64>,
    pub space_total: Option<u64>,
}

/// `GET /size`: per-account quota summary.
pub async fn size_summary(
    Extension(manager): Extension<Arc<AccountManager>>,
) -> JsonResponse<Vec<AccountSize>> {
    let accounts = manager.accounts().await;
    let lookups = accounts.iter().filter(|a| a.is_active()).map(|account| {
        let account = account.clone();
        async move {
            let data = account
                .provider
                .get_general_data(&account.cancel)
                .await
                .unwrap_or_default();
            AccountSize {
                account: account.account_id().to_string(),
                space_used: data.space_used,
                space_total: data.space_total,
            }
        }
    });
    JsonResponse(futures::future::join_all(lookups).await)
}

/// `GET /`: provider consent links plus the live account table.
pub async fn home_page(manager: &AccountManager, jar: &CookieJar) -> Html<String> {
    let theme = theme_from_cookies(jar);

    let mut providers = String::new();
    for kind in ProviderKind::ALL {
        let data = manager.factory().auth_data(kind);
        let url = authorization_url(kind, &data, "");
        providers.push_str(&format!(
            "<a href=\"{}\"><img class=\"provider-icon\" src=\"/static/{}.svg\" alt=\"\"> {}</a>",
            xml_escape(&url),
            kind.id(),
            kind.display_name()
        ));
    }

    let mut rows = String::new();
    for account in manager.accounts().await {
        if !account.is_active() {
            continue;
        }
        let id = account.account_id();
        let encoded = id.encoded();
        rows.push_str(&format!(
            "<tr><td><img class=\"provider-icon\" src=\"/static/{kind}.svg\" alt=\"\"></td>\
             <td><a href=\"/{encoded}/\">{name}</a></td>\
             <td><form class=\"remove\" method=\"post\" action=\"/remove/{encoded}\">\
             <button type=\"submit\">remove</button></form></td></tr>",
            kind = id.kind.id(),
            name = xml_escape(&id.to_string()),
        ));
    }

    Html(format!(
        "<!DOCTYPE html><html data-theme=\"{theme}\"><head><meta charset=\"utf-8\">\
         <title>cirrus</title><link rel=\"stylesheet\" href=\"/static/style.css\"></head>\
         <body><h1>cirrus</h1><p><a href=\"/theme-toggle\">toggle theme</a></p>\
         <div class=\"providers\">{providers}</div>\
         <table><tr><th></th><th>account</th><th></th></tr>{rows}</table>\
         </body></html>",
        theme = theme.as_str(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_assets_include_style_and_icons() {
        assert!(StaticAssets::get("style.css").is_some());
        for kind in ProviderKind::ALL {
            assert!(
                StaticAssets::get(&format!("{}.svg", kind.id())).is_some(),
                "missing icon for {}",
                kind.id()
            );
        }
    }

    #[tokio::test]
    async fn missing_asset_is_not_found() {
        let result = static_asset(Path("nope.css".into())).await;
        assert!(matches!(result, Err(Error::NotFound)));
    }

    #[test]
    fn theme_defaults_to_light_and_toggles() {
        let jar = CookieJar::new();
        assert_eq!(theme_from_cookies(&jar), Theme::Light);
        assert_eq!(Theme::Light.toggled(), Theme::Dark);
        let jar = jar.add(Cookie::new(THEME_COOKIE_NAME, "dark"));
        assert_eq!(theme_from_cookies(&jar), Theme::Dark);
    }
}
