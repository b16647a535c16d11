// CORS middleware configuration for the relay server.
//
// Allowed origins come from `RelayConfig::cors_origins`
// (`VOYAGE_RELAY_CORS_ORIGINS`, comma-separated). Falls back to localhost
// defaults for the web client in development.

use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Default origins allowed when no origin list is configured.
const DEFAULT_DEV_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:5173",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:5173",
];

/// Build a [`CorsLayer`] from the configured origin list.
///
/// - `"*"` allows any origin, without credentials.
/// - A comma-separated list allows exactly those origins.
/// - `None` allows the default development origins.
///
/// Preflight responses are cached for 1 hour and `X-Request-Id` is exposed
/// to the browser.
pub fn cors_layer(origins: Option<&str>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            HeaderName::from_static("x-request-id"),
        ])
        .expose_headers([HeaderName::from_static("x-request-id")])
        .allow_credentials(true)
        .max_age(std::time::Duration::from_secs(3600));

    match origins.map(str::trim) {
        Some("*") => base.allow_origin(AllowOrigin::any()).allow_credentials(false),
        Some(origins) => base.allow_origin(parse_origins(origins)),
        None => base.allow_origin(parse_origins(&DEFAULT_DEV_ORIGINS.join(","))),
    }
}

fn parse_origins(comma_separated: &str) -> Vec<HeaderValue> {
    comma_separated
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| HeaderValue::from_str(s).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{HeaderMap, Request},
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    /// Send a request from `origin` through a router guarded by `cors_layer(origins)`.
    /// `preflight` issues an OPTIONS request asking for a PUT.
    async fn cors_headers(origins: Option<&str>, origin: &str, preflight: bool) -> HeaderMap {
        let app = Router::new().route("/api/context/{id}", get(|| async { "ok" })).layer(cors_layer(origins));
        let mut request = Request::builder().uri("/api/context/user_prefs_alice").header("origin", origin);
        request = if preflight {
            request.method(Method::OPTIONS).header("access-control-request-method", "PUT")
        } else {
            request.method(Method::GET)
        };

        app.oneshot(request.body(Body::empty()).expect("request should build"))
            .await
            .expect("request should complete")
            .headers()
            .clone()
    }

    #[tokio::test]
    async fn dev_origins_get_credentialed_preflight() {
        for origin in DEFAULT_DEV_ORIGINS {
            let headers = cors_headers(None, origin, true).await;
            assert_eq!(headers.get("access-control-allow-origin").expect("allow origin"), origin);
            assert_eq!(headers.get("access-control-allow-credentials").expect("credentials"), "true");
            assert_eq!(headers.get("access-control-max-age").expect("max age"), "3600");
        }
    }

    #[tokio::test]
    async fn unknown_origin_is_not_echoed() {
        let headers = cors_headers(None, "https://evil.example.com", true).await;
        assert!(headers.get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn configured_origins_replace_dev_defaults() {
        let configured = Some("https://app.voyage.travel, https://staging.voyage.travel");

        let allowed = cors_headers(configured, "https://staging.voyage.travel", false).await;
        assert_eq!(
            allowed.get("access-control-allow-origin").expect("allow origin"),
            "https://staging.voyage.travel"
        );

        let dev = cors_headers(configured, "http://localhost:3000", false).await;
        assert!(dev.get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn wildcard_allows_any_origin_without_credentials() {
        let headers = cors_headers(Some(" * "), "https://anything.example.com", true).await;
        assert_eq!(headers.get("access-control-allow-origin").expect("allow origin"), "*");
        assert!(headers.get("access-control-allow-credentials").is_none());
    }

    #[test]
    fn parse_origins_skips_blank_entries() {
        let origins = parse_origins("  https://a.voyage.travel , https://b.voyage.travel  , ");
        assert_eq!(origins, vec!["https://a.voyage.travel", "https://b.voyage.travel"]);
    }
}
