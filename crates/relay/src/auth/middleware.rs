use crate::{
    auth::jwt::{JwtAccessTokenService, Principal},
    error::{ErrorCode, RelayError},
};
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedParticipant {
    pub participant_id: String,
}

pub async fn require_bearer_auth(
    State(jwt_service): State<Arc<JwtAccessTokenService>>,
    mut request: Request,
    next: Next,
) -> Response {
    let participant = match authenticate(&jwt_service, request.headers(), None) {
        Ok(participant) => participant,
        Err(error) => return error.into_response(),
    };

    request.extensions_mut().insert(participant);

    next.run(request).await
}

/// Resolve the caller from the `Authorization` header, or from a `token`
/// query parameter for browser WebSocket clients that cannot set headers.
pub fn authenticate(
    jwt_service: &JwtAccessTokenService,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<AuthenticatedParticipant, RelayError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
        .or_else(|| query_token.map(str::trim).filter(|token| !token.is_empty()))
        .ok_or_else(|| RelayError::from_code(ErrorCode::AuthMissingToken))?;

    let Principal { participant_id } =
        jwt_service.validate_participant_token(token).map_err(|error| {
            debug!(error = %error, "rejected bearer token");
            RelayError::from_code(ErrorCode::AuthInvalidToken)
        })?;

    Ok(AuthenticatedParticipant { participant_id })
}

fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

#[cfg(test)]
mod tests {
    use super::{authenticate, extract_bearer_token, require_bearer_auth, AuthenticatedParticipant};
    use crate::{auth::jwt::JwtAccessTokenService, error::ErrorCode};
    use axum::{
        body::{to_bytes, Body},
        extract::Extension,
        http::{header::AUTHORIZATION, HeaderMap, Request, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    const TEST_SECRET: &str = "voyage_test_secret_that_is_definitely_long_enough";

    fn service() -> Arc<JwtAccessTokenService> {
        Arc::new(JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize"))
    }

    fn protected_app(jwt_service: Arc<JwtAccessTokenService>) -> Router {
        Router::new()
            .route(
                "/protected",
                get(|Extension(participant): Extension<AuthenticatedParticipant>| async move {
                    participant.participant_id
                }),
            )
            .layer(middleware::from_fn_with_state(jwt_service, require_bearer_auth))
    }

    async fn error_code(response: axum::response::Response) -> String {
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
        let parsed: Value = serde_json::from_slice(&body).expect("body should be json");
        parsed["error"]["code"].as_str().expect("code should be a string").to_string()
    }

    #[tokio::test]
    async fn rejects_requests_without_bearer_token() {
        let response = protected_app(service())
            .oneshot(Request::builder().uri("/protected").body(Body::empty()).expect("request"))
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(error_code(response).await, "AUTH_MISSING_TOKEN");
    }

    #[tokio::test]
    async fn rejects_requests_with_invalid_bearer_token() {
        let response = protected_app(service())
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header(AUTHORIZATION, "Bearer invalid-token")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(error_code(response).await, "AUTH_INVALID_TOKEN");
    }

    #[tokio::test]
    async fn injects_participant_for_valid_bearer_token() {
        let service = service();
        let token = service.issue_participant_token("user-42").expect("token should be issued");

        let response = protected_app(service)
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header(AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
        assert_eq!(&body[..], b"user-42");
    }

    #[test]
    fn query_token_is_used_only_without_header() {
        let service = service();
        let token = service.issue_participant_token("browser-user").expect("token");

        let participant = authenticate(&service, &HeaderMap::new(), Some(&token))
            .expect("query token should authenticate");
        assert_eq!(participant.participant_id, "browser-user");

        let error = authenticate(&service, &HeaderMap::new(), Some("  "))
            .expect_err("blank query token should be missing");
        assert_eq!(error.code(), ErrorCode::AuthMissingToken);
    }

    #[test]
    fn bearer_scheme_is_case_insensitive_and_requires_token() {
        assert_eq!(extract_bearer_token("bearer abc"), Some("abc"));
        assert_eq!(extract_bearer_token("Bearer   "), None);
        assert_eq!(extract_bearer_token("Basic abc"), None);
    }
}
