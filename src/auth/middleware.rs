//! Authentication Middleware
//! Protect API endpoints with JWT validation

use crate::auth::jwt::JwtHandler;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;

/// Validates the bearer token and stores both [`crate::auth::Claims`] and the derived
/// [`crate::models::Principal`] in request extensions.
pub async fn auth_middleware(
    State(jwt_handler): State<Arc<JwtHandler>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let header = req
        .headers()
        .get("Authorization")
        .ok_or(AuthError::MissingToken)?;

    let token = header
        .to_str()
        .ok()
        .and_then(|s| s.strip_prefix("Bearer "))
        .ok_or(AuthError::InvalidFormat)?
        .to_string();

    let claims = jwt_handler
        .validate_token(&token)
        .map_err(|_| AuthError::InvalidToken)?;
    let principal = claims.to_principal().ok_or(AuthError::InvalidToken)?;

    req.extensions_mut().insert(claims);
    req.extensions_mut().insert(principal);

    Ok(next.run(req).await)
}

#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidFormat,
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (code, message) = match self {
            AuthError::MissingToken => ("UNAUTHORIZED", "Missing authorization token"),
            AuthError::InvalidFormat => (
                "UNAUTHORIZED",
                "Invalid authorization format. Use: Bearer {token}",
            ),
            AuthError::InvalidToken => ("UNAUTHORIZED", "Invalid or expired token"),
        };

        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": message, "code": code })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Principal;
    use axum::{body::Body, http::Request as HttpRequest, middleware, routing::get, Extension, Router};
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn whoami(Extension(principal): Extension<Principal>) -> String {
        principal.user_id.to_string()
    }

    fn app(handler: Arc<JwtHandler>) -> Router {
        Router::new()
            .route("/me", get(whoami))
            .route_layer(middleware::from_fn_with_state(handler, auth_middleware))
    }

    #[test]
    fn test_auth_error_responses() {
        for err in [
            AuthError::MissingToken,
            AuthError::InvalidFormat,
            AuthError::InvalidToken,
        ] {
            assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[tokio::test]
    async fn test_middleware_injects_principal() {
        let handler = Arc::new(JwtHandler::new("secret".to_string()));
        let principal = Principal::user(Uuid::new_v4(), None);
        let (token, _) = handler.generate_token(&principal).unwrap();

        let res = app(handler.clone())
            .oneshot(
                HttpRequest::get("/me")
                    .header("Authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, principal.user_id.to_string().as_bytes());

        let missing = app(handler.clone())
            .oneshot(HttpRequest::get("/me").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let basic = app(handler)
            .oneshot(
                HttpRequest::get("/me")
                    .header("Authorization", "Basic abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(basic.status(), StatusCode::UNAUTHORIZED);
    }
}
