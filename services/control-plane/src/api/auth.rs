//! Bearer authentication for node endpoints.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use chrono::Utc;

use super::error::ApiError;
use crate::state::AppState;

/// The node a valid bearer token was issued to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedNode {
    pub node_id: String,
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return Err(ApiError::unauthorized(
            "missing_authorization",
            "Authorization header is required",
        ));
    };

    let Some(token) = value.trim().strip_prefix("Bearer ") else {
        return Err(ApiError::unauthorized(
            "invalid_authorization",
            "Authorization must be a Bearer token",
        ));
    };

    let token = token.trim();
    if token.is_empty() {
        return Err(ApiError::unauthorized(
            "invalid_authorization",
            "Authorization Bearer token cannot be empty",
        ));
    }
    Ok(token)
}

impl FromRequestParts<AppState> for AuthenticatedNode {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)?;

        // Never log the token itself.
        let node_id = state
            .tokens()
            .validate(token, Utc::now())
            .await
            .ok_or_else(|| ApiError::unauthorized("invalid_token", "token is unknown or expired"))?;

        if state.registry().read().await.key_of(&node_id).is_none() {
            return Err(ApiError::unauthorized("unknown_node", "token's node is not registered"));
        }

        Ok(Self { node_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use rstest::rstest;

    #[rstest]
    #[case::missing(None)]
    #[case::basic(Some("Basic abc"))]
    #[case::empty(Some("Bearer   "))]
    fn test_rejected_headers(#[case] value: Option<&str>) {
        let mut headers = HeaderMap::new();
        if let Some(value) = value {
            headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        }
        assert!(bearer_token(&headers).is_err());
    }

    #[test]
    fn test_bearer_token_trimmed() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer fnt_abc "));
        assert_eq!(bearer_token(&headers).unwrap(), "fnt_abc");
    }
}
