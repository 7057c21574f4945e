use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use serde::Deserialize;
use smsdesk::protocol::User;
use std::sync::Arc;

use crate::error::ApiFailure;
use crate::state::AppState;

/// The caller, resolved from `Authorization: Bearer <token>` or a `token`
/// query parameter (browsers cannot set headers on WebSocket/EventSource).
pub struct AuthUser(pub User);

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiFailure;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .or_else(|| {
                Query::<TokenQuery>::try_from_uri(&parts.uri)
                    .ok()
                    .and_then(|Query(q)| q.token)
            })
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiFailure::Unauthorized("missing bearer token".into()))?;

        let user = state
            .store
            .call(move |s| s.user_by_token(&token))
            .await?
            .ok_or_else(|| ApiFailure::Unauthorized("invalid token".into()))?;
        Ok(AuthUser(user))
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(req: Request<()>) -> Parts {
        req.into_parts().0
    }

    #[test]
    fn bearer_header_parsed() {
        let p = parts(
            Request::builder()
                .header(AUTHORIZATION, "Bearer abc ")
                .body(())
                .unwrap(),
        );
        assert_eq!(bearer_token(&p).as_deref(), Some("abc"));
    }

    #[test]
    fn other_schemes_ignored() {
        let p = parts(
            Request::builder()
                .header(AUTHORIZATION, "Basic abc")
                .body(())
                .unwrap(),
        );
        assert_eq!(bearer_token(&p), None);
    }
}
