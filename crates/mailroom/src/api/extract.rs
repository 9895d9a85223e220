//! Extractors that reject with the JSON error contract.

use axum::Json;
use axum::async_trait;
use axum::extract::{FromRequest, FromRequestParts, Path, Query, Request};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use mailroom_core::service::Principal;
use serde::de::DeserializeOwned;

use super::AppState;
use super::error::ApiError;

/// The caller behind a valid bearer token.
///
/// The token comes from `Authorization: Bearer <token>`, or from an
/// `access_token` query parameter for clients that cannot set headers
/// (browser event streams).
#[derive(Debug, Clone)]
pub struct Authenticated(pub Principal);

#[async_trait]
impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let token = bearer_token(parts)
            .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
        let principal = state.auth.authenticate(&token).await?;
        tracing::Span::current().record("user_id", principal.user.id.0);
        Ok(Self(principal))
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    if let Some(value) = parts.headers.get(AUTHORIZATION) {
        let value = value.to_str().ok()?;
        let (scheme, token) = value.split_once(' ')?;
        let token = token.trim();
        return (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty())
            .then(|| token.to_string());
    }
    parts
        .uri
        .query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, v)| *k == "access_token" && !v.is_empty())
        .map(|(_, v)| v.to_string())
}

/// A JSON body.
#[derive(Debug)]
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, ApiError> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        Ok(Self(value))
    }
}

/// Query string parameters.
#[derive(Debug)]
pub struct QueryParams<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for QueryParams<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, ApiError> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        Ok(Self(value))
    }
}

/// Path parameters.
#[derive(Debug)]
pub struct PathParams<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for PathParams<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Send,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, ApiError> {
        let Path(value) = Path::<T>::from_request_parts(parts, state)
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        Ok(Self(value))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(builder: axum::http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn reads_bearer_header() {
        let p = parts(Request::get("/").header(AUTHORIZATION, "Bearer abc"));
        assert_eq!(bearer_token(&p).as_deref(), Some("abc"));
        let p = parts(Request::get("/").header(AUTHORIZATION, "bearer  abc "));
        assert_eq!(bearer_token(&p).as_deref(), Some("abc"));
        let p = parts(Request::get("/").header(AUTHORIZATION, "Basic abc"));
        assert_eq!(bearer_token(&p), None);
    }

    #[test]
    fn falls_back_to_query_token() {
        let p = parts(Request::get("/api/events?x=1&access_token=tok"));
        assert_eq!(bearer_token(&p).as_deref(), Some("tok"));
        let p = parts(Request::get("/api/events?access_token="));
        assert_eq!(bearer_token(&p), None);
        let p = parts(Request::get("/api/events"));
        assert_eq!(bearer_token(&p), None);
    }
}
