//! `/api/auth/*`

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use mailroom_core::service::Session;
use mailroom_core::user::User;
use serde::Deserialize;

use super::AppState;
use super::error::ApiResult;
use super::extract::{Authenticated, JsonBody};

#[derive(Debug, Deserialize)]
pub(super) struct RegisterRequest {
    email: String,
    password: String,
    #[serde(default)]
    display_name: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct PasswordRequest {
    current_password: String,
    new_password: String,
}

pub(super) async fn register(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<User>)> {
    let user = state
        .auth
        .register(&req.email, &req.password, &req.display_name)
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

pub(super) async fn login(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<LoginRequest>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.auth.login(&req.email, &req.password).await?))
}

pub(super) async fn logout(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
) -> ApiResult<StatusCode> {
    state.auth.logout(&principal).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn me(Authenticated(principal): Authenticated) -> Json<User> {
    Json(principal.user)
}

pub(super) async fn change_password(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    JsonBody(req): JsonBody<PasswordRequest>,
) -> ApiResult<StatusCode> {
    state
        .auth
        .change_password(&principal, &req.current_password, &req.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
