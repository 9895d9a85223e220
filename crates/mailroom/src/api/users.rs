//! `/api/users/*`

use axum::Json;
use axum::extract::State;
use mailroom_core::AnalyticsSummary;
use mailroom_core::user::{ProfileUpdate, SettingsUpdate, User, UserSettings, UserSummary};
use serde::Deserialize;

use super::AppState;
use super::error::ApiResult;
use super::extract::{Authenticated, JsonBody, QueryParams};

/// Default analytics window, in days.
const DEFAULT_ANALYTICS_DAYS: u32 = 30;

#[derive(Debug, Deserialize)]
pub(super) struct SearchParams {
    #[serde(default)]
    q: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct AnalyticsParams {
    #[serde(default = "default_days")]
    days: u32,
}

const fn default_days() -> u32 {
    DEFAULT_ANALYTICS_DAYS
}

pub(super) async fn profile(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
) -> ApiResult<Json<User>> {
    Ok(Json(state.users.profile(p.user.id).await?))
}

pub(super) async fn update_profile(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    JsonBody(update): JsonBody<ProfileUpdate>,
) -> ApiResult<Json<User>> {
    Ok(Json(state.users.update_profile(p.user.id, &update).await?))
}

pub(super) async fn settings(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
) -> ApiResult<Json<UserSettings>> {
    Ok(Json(state.users.settings(p.user.id).await?))
}

pub(super) async fn update_settings(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    JsonBody(update): JsonBody<SettingsUpdate>,
) -> ApiResult<Json<UserSettings>> {
    Ok(Json(state.users.update_settings(p.user.id, &update).await?))
}

/// Other users by address prefix, for recipient autocompletion.
pub(super) async fn search(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    QueryParams(params): QueryParams<SearchParams>,
) -> ApiResult<Json<Vec<UserSummary>>> {
    Ok(Json(state.users.search(p.user.id, &params.q).await?))
}

pub(super) async fn analytics(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    QueryParams(params): QueryParams<AnalyticsParams>,
) -> ApiResult<Json<AnalyticsSummary>> {
    Ok(Json(state.users.analytics(p.user.id, params.days).await?))
}
