//! `/api/labels/*` and `/api/templates/*`

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use mailroom_core::mail::{Email, Label};
use mailroom_core::service::TemplateCompose;
use mailroom_core::template::{Template, TemplateInput};
use mailroom_core::{LabelId, TemplateId};
use serde::Deserialize;

use super::AppState;
use super::error::ApiResult;
use super::extract::{Authenticated, JsonBody, PathParams};

#[derive(Debug, Deserialize)]
pub(super) struct LabelRequest {
    name: String,
    #[serde(default)]
    color: Option<String>,
}

pub(super) async fn labels(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
) -> ApiResult<Json<Vec<Label>>> {
    Ok(Json(state.mail.labels(p.user.id).await?))
}

pub(super) async fn create_label(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    JsonBody(req): JsonBody<LabelRequest>,
) -> ApiResult<(StatusCode, Json<Label>)> {
    let label = state
        .mail
        .create_label(p.user.id, &req.name, req.color.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(label)))
}

pub(super) async fn delete_label(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    PathParams(id): PathParams<LabelId>,
) -> ApiResult<StatusCode> {
    state.mail.delete_label(p.user.id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn list(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
) -> ApiResult<Json<Vec<Template>>> {
    Ok(Json(state.mail.templates(p.user.id).await?))
}

pub(super) async fn create(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    JsonBody(input): JsonBody<TemplateInput>,
) -> ApiResult<(StatusCode, Json<Template>)> {
    let template = state.mail.create_template(p.user.id, &input).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

pub(super) async fn update(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    PathParams(id): PathParams<TemplateId>,
    JsonBody(input): JsonBody<TemplateInput>,
) -> ApiResult<Json<Template>> {
    Ok(Json(state.mail.update_template(p.user.id, id, &input).await?))
}

pub(super) async fn delete(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    PathParams(id): PathParams<TemplateId>,
) -> ApiResult<StatusCode> {
    state.mail.delete_template(p.user.id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Renders the template into a new draft.
pub(super) async fn compose(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    PathParams(id): PathParams<TemplateId>,
    JsonBody(req): JsonBody<TemplateCompose>,
) -> ApiResult<(StatusCode, Json<Email>)> {
    let draft = state.mail.compose_from_template(p.user.id, id, &req).await?;
    Ok((StatusCode::CREATED, Json(draft)))
}
