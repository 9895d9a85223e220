//! `/api/emails/*`

use axum::Json;
use axum::extract::State;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use mailroom_core::mail::{
    Compose, Email, EmailSummary, Folder, ListQuery, NewAttachment, Page, ThreadView,
};
use mailroom_core::service::{ForwardRequest, ReplyRequest};
use mailroom_core::{AttachmentId, EmailId, LabelId, Schedule, ThreadId};
use serde::Deserialize;

use super::AppState;
use super::error::{ApiError, ApiResult};
use super::extract::{Authenticated, JsonBody, PathParams, QueryParams};

/// Body of draft creation, draft edits and direct sends.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct ComposeRequest {
    to: Vec<String>,
    cc: Vec<String>,
    bcc: Vec<String>,
    subject: String,
    body_text: String,
    body_html: Option<String>,
    attachments: Vec<AttachmentUpload>,
}

#[derive(Debug, Deserialize)]
struct AttachmentUpload {
    filename: String,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    content_id: Option<String>,
    /// Standard base64.
    content: String,
}

impl ComposeRequest {
    fn into_compose(self) -> ApiResult<Compose> {
        let attachments = self
            .attachments
            .into_iter()
            .map(|a| {
                let content = STANDARD.decode(a.content.trim()).map_err(|_| {
                    ApiError::bad_request(format!(
                        "attachment {:?} is not valid base64",
                        a.filename
                    ))
                })?;
                Ok(NewAttachment {
                    filename: a.filename,
                    content_type: a.content_type,
                    content_id: a.content_id,
                    content,
                })
            })
            .collect::<ApiResult<Vec<_>>>()?;
        Ok(Compose {
            to: self.to,
            cc: self.cc,
            bcc: self.bcc,
            subject: self.subject,
            body_text: self.body_text,
            body_html: self.body_html,
            attachments,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct ListParams {
    folder: Option<Folder>,
    label: Option<LabelId>,
    unread: bool,
    starred: bool,
    q: Option<String>,
    page: u32,
    per_page: u32,
}

impl From<ListParams> for ListQuery {
    fn from(p: ListParams) -> Self {
        Self {
            folder: p.folder,
            label: p.label,
            unread_only: p.unread,
            starred_only: p.starred,
            search: p.q.filter(|q| !q.trim().is_empty()),
            page: p.page.max(1),
            per_page: p.per_page,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct MoveRequest {
    folder: Folder,
}

#[derive(Debug, Deserialize)]
pub(super) struct ScheduleRequest {
    send_at: DateTime<Utc>,
}

pub(super) async fn list(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    QueryParams(params): QueryParams<ListParams>,
) -> ApiResult<Json<Page<EmailSummary>>> {
    let query = ListQuery::from(params);
    Ok(Json(state.mail.list(p.user.id, &query).await?))
}

pub(super) async fn create_draft(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    JsonBody(req): JsonBody<ComposeRequest>,
) -> ApiResult<(StatusCode, Json<Email>)> {
    let draft = state
        .mail
        .create_draft(p.user.id, &req.into_compose()?)
        .await?;
    Ok((StatusCode::CREATED, Json(draft)))
}

pub(super) async fn send_new(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    JsonBody(req): JsonBody<ComposeRequest>,
) -> ApiResult<(StatusCode, Json<Email>)> {
    let email = state.mail.send_new(p.user.id, &req.into_compose()?).await?;
    Ok((StatusCode::ACCEPTED, Json(email)))
}

pub(super) async fn open(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    PathParams(id): PathParams<EmailId>,
) -> ApiResult<Json<Email>> {
    Ok(Json(state.mail.open(p.user.id, id).await?))
}

pub(super) async fn update_draft(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    PathParams(id): PathParams<EmailId>,
    JsonBody(req): JsonBody<ComposeRequest>,
) -> ApiResult<Json<Email>> {
    let draft = state
        .mail
        .update_draft(p.user.id, id, &req.into_compose()?)
        .await?;
    Ok(Json(draft))
}

/// Moves to trash first; deletes for good when already there.
pub(super) async fn delete(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    PathParams(id): PathParams<EmailId>,
) -> ApiResult<Response> {
    Ok(match state.mail.delete(p.user.id, id).await? {
        Some(trashed) => Json(trashed).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

pub(super) async fn send(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    PathParams(id): PathParams<EmailId>,
) -> ApiResult<(StatusCode, Json<Email>)> {
    let email = state.mail.send(p.user.id, id).await?;
    Ok((StatusCode::ACCEPTED, Json(email)))
}

pub(super) async fn reply(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    PathParams(id): PathParams<EmailId>,
    JsonBody(req): JsonBody<ReplyRequest>,
) -> ApiResult<(StatusCode, Json<Email>)> {
    let email = state.mail.reply(p.user.id, id, &req).await?;
    Ok((created_or_accepted(req.send), Json(email)))
}

pub(super) async fn forward(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    PathParams(id): PathParams<EmailId>,
    JsonBody(req): JsonBody<ForwardRequest>,
) -> ApiResult<(StatusCode, Json<Email>)> {
    let email = state.mail.forward(p.user.id, id, &req).await?;
    Ok((created_or_accepted(req.send), Json(email)))
}

const fn created_or_accepted(sent: bool) -> StatusCode {
    if sent {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CREATED
    }
}

pub(super) async fn mark_read(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    PathParams(id): PathParams<EmailId>,
) -> ApiResult<Json<Email>> {
    Ok(Json(state.mail.set_read(p.user.id, id, true).await?))
}

pub(super) async fn mark_unread(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    PathParams(id): PathParams<EmailId>,
) -> ApiResult<Json<Email>> {
    Ok(Json(state.mail.set_read(p.user.id, id, false).await?))
}

pub(super) async fn star(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    PathParams(id): PathParams<EmailId>,
) -> ApiResult<Json<Email>> {
    Ok(Json(state.mail.set_starred(p.user.id, id, true).await?))
}

pub(super) async fn unstar(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    PathParams(id): PathParams<EmailId>,
) -> ApiResult<Json<Email>> {
    Ok(Json(state.mail.set_starred(p.user.id, id, false).await?))
}

pub(super) async fn move_to(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    PathParams(id): PathParams<EmailId>,
    JsonBody(req): JsonBody<MoveRequest>,
) -> ApiResult<Json<Email>> {
    Ok(Json(state.mail.move_to(p.user.id, id, req.folder).await?))
}

pub(super) async fn apply_label(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    PathParams((id, label)): PathParams<(EmailId, LabelId)>,
) -> ApiResult<Json<Email>> {
    Ok(Json(state.mail.apply_label(p.user.id, id, label).await?))
}

pub(super) async fn remove_label(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    PathParams((id, label)): PathParams<(EmailId, LabelId)>,
) -> ApiResult<Json<Email>> {
    Ok(Json(state.mail.remove_label(p.user.id, id, label).await?))
}

/// Raw attachment bytes.
pub(super) async fn attachment(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    PathParams((id, attachment)): PathParams<(EmailId, AttachmentId)>,
) -> ApiResult<Response> {
    let data = state.mail.attachment(p.user.id, id, attachment).await?;
    let content_type = HeaderValue::from_str(&data.meta.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let disposition = HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        header_safe(&data.meta.filename)
    ))
    .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
    Ok((
        [(CONTENT_TYPE, content_type), (CONTENT_DISPOSITION, disposition)],
        data.content,
    )
        .into_response())
}

/// Keeps a file name usable inside a quoted header parameter.
fn header_safe(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub(super) async fn schedule(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    PathParams(id): PathParams<EmailId>,
    JsonBody(req): JsonBody<ScheduleRequest>,
) -> ApiResult<(StatusCode, Json<Schedule>)> {
    let schedule = state.mail.schedule(p.user.id, id, req.send_at).await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

pub(super) async fn cancel_schedule(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    PathParams(id): PathParams<EmailId>,
) -> ApiResult<Json<Schedule>> {
    Ok(Json(state.mail.cancel_schedule(p.user.id, id).await?))
}

pub(super) async fn thread(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
    PathParams(id): PathParams<ThreadId>,
) -> ApiResult<Json<ThreadView>> {
    Ok(Json(state.mail.thread(p.user.id, id).await?))
}
