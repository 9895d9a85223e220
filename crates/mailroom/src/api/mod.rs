//! REST surface over the core services.
//!
//! Every route except registration, login and `/healthz` needs an
//! `Authorization: Bearer <token>` header. Errors come back as
//! `{"error": {"code", "message"}}` with the matching status.

mod auth;
mod emails;
mod error;
mod events;
mod extract;
mod templates;
mod users;

pub use error::{ApiError, ApiResult};
pub use extract::Authenticated;

use axum::Router;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderValue, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post, put};
use mailroom_core::analytics::AnalyticsRepository;
use mailroom_core::service::AuthConfig;
use mailroom_core::user::UserRepository;
use mailroom_core::{AuthService, Database, MailService, Notifier, UserService};
use mailroom_queue::Broker;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::Instrument;

/// Response header carrying the request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Services shared by every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Registration, login and tokens.
    pub auth: AuthService,
    /// Profile and settings.
    pub users: UserService,
    /// Mailbox operations.
    pub mail: MailService,
    /// Live mailbox events.
    pub notifier: Notifier,
    /// Topic log, for stats.
    pub broker: Broker,
    request_seq: Arc<AtomicU64>,
}

impl AppState {
    /// Builds the services over one database and topic log.
    ///
    /// # Errors
    ///
    /// Returns an error if the password-hashing settings are invalid.
    pub fn new(
        db: &Database,
        broker: Broker,
        notifier: Notifier,
        auth: AuthConfig,
    ) -> mailroom_core::Result<Self> {
        Ok(Self {
            auth: AuthService::new(UserRepository::new(db), auth)?,
            users: UserService::new(UserRepository::new(db), AnalyticsRepository::new(db)),
            mail: MailService::new(db, broker.clone(), notifier.clone()),
            notifier,
            broker,
            request_seq: Arc::new(AtomicU64::new(1)),
        })
    }

    fn next_request_id(&self) -> String {
        let id = self.request_seq.fetch_add(1, Ordering::Relaxed);
        format!("req-{id:016x}")
    }
}

/// The full router with state, tracing and the body limit applied.
pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(events::health))
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/me", get(auth::me))
        .route("/api/auth/password", post(auth::change_password))
        .route("/api/emails", get(emails::list).post(emails::create_draft))
        .route("/api/emails/send", post(emails::send_new))
        .route("/api/emails/threads/:thread", get(emails::thread))
        .route(
            "/api/emails/:id",
            get(emails::open)
                .put(emails::update_draft)
                .delete(emails::delete),
        )
        .route("/api/emails/:id/send", post(emails::send))
        .route("/api/emails/:id/reply", post(emails::reply))
        .route("/api/emails/:id/forward", post(emails::forward))
        .route("/api/emails/:id/read", post(emails::mark_read))
        .route("/api/emails/:id/unread", post(emails::mark_unread))
        .route("/api/emails/:id/star", post(emails::star))
        .route("/api/emails/:id/unstar", post(emails::unstar))
        .route("/api/emails/:id/move", post(emails::move_to))
        .route(
            "/api/emails/:id/labels/:label",
            post(emails::apply_label).delete(emails::remove_label),
        )
        .route(
            "/api/emails/:id/attachments/:attachment",
            get(emails::attachment),
        )
        .route(
            "/api/emails/:id/schedule",
            post(emails::schedule).delete(emails::cancel_schedule),
        )
        .route(
            "/api/labels",
            get(templates::labels).post(templates::create_label),
        )
        .route("/api/labels/:id", delete(templates::delete_label))
        .route("/api/templates", get(templates::list).post(templates::create))
        .route(
            "/api/templates/:id",
            put(templates::update).delete(templates::delete),
        )
        .route("/api/templates/:id/compose", post(templates::compose))
        .route(
            "/api/users/me",
            get(users::profile).put(users::update_profile),
        )
        .route(
            "/api/users/me/settings",
            get(users::settings).put(users::update_settings),
        )
        .route("/api/users/me/analytics", get(users::analytics))
        .route("/api/users/search", get(users::search))
        .route("/api/events", get(events::stream))
        .route("/api/queue/stats", get(events::queue_stats))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            request_tracing,
        ))
        .with_state(state)
}

/// Runs each request inside an `http.request` span and echoes its id.
async fn request_tracing(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map_or_else(|| state.next_request_id(), ToString::to_string);

    let span = tracing::info_span!(
        "http.request",
        request_id = %request_id,
        method = %request.method(),
        route = %request.uri().path(),
        user_id = tracing::field::Empty,
        status = tracing::field::Empty,
    );

    let mut response = next.run(request).instrument(span.clone()).await;
    span.record("status", response.status().as_u16());
    tracing::debug!(parent: &span, "request finished");
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
