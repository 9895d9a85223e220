//! Operations on behalf of an authenticated user.
//!
//! Services own the rules (ownership, state transitions, validation) and
//! sit between the HTTP layer and the repositories.

pub mod auth;
pub mod compose;
pub mod mail;
pub mod user;

pub use auth::{AuthConfig, AuthService, MIN_PASSWORD_LEN, Principal, Session};
pub use compose::{MAX_ATTACHMENT_BYTES, MAX_RECIPIENTS};
pub use mail::{ForwardRequest, MailService, ReplyRequest, TemplateCompose};
pub use user::{MAX_ANALYTICS_DAYS, SEARCH_LIMIT, UserService};
