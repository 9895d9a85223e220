//! # mailroom-core
//!
//! Storage, services and the delivery pipeline of the mailroom backend.
//!
//! This crate provides:
//! - The `SQLite` schema and repositories for users, emails, threads,
//!   labels, templates, schedules and analytics
//! - Services enforcing ownership and the email lifecycle
//!   (draft, queued, sending, sent/partially sent/failed)
//! - Workers for the `email-send` and `email-receive` topics
//! - An SMTP sink that queues inbound mail for local users
//! - Change notifications for live clients

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

#[macro_use]
mod macros;

pub mod analytics;
mod db;
mod error;
pub mod ids;
pub mod mail;
pub mod notify;
pub mod pipeline;
pub mod schedule;
pub mod service;
pub mod template;
pub mod user;

pub use analytics::{AnalyticsEvent, AnalyticsRecord, AnalyticsRepository, AnalyticsSummary};
pub use db::Database;
pub use error::{Error, Result};
pub use ids::{AttachmentId, EmailId, LabelId, ScheduleId, TemplateId, ThreadId, UserId};
pub use notify::{MailEvent, MailEventKind, Notifier};
pub use schedule::{Schedule, ScheduleRepository, ScheduleStatus};
pub use service::{AuthService, MailService, UserService};
