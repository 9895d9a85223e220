//! # mailroom
//!
//! The mailroom server: REST API, send and receive workers, the send
//! scheduler and the inbound SMTP receiver in one process.
//!
//! The binary loads a [`config::Config`] and hands it to [`app::run`].
//! The router is public so tests can drive it over a real socket.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod api;
pub mod app;
pub mod config;

pub use config::{Config, ConfigError};
