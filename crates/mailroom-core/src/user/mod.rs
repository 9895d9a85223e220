//! Users, sessions and per-user settings.

mod model;
mod repository;

pub use model::{ProfileUpdate, SettingsUpdate, User, UserSettings, UserSummary, MAX_PAGE_SIZE};
pub use repository::UserRepository;
