//! User model types.

use chrono::{DateTime, Utc};
use mailroom_mime::Mailbox;
use serde::{Deserialize, Serialize};

use crate::ids::UserId;
use crate::{Error, Result};

/// Largest page size a user may configure or request.
pub const MAX_PAGE_SIZE: u32 = 200;

/// A registered account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    /// Row id.
    pub id: UserId,
    /// Login and mailbox address.
    pub email: String,
    /// Name shown to correspondents.
    pub display_name: String,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Last profile change.
    pub updated_at: DateTime<Utc>,
    /// Last successful login.
    pub last_login_at: Option<DateTime<Utc>>,
}

impl User {
    /// The user as a message author.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored address is not a valid mailbox.
    pub fn mailbox(&self) -> Result<Mailbox> {
        let name = (!self.display_name.is_empty()).then(|| self.display_name.clone());
        Ok(Mailbox::new(name, self.email.clone())?)
    }
}

/// Another user, as shown by address autocomplete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserSummary {
    /// Row id.
    pub id: UserId,
    /// Address.
    pub email: String,
    /// Display name.
    pub display_name: String,
}

/// Per-user preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserSettings {
    /// Owner.
    pub user_id: UserId,
    /// Appended to new messages.
    pub signature: Option<String>,
    /// Default list page size.
    pub page_size: u32,
    /// IANA zone name used by clients to render dates.
    pub timezone: String,
    /// Whether the event stream should carry notifications.
    pub notifications_enabled: bool,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

/// Partial profile change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProfileUpdate {
    /// New display name.
    pub display_name: Option<String>,
}

/// Partial settings change. An empty signature clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SettingsUpdate {
    /// New signature.
    pub signature: Option<String>,
    /// New page size.
    pub page_size: Option<u32>,
    /// New timezone.
    pub timezone: Option<String>,
    /// New notification preference.
    pub notifications_enabled: Option<bool>,
}

impl SettingsUpdate {
    /// Rejects out-of-range values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if let Some(size) = self.page_size {
            if !(1..=MAX_PAGE_SIZE).contains(&size) {
                return Err(Error::Validation(format!(
                    "page_size must be between 1 and {MAX_PAGE_SIZE}"
                )));
            }
        }
        if let Some(tz) = &self.timezone {
            let valid = !tz.is_empty()
                && tz.len() <= 64
                && tz
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '+'));
            if !valid {
                return Err(Error::Validation(format!("invalid timezone {tz:?}")));
            }
        }
        if self.signature.as_ref().is_some_and(|s| s.len() > 10_000) {
            return Err(Error::Validation("signature is too long".into()));
        }
        Ok(())
    }
}
