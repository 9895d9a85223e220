//! Profile, settings, directory search and per-user statistics.

use chrono::{Duration, Utc};

use crate::analytics::{AnalyticsRepository, AnalyticsSummary};
use crate::ids::UserId;
use crate::user::{ProfileUpdate, SettingsUpdate, User, UserRepository, UserSettings, UserSummary};
use crate::{Error, Result};

/// Most results returned by a directory search.
pub const SEARCH_LIMIT: u32 = 20;

/// Longest analytics window, in days.
pub const MAX_ANALYTICS_DAYS: u32 = 365;

/// Account-level operations for an authenticated user.
#[derive(Debug, Clone)]
pub struct UserService {
    users: UserRepository,
    analytics: AnalyticsRepository,
}

impl UserService {
    /// Creates the service.
    #[must_use]
    pub const fn new(users: UserRepository, analytics: AnalyticsRepository) -> Self {
        Self { users, analytics }
    }

    /// The user's profile.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the user was deleted.
    pub async fn profile(&self, user: UserId) -> Result<User> {
        self.users
            .get(user)
            .await?
            .ok_or_else(|| Error::not_found("user", user))
    }

    /// Applies a profile change.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an empty or overlong display name.
    pub async fn update_profile(&self, user: UserId, update: &ProfileUpdate) -> Result<User> {
        if let Some(name) = &update.display_name {
            let name = name.trim();
            if name.is_empty() || name.chars().count() > 100 {
                return Err(Error::Validation(
                    "display_name must be 1 to 100 characters".into(),
                ));
            }
            self.users.set_display_name(user, name).await?;
        }
        self.profile(user).await
    }

    /// The user's settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn settings(&self, user: UserId) -> Result<UserSettings> {
        self.users.settings(user).await
    }

    /// Applies a settings change.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for out-of-range values.
    pub async fn update_settings(&self, user: UserId, update: &SettingsUpdate) -> Result<UserSettings> {
        self.users.update_settings(user, update).await
    }

    /// Other users whose address starts with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an empty prefix.
    pub async fn search(&self, user: UserId, prefix: &str) -> Result<Vec<UserSummary>> {
        if prefix.trim().is_empty() {
            return Err(Error::Validation("search needs at least one character".into()));
        }
        self.users.search(prefix, user, SEARCH_LIMIT).await
    }

    /// Event counts over the last `days` days.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `days` is zero or above
    /// [`MAX_ANALYTICS_DAYS`].
    pub async fn analytics(&self, user: UserId, days: u32) -> Result<AnalyticsSummary> {
        if !(1..=MAX_ANALYTICS_DAYS).contains(&days) {
            return Err(Error::Validation(format!(
                "days must be between 1 and {MAX_ANALYTICS_DAYS}"
            )));
        }
        let since = Utc::now() - Duration::days(i64::from(days));
        self.analytics.summary(user, since).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::analytics::AnalyticsEvent;
    use crate::db::Database;

    #[tokio::test]
    async fn profile_settings_and_search() {
        let db = Database::in_memory().await.unwrap();
        let users = UserRepository::new(&db);
        let ada = users.create("ada@example.com", "Ada", "h").await.unwrap().id;
        users.create("adam@example.com", "Adam", "h").await.unwrap();
        users.create("bob@example.com", "Bob", "h").await.unwrap();
        let analytics = AnalyticsRepository::new(&db);
        let service = UserService::new(users, analytics.clone());

        let renamed = service
            .update_profile(ada, &ProfileUpdate { display_name: Some(" Ada L. ".into()) })
            .await
            .unwrap();
        assert_eq!(renamed.display_name, "Ada L.");
        assert!(service
            .update_profile(ada, &ProfileUpdate { display_name: Some(String::new()) })
            .await
            .is_err());

        let settings = service
            .update_settings(ada, &SettingsUpdate { page_size: Some(10), ..SettingsUpdate::default() })
            .await
            .unwrap();
        assert_eq!(settings.page_size, 10);

        let found = service.search(ada, "ada").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].email, "adam@example.com");
        assert!(service.search(ada, " ").await.is_err());

        analytics
            .record(ada, None, AnalyticsEvent::Opened, None, None)
            .await
            .unwrap();
        let summary = service.analytics(ada, 7).await.unwrap();
        assert_eq!(summary.count(AnalyticsEvent::Opened), 1);
        assert!(service.analytics(ada, 0).await.is_err());
    }
}
