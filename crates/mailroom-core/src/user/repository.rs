//! User, session and settings storage.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use tracing::debug;

use super::model::{SettingsUpdate, User, UserSettings, UserSummary};
use crate::db::{Database, begin_write, from_db_time, like_escape, now, to_db_time};
use crate::error::is_unique_violation;
use crate::ids::UserId;
use crate::{Error, Result};

const USER_COLUMNS: &str =
    "id, email, display_name, created_at, updated_at, last_login_at";

/// Repository for users and their sessions.
#[derive(Debug, Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    /// Creates a repository over the shared store.
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Inserts a user together with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] if the address is taken.
    pub async fn create(
        &self,
        email: &str,
        display_name: &str,
        password_hash: &str,
    ) -> Result<User> {
        let now = now();
        let mut tx = begin_write(&self.pool).await?;
        let result = sqlx::query(
            r"
            INSERT INTO users (email, display_name, password_hash, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(email)
        .bind(display_name)
        .bind(password_hash)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::Conflict(format!("{email} is already registered"))
            } else {
                e.into()
            }
        })?;
        let id = result.last_insert_rowid();

        sqlx::query("INSERT INTO user_settings (user_id, updated_at) VALUES (?, ?)")
            .bind(id)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(user_id = id, "user created");
        self.get(UserId(id))
            .await?
            .ok_or_else(|| Error::not_found("user", id))
    }

    /// Gets a user by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: UserId) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_user))
    }

    /// Gets a user by address, ignoring case.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = ? COLLATE NOCASE"
        ))
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_user))
    }

    /// Gets a user and the stored password hash by address.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn credentials(&self, email: &str) -> Result<Option<(User, String)>> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS}, password_hash FROM users WHERE email = ? COLLATE NOCASE"
        ))
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| (row_to_user(&row), row.get("password_hash"))))
    }

    /// Stored password hash of a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn password_hash(&self, id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT password_hash FROM users WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get("password_hash")))
    }

    /// Replaces the password hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn set_password_hash(&self, id: UserId, hash: &str) -> Result<()> {
        sqlx::query("UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?")
            .bind(hash)
            .bind(now())
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Changes the display name.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn set_display_name(&self, id: UserId, display_name: &str) -> Result<()> {
        sqlx::query("UPDATE users SET display_name = ?, updated_at = ? WHERE id = ?")
            .bind(display_name)
            .bind(now())
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Records a successful login.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn touch_login(&self, id: UserId) -> Result<()> {
        sqlx::query("UPDATE users SET last_login_at = ? WHERE id = ?")
            .bind(now())
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Users whose address or name starts with `prefix`, excluding `exclude`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn search(
        &self,
        prefix: &str,
        exclude: UserId,
        limit: u32,
    ) -> Result<Vec<UserSummary>> {
        let pattern = format!("{}%", like_escape(prefix.trim()));
        let rows = sqlx::query(
            r"
            SELECT id, email, display_name FROM users
            WHERE id != ?
              AND (email LIKE ? ESCAPE '\' OR display_name LIKE ? ESCAPE '\')
            ORDER BY email
            LIMIT ?
            ",
        )
        .bind(exclude.0)
        .bind(&pattern)
        .bind(&pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| UserSummary {
                id: UserId(row.get("id")),
                email: row.get("email"),
                display_name: row.get("display_name"),
            })
            .collect())
    }

    /// Settings of a user, created with defaults on first access.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn settings(&self, id: UserId) -> Result<UserSettings> {
        sqlx::query(
            r"
            INSERT INTO user_settings (user_id, updated_at) VALUES (?, ?)
            ON CONFLICT(user_id) DO NOTHING
            ",
        )
        .bind(id.0)
        .bind(now())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            r"
            SELECT user_id, signature, page_size, timezone, notifications_enabled, updated_at
            FROM user_settings WHERE user_id = ?
            ",
        )
        .bind(id.0)
        .fetch_one(&self.pool)
        .await?;

        Ok(UserSettings {
            user_id: UserId(row.get("user_id")),
            signature: row.get("signature"),
            page_size: row.get("page_size"),
            timezone: row.get("timezone"),
            notifications_enabled: row.get("notifications_enabled"),
            updated_at: from_db_time(row.get("updated_at")),
        })
    }

    /// Applies a partial settings change.
    ///
    /// # Errors
    ///
    /// Returns an error if validation or the database query fails.
    pub async fn update_settings(
        &self,
        id: UserId,
        update: &SettingsUpdate,
    ) -> Result<UserSettings> {
        update.validate()?;
        let current = self.settings(id).await?;

        let signature = match &update.signature {
            Some(s) if s.trim().is_empty() => None,
            Some(s) => Some(s.clone()),
            None => current.signature,
        };
        sqlx::query(
            r"
            UPDATE user_settings SET
                signature = ?, page_size = ?, timezone = ?,
                notifications_enabled = ?, updated_at = ?
            WHERE user_id = ?
            ",
        )
        .bind(signature)
        .bind(update.page_size.unwrap_or(current.page_size))
        .bind(update.timezone.as_ref().unwrap_or(&current.timezone))
        .bind(
            update
                .notifications_enabled
                .unwrap_or(current.notifications_enabled),
        )
        .bind(now())
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        self.settings(id).await
    }

    /// Stores a session by the hash of its token.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn create_session(
        &self,
        token_hash: &str,
        user: UserId,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO sessions (token_hash, user_id, created_at, expires_at)
            VALUES (?, ?, ?, ?)
            ",
        )
        .bind(token_hash)
        .bind(user.0)
        .bind(now())
        .bind(to_db_time(expires_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Owner and expiry of a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn session(&self, token_hash: &str) -> Result<Option<(UserId, DateTime<Utc>)>> {
        let row = sqlx::query("SELECT user_id, expires_at FROM sessions WHERE token_hash = ?")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| {
            (
                UserId(row.get("user_id")),
                from_db_time(row.get("expires_at")),
            )
        }))
    }

    /// Deletes one session.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete_session(&self, token_hash: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE token_hash = ?")
            .bind(token_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes every session of `user` except `keep`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete_other_sessions(&self, user: UserId, keep: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE user_id = ? AND token_hash != ?")
            .bind(user.0)
            .bind(keep)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Deletes sessions that expired before `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at < ?")
            .bind(to_db_time(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_user(row: &SqliteRow) -> User {
    let last_login: Option<String> = row.get("last_login_at");
    User {
        id: UserId(row.get("id")),
        email: row.get("email"),
        display_name: row.get("display_name"),
        created_at: from_db_time(row.get("created_at")),
        updated_at: from_db_time(row.get("updated_at")),
        last_login_at: last_login.as_deref().map(from_db_time),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn repo() -> UserRepository {
        UserRepository::new(&Database::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn create_and_lookup() {
        let repo = repo().await;
        let user = repo.create("ada@example.com", "Ada", "hash").await.unwrap();
        assert_eq!(repo.get(user.id).await.unwrap().unwrap().email, "ada@example.com");
        assert_eq!(
            repo.find_by_email("ADA@example.com").await.unwrap().unwrap().id,
            user.id
        );
        let (_, hash) = repo.credentials("ada@example.com").await.unwrap().unwrap();
        assert_eq!(hash, "hash");
        assert!(repo.find_by_email("bob@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() {
        let repo = repo().await;
        repo.create("ada@example.com", "Ada", "h").await.unwrap();
        let err = repo.create("Ada@Example.com", "Ada 2", "h").await;
        assert!(matches!(err, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn settings_default_and_update() {
        let repo = repo().await;
        let user = repo.create("ada@example.com", "Ada", "h").await.unwrap();
        let settings = repo.settings(user.id).await.unwrap();
        assert_eq!(settings.page_size, 25);
        assert_eq!(settings.timezone, "UTC");
        assert!(settings.notifications_enabled);

        let update = SettingsUpdate {
            signature: Some("-- Ada".into()),
            page_size: Some(50),
            ..SettingsUpdate::default()
        };
        let settings = repo.update_settings(user.id, &update).await.unwrap();
        assert_eq!(settings.signature.as_deref(), Some("-- Ada"));
        assert_eq!(settings.page_size, 50);

        let clear = SettingsUpdate {
            signature: Some(String::new()),
            ..SettingsUpdate::default()
        };
        let settings = repo.update_settings(user.id, &clear).await.unwrap();
        assert_eq!(settings.signature, None);
        assert_eq!(settings.page_size, 50);
    }

    #[tokio::test]
    async fn search_by_prefix_excludes_self() {
        let repo = repo().await;
        let ada = repo.create("ada@example.com", "Ada", "h").await.unwrap();
        repo.create("adam@example.com", "Adam", "h").await.unwrap();
        repo.create("bob@example.com", "Bob", "h").await.unwrap();
        repo.create("a_b@example.com", "Underscore", "h").await.unwrap();

        let found = repo.search("ad", ada.id, 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].email, "adam@example.com");

        // `_` is matched literally.
        let found = repo.search("a_", ada.id, 10).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn sessions_lifecycle() {
        let repo = repo().await;
        let user = repo.create("ada@example.com", "Ada", "h").await.unwrap();
        let later = Utc::now() + chrono::Duration::hours(1);
        let earlier = Utc::now() - chrono::Duration::hours(1);
        repo.create_session("a", user.id, later).await.unwrap();
        repo.create_session("b", user.id, later).await.unwrap();
        repo.create_session("old", user.id, earlier).await.unwrap();

        assert_eq!(repo.session("a").await.unwrap().unwrap().0, user.id);
        assert_eq!(repo.purge_expired_sessions(Utc::now()).await.unwrap(), 1);
        assert_eq!(repo.delete_other_sessions(user.id, "a").await.unwrap(), 1);
        assert!(repo.session("b").await.unwrap().is_none());
        repo.delete_session("a").await.unwrap();
        assert!(repo.session("a").await.unwrap().is_none());
    }
}
