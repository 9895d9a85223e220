//! Label storage.

use sqlx::Row;
use sqlx::sqlite::SqlitePool;

use super::model::Label;
use crate::db::Database;
use crate::error::is_unique_violation;
use crate::ids::{EmailId, LabelId, UserId};
use crate::{Error, Result};

/// Longest accepted label name.
pub const MAX_LABEL_NAME: usize = 64;

/// Repository for labels and their links to emails.
#[derive(Debug, Clone)]
pub struct LabelRepository {
    pool: SqlitePool,
}

impl LabelRepository {
    /// Creates a repository over the shared store.
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Creates a label.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an empty or overlong name or a
    /// color that is not `#rrggbb`, and [`Error::Conflict`] if the user
    /// already has a label with this name.
    pub async fn create(&self, user: UserId, name: &str, color: Option<&str>) -> Result<Label> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_LABEL_NAME {
            return Err(Error::Validation(format!(
                "label name must be 1 to {MAX_LABEL_NAME} characters"
            )));
        }
        if let Some(color) = color {
            if !is_hex_color(color) {
                return Err(Error::Validation(format!("{color:?} is not a #rrggbb color")));
            }
        }

        let result = sqlx::query("INSERT INTO email_labels (user_id, name, color) VALUES (?, ?, ?)")
            .bind(user.0)
            .bind(name)
            .bind(color)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    Error::Conflict(format!("label {name:?} already exists"))
                } else {
                    e.into()
                }
            })?;

        Ok(Label {
            id: LabelId(result.last_insert_rowid()),
            name: name.to_string(),
            color: color.map(String::from),
        })
    }

    /// The user's labels by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list(&self, user: UserId) -> Result<Vec<Label>> {
        let rows = sqlx::query("SELECT id, name, color FROM email_labels WHERE user_id = ? ORDER BY name")
            .bind(user.0)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| Label {
                id: LabelId(row.get("id")),
                name: row.get("name"),
                color: row.get("color"),
            })
            .collect())
    }

    /// A label with its owner.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: LabelId) -> Result<Option<(UserId, Label)>> {
        let row = sqlx::query("SELECT id, user_id, name, color FROM email_labels WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| {
            (
                UserId(row.get("user_id")),
                Label {
                    id: LabelId(row.get("id")),
                    name: row.get("name"),
                    color: row.get("color"),
                },
            )
        }))
    }

    /// Deletes a label and unlinks it from every email.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete(&self, id: LabelId) -> Result<()> {
        sqlx::query("DELETE FROM email_labels WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Links a label to an email. Applying twice is harmless.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn apply(&self, email: EmailId, label: LabelId) -> Result<()> {
        sqlx::query(
            "INSERT INTO email_label_links (email_id, label_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(email.0)
        .bind(label.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Unlinks a label from an email.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn remove(&self, email: EmailId, label: LabelId) -> Result<()> {
        sqlx::query("DELETE FROM email_label_links WHERE email_id = ? AND label_id = ?")
            .bind(email.0)
            .bind(label.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn is_hex_color(color: &str) -> bool {
    color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::user::UserRepository;

    #[tokio::test]
    async fn create_list_and_delete() {
        let db = Database::in_memory().await.unwrap();
        let user = UserRepository::new(&db)
            .create("ada@example.com", "Ada", "h")
            .await
            .unwrap()
            .id;
        let labels = LabelRepository::new(&db);

        let work = labels.create(user, " Work ", Some("#1a2B3c")).await.unwrap();
        assert_eq!(work.name, "Work");
        labels.create(user, "home", None).await.unwrap();
        assert!(matches!(
            labels.create(user, "WORK", None).await,
            Err(Error::Conflict(_))
        ));

        let names: Vec<_> = labels.list(user).await.unwrap().into_iter().map(|l| l.name).collect();
        assert_eq!(names, vec!["home", "Work"]);

        let (owner, _) = labels.get(work.id).await.unwrap().unwrap();
        assert_eq!(owner, user);
        labels.delete(work.id).await.unwrap();
        assert!(labels.get(work.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_bad_input() {
        let db = Database::in_memory().await.unwrap();
        let user = UserRepository::new(&db)
            .create("ada@example.com", "Ada", "h")
            .await
            .unwrap()
            .id;
        let labels = LabelRepository::new(&db);
        assert!(matches!(labels.create(user, "  ", None).await, Err(Error::Validation(_))));
        assert!(matches!(
            labels.create(user, "x", Some("red")).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            labels.create(user, "x", Some("#12345g")).await,
            Err(Error::Validation(_))
        ));
    }
}
