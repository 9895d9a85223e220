//! Template storage.

use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};

use super::model::{Template, TemplateInput};
use crate::db::{Database, from_db_time, now};
use crate::error::is_unique_violation;
use crate::ids::{TemplateId, UserId};
use crate::{Error, Result};

const TEMPLATE_COLUMNS: &str =
    "id, user_id, name, subject, body_text, body_html, created_at, updated_at";

/// Repository for message templates.
#[derive(Debug, Clone)]
pub struct TemplateRepository {
    pool: SqlitePool,
}

impl TemplateRepository {
    /// Creates a repository over the shared store.
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Stores a new template.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for bad input and [`Error::Conflict`]
    /// if the name is taken.
    pub async fn create(&self, user: UserId, input: &TemplateInput) -> Result<Template> {
        input.validate()?;
        let now = now();
        let result = sqlx::query(
            r"
            INSERT INTO email_templates
                (user_id, name, subject, body_text, body_html, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(user.0)
        .bind(input.name.trim())
        .bind(&input.subject)
        .bind(&input.body_text)
        .bind(&input.body_html)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| name_conflict(e, &input.name))?;

        let id = TemplateId(result.last_insert_rowid());
        self.get(id).await?.ok_or_else(|| Error::not_found("template", id))
    }

    /// Gets a template.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: TemplateId) -> Result<Option<Template>> {
        let row = sqlx::query(&format!(
            "SELECT {TEMPLATE_COLUMNS} FROM email_templates WHERE id = ?"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_template))
    }

    /// The user's templates by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list(&self, user: UserId) -> Result<Vec<Template>> {
        let rows = sqlx::query(&format!(
            "SELECT {TEMPLATE_COLUMNS} FROM email_templates WHERE user_id = ? ORDER BY name"
        ))
        .bind(user.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_template).collect())
    }

    /// Replaces a template's fields.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`], [`Error::Conflict`] on a name clash,
    /// or [`Error::NotFound`].
    pub async fn update(&self, id: TemplateId, input: &TemplateInput) -> Result<Template> {
        input.validate()?;
        let result = sqlx::query(
            r"
            UPDATE email_templates
            SET name = ?, subject = ?, body_text = ?, body_html = ?, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(input.name.trim())
        .bind(&input.subject)
        .bind(&input.body_text)
        .bind(&input.body_html)
        .bind(now())
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| name_conflict(e, &input.name))?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("template", id));
        }
        self.get(id).await?.ok_or_else(|| Error::not_found("template", id))
    }

    /// Deletes a template.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete(&self, id: TemplateId) -> Result<()> {
        sqlx::query("DELETE FROM email_templates WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn name_conflict(err: sqlx::Error, name: &str) -> Error {
    if is_unique_violation(&err) {
        Error::Conflict(format!("template {:?} already exists", name.trim()))
    } else {
        err.into()
    }
}

fn row_to_template(row: &SqliteRow) -> Template {
    Template {
        id: TemplateId(row.get("id")),
        user_id: UserId(row.get("user_id")),
        name: row.get("name"),
        subject: row.get("subject"),
        body_text: row.get("body_text"),
        body_html: row.get("body_html"),
        created_at: from_db_time(row.get("created_at")),
        updated_at: from_db_time(row.get("updated_at")),
    }
}
