//! Template types and placeholder rendering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::{TemplateId, UserId};
use crate::{Error, Result};

/// Longest accepted template name.
pub const MAX_TEMPLATE_NAME: usize = 100;

/// A saved message template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Template {
    /// Row id.
    pub id: TemplateId,
    /// Owner.
    pub user_id: UserId,
    /// Name, unique per user ignoring case.
    pub name: String,
    /// Subject, may contain placeholders.
    pub subject: String,
    /// Plain-text body, may contain placeholders.
    pub body_text: String,
    /// HTML body, may contain placeholders.
    pub body_html: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

/// Fields of a new or replaced template.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TemplateInput {
    /// Name.
    pub name: String,
    /// Subject.
    pub subject: String,
    /// Plain-text body.
    #[serde(default)]
    pub body_text: String,
    /// HTML body.
    #[serde(default)]
    pub body_html: Option<String>,
}

impl TemplateInput {
    /// Checks the name and that every placeholder is well formed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        let name = self.name.trim();
        if name.is_empty() || name.chars().count() > MAX_TEMPLATE_NAME {
            return Err(Error::Validation(format!(
                "template name must be 1 to {MAX_TEMPLATE_NAME} characters"
            )));
        }
        for text in [Some(&self.subject), Some(&self.body_text), self.body_html.as_ref()]
            .into_iter()
            .flatten()
        {
            placeholders(text)?;
        }
        Ok(())
    }
}

/// A template with its placeholders filled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rendered {
    /// Subject.
    pub subject: String,
    /// Plain-text body.
    pub body_text: String,
    /// HTML body.
    pub body_html: Option<String>,
}

impl Template {
    /// Fills in every `{{ name }}` placeholder from `vars`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if a placeholder has no value or is
    /// not closed.
    pub fn render(&self, vars: &BTreeMap<String, String>) -> Result<Rendered> {
        Ok(Rendered {
            subject: render(&self.subject, vars)?,
            body_text: render(&self.body_text, vars)?,
            body_html: self
                .body_html
                .as_deref()
                .map(|html| render(html, vars))
                .transpose()?,
        })
    }
}

/// Replaces `{{ name }}` placeholders in `text`.
///
/// # Errors
///
/// Returns [`Error::Validation`] for an unknown or unterminated placeholder.
pub fn render(text: &str, vars: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| Error::Validation("unterminated placeholder".into()))?;
        let name = after[..end].trim();
        let value = vars
            .get(name)
            .ok_or_else(|| Error::Validation(format!("no value for placeholder {name:?}")))?;
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Names of the placeholders in `text`, in order of appearance.
///
/// # Errors
///
/// Returns [`Error::Validation`] for an empty or unterminated placeholder.
pub fn placeholders(text: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| Error::Validation("unterminated placeholder".into()))?;
        let name = after[..end].trim();
        if name.is_empty() {
            return Err(Error::Validation("empty placeholder".into()));
        }
        names.push(name.to_string());
        rest = &after[end + 2..];
    }
    Ok(names)
}
