//! Reusable message templates with `{{ name }}` placeholders.

mod model;
mod repository;

pub use model::{MAX_TEMPLATE_NAME, Rendered, Template, TemplateInput, placeholders, render};
pub use repository::TemplateRepository;
