//! Emails, threads, recipients, attachments and labels.

mod label;
mod model;
mod repository;
mod subject;

pub use label::{LabelRepository, MAX_LABEL_NAME};
pub use model::{
    AttachmentData, AttachmentMeta, Compose, DeliveryStatus, Email, EmailStatus, EmailSummary,
    Folder, Label, ListQuery, NewAttachment, Page, Recipient, RecipientKind, Thread, ThreadView,
    guess_content_type,
};
pub use repository::{DraftContent, MailRepository, NewEmail, NewRecipient};
pub use subject::{forward_subject, normalize_subject, reply_subject};
