//! Email model types.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ids::{AttachmentId, EmailId, LabelId, ThreadId, UserId};

text_enum!(
    /// Where an email is filed.
    Folder {
        /// Received mail.
        Inbox => "inbox",
        /// Delivered outgoing mail.
        Sent => "sent",
        /// Unsent compositions.
        Drafts => "drafts",
        /// Mail waiting for or undergoing delivery.
        Outbox => "outbox",
        /// Kept but out of the inbox.
        Archive => "archive",
        /// Unwanted mail.
        Spam => "spam",
        /// Deleted mail, removable for good from here.
        Trash => "trash",
    }
);

text_enum!(
    /// Lifecycle of an email.
    EmailStatus {
        /// Being composed.
        Draft => "draft",
        /// Handed to the send pipeline.
        Queued => "queued",
        /// A send worker is delivering it.
        Sending => "sending",
        /// Every recipient accepted it.
        Sent => "sent",
        /// Some recipients accepted it, the rest bounced.
        PartiallySent => "partially_sent",
        /// No recipient accepted it.
        Failed => "failed",
        /// Arrived from someone else.
        Received => "received",
    }
);

text_enum!(
    /// Header a recipient appears in.
    RecipientKind {
        /// `To`.
        To => "to",
        /// `Cc`.
        Cc => "cc",
        /// Envelope only.
        Bcc => "bcc",
    }
);

text_enum!(
    /// Delivery state of one recipient.
    DeliveryStatus {
        /// Not attempted yet.
        Pending => "pending",
        /// Accepted by the destination.
        Delivered => "delivered",
        /// Temporarily refused; will be retried.
        Deferred => "deferred",
        /// Permanently refused.
        Bounced => "bounced",
    }
);

impl Folder {
    /// Folders a user may move mail into.
    #[must_use]
    pub const fn is_user_selectable(self) -> bool {
        !matches!(self, Self::Drafts | Self::Outbox)
    }
}

impl EmailStatus {
    /// True once the send pipeline has nothing left to do.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Sent | Self::PartiallySent | Self::Failed | Self::Received
        )
    }

    /// True while the email sits in the send pipeline.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Queued | Self::Sending)
    }
}

impl DeliveryStatus {
    /// True if the send worker should (re)try this recipient.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Deferred)
    }
}

/// One recipient of an email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recipient {
    /// Header it appears in.
    pub kind: RecipientKind,
    /// Address.
    pub address: String,
    /// Display name.
    pub name: Option<String>,
    /// Delivery state.
    pub delivery_status: DeliveryStatus,
    /// Delivery attempts made.
    pub attempts: u32,
    /// Last refusal or error text.
    pub last_error: Option<String>,
}

/// Attachment metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentMeta {
    /// Row id.
    pub id: AttachmentId,
    /// File name.
    pub filename: String,
    /// MIME type.
    pub content_type: String,
    /// Content-ID for inline parts.
    pub content_id: Option<String>,
    /// Size of the decoded content.
    pub size_bytes: i64,
}

/// Attachment with its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentData {
    /// Metadata.
    pub meta: AttachmentMeta,
    /// Decoded content.
    pub content: Vec<u8>,
}

/// Attachment supplied by a composer or a parsed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttachment {
    /// File name.
    pub filename: String,
    /// MIME type; guessed from the file name when absent.
    pub content_type: Option<String>,
    /// Content-ID for inline parts.
    pub content_id: Option<String>,
    /// Decoded content.
    pub content: Vec<u8>,
}

/// A label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Label {
    /// Row id.
    pub id: LabelId,
    /// Name, unique per user ignoring case.
    pub name: String,
    /// `#rrggbb` color.
    pub color: Option<String>,
}

/// A conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Thread {
    /// Row id.
    pub id: ThreadId,
    /// Owner.
    pub user_id: UserId,
    /// Subject of the first message.
    pub subject: String,
    /// Subject with reply prefixes removed, lowercase.
    pub normalized_subject: String,
    /// Number of emails in the thread.
    pub message_count: i64,
    /// Date of the newest email.
    pub last_message_at: DateTime<Utc>,
}

/// A full email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Email {
    /// Row id.
    pub id: EmailId,
    /// Owner.
    pub user_id: UserId,
    /// Conversation.
    pub thread_id: ThreadId,
    /// Message-ID without brackets.
    pub message_id: String,
    /// Parent Message-ID.
    pub in_reply_to: Option<String>,
    /// Ancestor Message-IDs, oldest first.
    pub references: Vec<String>,
    /// Author address.
    pub from_address: String,
    /// Author name.
    pub from_name: Option<String>,
    /// Subject.
    pub subject: String,
    /// Plain-text body.
    pub body_text: String,
    /// HTML body.
    pub body_html: Option<String>,
    /// Folder.
    pub folder: Folder,
    /// Lifecycle state.
    pub status: EmailStatus,
    /// Read flag.
    pub is_read: bool,
    /// Star flag.
    pub is_starred: bool,
    /// Size of the message as transmitted.
    pub size_bytes: i64,
    /// When it was sent.
    pub sent_at: Option<DateTime<Utc>>,
    /// When it arrived.
    pub received_at: Option<DateTime<Utc>>,
    /// Row creation.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
    /// Recipients in header order.
    pub recipients: Vec<Recipient>,
    /// Attachments.
    pub attachments: Vec<AttachmentMeta>,
    /// Applied labels.
    pub labels: Vec<Label>,
}

impl Email {
    /// Recipients of one kind.
    pub fn recipients_of(&self, kind: RecipientKind) -> impl Iterator<Item = &Recipient> {
        self.recipients.iter().filter(move |r| r.kind == kind)
    }

    /// Date shown to the user.
    #[must_use]
    pub fn date(&self) -> DateTime<Utc> {
        self.sent_at
            .or(self.received_at)
            .unwrap_or(self.created_at)
    }
}

/// A row of a mail list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailSummary {
    /// Row id.
    pub id: EmailId,
    /// Conversation.
    pub thread_id: ThreadId,
    /// Author address.
    pub from_address: String,
    /// Author name.
    pub from_name: Option<String>,
    /// Subject.
    pub subject: String,
    /// Start of the plain-text body.
    pub snippet: String,
    /// Folder.
    pub folder: Folder,
    /// Lifecycle state.
    pub status: EmailStatus,
    /// Read flag.
    pub is_read: bool,
    /// Star flag.
    pub is_starred: bool,
    /// True if at least one attachment exists.
    pub has_attachments: bool,
    /// Date shown to the user.
    pub date: DateTime<Utc>,
}

/// Filters for a mail list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    /// Folder; all folders except trash and spam when absent.
    pub folder: Option<Folder>,
    /// Only emails carrying this label.
    pub label: Option<LabelId>,
    /// Only unread emails.
    pub unread_only: bool,
    /// Only starred emails.
    pub starred_only: bool,
    /// Substring of subject, body or author.
    pub search: Option<String>,
    /// 1-based page.
    pub page: u32,
    /// Page size; the user's setting when zero.
    pub per_page: u32,
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// 1-based page number.
    pub page: u32,
    /// Page size.
    pub per_page: u32,
    /// Matching items across all pages.
    pub total: i64,
}

/// A thread with its emails, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadView {
    /// The thread.
    pub thread: Thread,
    /// Its emails.
    pub emails: Vec<EmailSummary>,
}

/// Content of a new or edited draft.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Compose {
    /// `To` addresses, in `Name <addr>` or bare form.
    pub to: Vec<String>,
    /// `Cc` addresses.
    pub cc: Vec<String>,
    /// `Bcc` addresses.
    pub bcc: Vec<String>,
    /// Subject.
    pub subject: String,
    /// Plain-text body.
    pub body_text: String,
    /// HTML body.
    pub body_html: Option<String>,
    /// Attachments to add.
    pub attachments: Vec<NewAttachment>,
}

/// Guesses a MIME type from a file name.
#[must_use]
pub fn guess_content_type(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" => "text/plain",
        "htm" | "html" => "text/html",
        "csv" => "text/csv",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ics" => "text/calendar",
        _ => "application/octet-stream",
    }
}
