//! Typed row identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Wraps a raw row id.
            #[must_use]
            pub const fn new(id: i64) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identifies a user.
    UserId
);
id_type!(
    /// Identifies an email.
    EmailId
);
id_type!(
    /// Identifies a conversation thread.
    ThreadId
);
id_type!(
    /// Identifies a label.
    LabelId
);
id_type!(
    /// Identifies a template.
    TemplateId
);
id_type!(
    /// Identifies an attachment.
    AttachmentId
);
id_type!(
    /// Identifies a scheduled send.
    ScheduleId
);
