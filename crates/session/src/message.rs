use serde::{Deserialize, Serialize};

use crate::ids::MessageId;

/// Chat speaker role, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Reference to a file uploaded through the external upload service.
///
/// Immutable once attached to a message; the upload service owns the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub upload_file_id: String,
}

/// One chat turn.
///
/// `text` grows monotonically while streaming. A message leaves the
/// streaming state through exactly one of finalize or manual stop, both
/// absorbing. `error` is orthogonal to the lifecycle and may be set or
/// cleared in any state, terminal ones included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub text: String,
    pub is_streaming: bool,
    pub was_manually_stopped: bool,
    pub error: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub(crate) fn from_draft(id: MessageId, draft: MessageDraft) -> Self {
        Self {
            id,
            role: draft.role,
            text: draft.text,
            is_streaming: draft.is_streaming,
            was_manually_stopped: draft.was_manually_stopped,
            error: draft.error,
            attachments: draft.attachments,
        }
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }
}

/// Message payload before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub role: Role,
    pub text: String,
    pub is_streaming: bool,
    pub was_manually_stopped: bool,
    pub error: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl MessageDraft {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            is_streaming: false,
            was_manually_stopped: false,
            error: None,
            attachments: Vec::new(),
        }
    }

    /// Creates a completed user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    /// Creates a completed assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    /// Creates the empty assistant placeholder a stream appends into.
    pub fn assistant_streaming() -> Self {
        let mut draft = Self::new(Role::Assistant, String::new());
        draft.is_streaming = true;
        draft
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_streaming_draft_starts_empty_and_streaming() {
        let draft = MessageDraft::assistant_streaming();

        assert_eq!(draft.role, Role::Assistant);
        assert!(draft.text.is_empty());
        assert!(draft.is_streaming);
        assert!(!draft.was_manually_stopped);
        assert_eq!(draft.error, None);
        assert!(draft.attachments.is_empty());
    }

    #[test]
    fn user_draft_with_attachments_keeps_attachment_order() {
        let attachments = vec![
            Attachment {
                id: "att-1".to_string(),
                name: "notes.txt".to_string(),
                size_bytes: 42,
                mime_type: "text/plain".to_string(),
                upload_file_id: "upload-1".to_string(),
            },
            Attachment {
                id: "att-2".to_string(),
                name: "diagram.png".to_string(),
                size_bytes: 1_024,
                mime_type: "image/png".to_string(),
                upload_file_id: "upload-2".to_string(),
            },
        ];

        let draft = MessageDraft::user("see attached").with_attachments(attachments.clone());

        assert_eq!(draft.attachments, attachments);
    }
}
