use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, MessageId, TaskId};
use crate::message::Message;

/// Immutable view of the session at one instant.
///
/// The store publishes a complete new snapshot after every mutation;
/// readers hold it behind an `Arc` and never see a partially applied
/// change. `streaming_message_id`, when set, references a message present
/// in `messages` whose `is_streaming` flag is true.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Insertion order is display order; append-only except for full clear.
    pub messages: Vec<Message>,
    pub streaming_message_id: Option<MessageId>,
    /// True between request dispatch and the first streamed token or
    /// non-streaming response.
    pub is_waiting_for_response: bool,
    /// `None` until the backend has persisted and identified the
    /// conversation.
    pub current_conversation_id: Option<ConversationId>,
    /// Identifier of the in-flight generation task, used for out-of-band
    /// cancellation.
    pub current_task_id: Option<TaskId>,
}

impl SessionSnapshot {
    /// True while a request is in flight or a stream is being applied.
    ///
    /// Consumers gate send controls on this instead of re-deriving the
    /// condition themselves.
    pub fn is_processing(&self) -> bool {
        self.is_waiting_for_response || self.streaming_message_id.is_some()
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == id)
    }

    /// The message the streaming pointer currently references, if any.
    pub fn streaming_message(&self) -> Option<&Message> {
        self.streaming_message_id.and_then(|id| self.message(id))
    }

    pub(crate) fn message_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|message| message.id == id)
    }
}
