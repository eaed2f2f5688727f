use crate::ids::MessageId;
use crate::store::SessionStore;

/// Per-event payload delivered by the external streaming transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental text for the target message.
    Chunk(String),
    /// Natural end of generation.
    Completed,
    /// Generation failed; the payload is display text for the message row.
    Failed(String),
    /// The user stopped generation before completion.
    Stopped,
}

impl SessionStore {
    /// Applies one transport event to the target message.
    ///
    /// Failure records the error before ending the stream, so observers
    /// never see a finalized message momentarily missing its error text.
    /// Events for unknown ids fall through to the per-operation no-op
    /// contracts; the transport may keep emitting briefly after a stop.
    pub fn apply_stream_event(&self, id: MessageId, event: StreamEvent) {
        match event {
            StreamEvent::Chunk(chunk) => self.append_chunk(id, &chunk),
            StreamEvent::Completed => self.finalize(id),
            StreamEvent::Failed(message) => {
                self.set_error(id, Some(message));
                self.finalize(id);
            }
            StreamEvent::Stopped => self.mark_manually_stopped(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageDraft;

    #[test]
    fn chunk_then_completed_builds_and_finalizes_text() {
        let store = SessionStore::new();
        let message = store.add(MessageDraft::assistant_streaming());

        store.apply_stream_event(message.id, StreamEvent::Chunk("Hel".to_string()));
        store.apply_stream_event(message.id, StreamEvent::Chunk("lo".to_string()));
        store.apply_stream_event(message.id, StreamEvent::Completed);

        let snapshot = store.snapshot();
        let target = snapshot.message(message.id).expect("message present");
        assert_eq!(target.text, "Hello");
        assert!(!target.is_streaming);
        assert_eq!(snapshot.streaming_message_id, None);
    }

    #[test]
    fn failed_records_error_and_ends_stream() {
        let store = SessionStore::new();
        let message = store.add(MessageDraft::assistant_streaming());

        store.apply_stream_event(message.id, StreamEvent::Failed("upstream 500".to_string()));

        let snapshot = store.snapshot();
        let target = snapshot.message(message.id).expect("message present");
        assert_eq!(target.error.as_deref(), Some("upstream 500"));
        assert!(!target.is_streaming);
        assert!(!target.was_manually_stopped);
        assert_eq!(snapshot.streaming_message_id, None);
    }

    #[test]
    fn stopped_marks_manual_stop() {
        let store = SessionStore::new();
        let message = store.add(MessageDraft::assistant_streaming());

        store.apply_stream_event(message.id, StreamEvent::Stopped);

        let target = store
            .snapshot()
            .message(message.id)
            .cloned()
            .expect("message present");
        assert!(target.was_manually_stopped);
        assert!(!target.is_streaming);
        assert_eq!(target.error, None);
    }

    #[test]
    fn late_events_after_stop_are_tolerated() {
        let store = SessionStore::new();
        let message = store.add(MessageDraft::assistant_streaming());
        store.apply_stream_event(message.id, StreamEvent::Stopped);
        let settled = store.snapshot();

        // The producer may deliver a terminal event it had already queued.
        store.apply_stream_event(message.id, StreamEvent::Completed);
        store.apply_stream_event(MessageId::generate(), StreamEvent::Chunk("late".to_string()));

        assert_eq!(*store.snapshot(), *settled);
    }
}
