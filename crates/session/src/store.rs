use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;

use crate::ids::{ConversationId, MessageId, TaskId};
use crate::message::{Message, MessageDraft};
use crate::snapshot::SessionSnapshot;

/// Callback invoked with the freshly published snapshot after a mutation.
pub type SnapshotObserver = Box<dyn Fn(&Arc<SessionSnapshot>) + Send + Sync>;

/// Handle for removing a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Single source of truth for the active chat session.
///
/// Every mutation is synchronous and total: it clones the current
/// snapshot, applies the change, publishes the new version, and walks the
/// observer list on the caller's thread. Operations targeting an id with
/// no matching message are silent no-ops: stream events race
/// user-initiated stop and clear, and late deliveries must not fault the
/// session.
///
/// The store expects a single writer. Observer callbacks run while the
/// observer list is borrowed, so they must not subscribe or unsubscribe.
pub struct SessionStore {
    snapshot: ArcSwap<SessionSnapshot>,
    observers: Mutex<Vec<(ObserverId, SnapshotObserver)>>,
    next_observer_id: AtomicU64,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(SessionSnapshot::default()),
            observers: Mutex::new(Vec::new()),
            next_observer_id: AtomicU64::new(1),
        }
    }

    /// Returns the current immutable snapshot.
    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshot.load_full()
    }

    /// True while a request is in flight or a stream is being applied.
    pub fn is_processing(&self) -> bool {
        self.snapshot.load().is_processing()
    }

    /// Registers an observer notified after every state-changing mutation.
    pub fn subscribe(
        &self,
        observer: impl Fn(&Arc<SessionSnapshot>) + Send + Sync + 'static,
    ) -> ObserverId {
        let id = ObserverId(self.next_observer_id.fetch_add(1, Ordering::Relaxed));
        self.lock_observers().push((id, Box::new(observer)));
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) {
        self.lock_observers()
            .retain(|(observer_id, _)| *observer_id != id);
    }

    /// Appends a new message and returns it with its freshly minted id.
    ///
    /// A streaming draft moves the streaming pointer to the new message,
    /// overwriting any previous value; callers end the previous stream
    /// before starting another, the store does not scan for stale flags.
    pub fn add(&self, draft: MessageDraft) -> Message {
        let id = MessageId::generate();
        let message = Message::from_draft(id, draft);
        let streaming = message.is_streaming;
        let returned = message.clone();

        self.update(move |state| {
            state.messages.push(message);
            if streaming {
                state.streaming_message_id = Some(id);
            }
            Some(())
        });

        tracing::debug!(message_id = %id, streaming, "message added");
        returned
    }

    /// Concatenates a streamed chunk onto the matching message's text.
    ///
    /// No guard exists against appending to an already-finalized message;
    /// not sending chunks after a terminal event is the producer's
    /// responsibility.
    pub fn append_chunk(&self, id: MessageId, chunk: &str) {
        self.update(|state| {
            let message = state.message_mut(id)?;
            message.text.push_str(chunk);
            Some(())
        });
    }

    /// Marks natural completion of the stream feeding `id`.
    ///
    /// The streaming pointer is cleared only when it references `id`;
    /// finalizing a stale reference leaves an unrelated live stream
    /// untouched.
    pub fn finalize(&self, id: MessageId) {
        let changed = self.update(|state| {
            let mut changed = false;

            if let Some(message) = state.message_mut(id) {
                changed |= message.is_streaming;
                message.is_streaming = false;
            }
            if state.streaming_message_id == Some(id) {
                state.streaming_message_id = None;
                changed = true;
            }

            changed.then_some(())
        });

        if changed.is_some() {
            tracing::debug!(message_id = %id, "stream finalized");
        }
    }

    /// Forced-terminal transition for user-initiated stop.
    ///
    /// Sets the stop marker and ends streaming in the same published
    /// snapshot; distinct from [`SessionStore::finalize`] so the view can
    /// tell an interrupted response from a completed one.
    pub fn mark_manually_stopped(&self, id: MessageId) {
        let changed = self.update(|state| {
            let mut changed = false;

            if let Some(message) = state.message_mut(id) {
                changed |= message.is_streaming || !message.was_manually_stopped;
                message.was_manually_stopped = true;
                message.is_streaming = false;
            }
            if state.streaming_message_id == Some(id) {
                state.streaming_message_id = None;
                changed = true;
            }

            changed.then_some(())
        });

        if changed.is_some() {
            tracing::debug!(message_id = %id, "stream manually stopped");
        }
    }

    /// Sets or clears the display error on the matching message.
    ///
    /// Error state is orthogonal: it coexists with streaming and with both
    /// terminal states, and touches nothing else.
    pub fn set_error(&self, id: MessageId, error: Option<String>) {
        self.update(|state| {
            let message = state.message_mut(id)?;
            if message.error == error {
                return None;
            }
            message.error = error;
            Some(())
        });
    }

    /// Empties the message list and clears the streaming pointer.
    ///
    /// The waiting flag, conversation id, and task id are session-identity
    /// fields independent of message history and survive the clear.
    pub fn clear(&self) {
        self.update(|state| {
            if state.messages.is_empty() && state.streaming_message_id.is_none() {
                return None;
            }
            state.messages.clear();
            state.streaming_message_id = None;
            Some(())
        });
    }

    pub fn set_waiting(&self, waiting: bool) {
        self.update(|state| {
            if state.is_waiting_for_response == waiting {
                return None;
            }
            state.is_waiting_for_response = waiting;
            Some(())
        });
    }

    pub fn set_conversation_id(&self, conversation_id: Option<ConversationId>) {
        self.update(|state| {
            if state.current_conversation_id == conversation_id {
                return None;
            }
            state.current_conversation_id = conversation_id;
            Some(())
        });
    }

    pub fn set_task_id(&self, task_id: Option<TaskId>) {
        self.update(|state| {
            if state.current_task_id == task_id {
                return None;
            }
            state.current_task_id = task_id;
            Some(())
        });
    }

    // Publishes only when the closure reports a change, so value-identical
    // setter calls and missing-id no-ops do not wake observers.
    fn update<R>(&self, mutate: impl FnOnce(&mut SessionSnapshot) -> Option<R>) -> Option<R> {
        let mut next = SessionSnapshot::clone(&self.snapshot.load());
        let outcome = mutate(&mut next);
        if outcome.is_some() {
            self.publish(next);
        }
        outcome
    }

    fn publish(&self, next: SessionSnapshot) {
        let shared = Arc::new(next);
        self.snapshot.store(Arc::clone(&shared));

        for (_, observer) in self.lock_observers().iter() {
            observer(&shared);
        }
    }

    fn lock_observers(&self) -> MutexGuard<'_, Vec<(ObserverId, SnapshotObserver)>> {
        // Observer callbacks never panic by contract; recover the list if
        // one did rather than wedging every later mutation.
        self.observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::message::Role;

    #[test]
    fn add_returns_message_with_minted_id_and_appends_in_order() {
        let store = SessionStore::new();

        let first = store.add(MessageDraft::user("hi"));
        let second = store.add(MessageDraft::assistant("hello"));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.messages[0].id, first.id);
        assert_eq!(snapshot.messages[1].id, second.id);
        assert_ne!(first.id, second.id);
        assert_eq!(first.role, Role::User);
        assert_eq!(first.text, "hi");
    }

    #[test]
    fn add_streaming_sets_pointer_and_exactly_one_streaming_message() {
        let store = SessionStore::new();
        store.add(MessageDraft::user("hi"));

        let assistant = store.add(MessageDraft::assistant_streaming());

        let snapshot = store.snapshot();
        assert_eq!(snapshot.streaming_message_id, Some(assistant.id));
        let streaming_count = snapshot
            .messages
            .iter()
            .filter(|message| message.is_streaming)
            .count();
        assert_eq!(streaming_count, 1);
        assert_eq!(snapshot.streaming_message(), snapshot.message(assistant.id));
    }

    #[test]
    fn add_streaming_overwrites_previous_pointer() {
        let store = SessionStore::new();
        let first = store.add(MessageDraft::assistant_streaming());
        store.finalize(first.id);

        let second = store.add(MessageDraft::assistant_streaming());

        assert_eq!(store.snapshot().streaming_message_id, Some(second.id));
    }

    #[test]
    fn append_chunk_concatenates_in_call_order() {
        let store = SessionStore::new();
        let message = store.add(MessageDraft::assistant_streaming());

        store.append_chunk(message.id, "a");
        store.append_chunk(message.id, "b");

        let snapshot = store.snapshot();
        assert_eq!(snapshot.message(message.id).map(|m| m.text.as_str()), Some("ab"));
    }

    #[test]
    fn append_chunk_for_unknown_id_is_a_silent_no_op() {
        let store = SessionStore::new();
        store.add(MessageDraft::user("hi"));
        let before = store.snapshot();

        store.append_chunk(MessageId::generate(), "ghost");

        assert_eq!(*store.snapshot(), *before);
    }

    #[test]
    fn finalize_clears_pointer_and_streaming_flag_together() {
        let store = SessionStore::new();
        let message = store.add(MessageDraft::assistant_streaming());

        store.finalize(message.id);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.streaming_message_id, None);
        assert_eq!(snapshot.message(message.id).map(|m| m.is_streaming), Some(false));
    }

    #[test]
    fn finalize_of_unrelated_message_leaves_pointer_untouched() {
        let store = SessionStore::new();
        let finished = store.add(MessageDraft::assistant("done"));
        let live = store.add(MessageDraft::assistant_streaming());

        store.finalize(finished.id);

        assert_eq!(store.snapshot().streaming_message_id, Some(live.id));
    }

    #[test]
    fn finalize_is_absorbing() {
        let store = SessionStore::new();
        let message = store.add(MessageDraft::assistant_streaming());
        store.finalize(message.id);
        let settled = store.snapshot();

        store.finalize(message.id);

        assert_eq!(*store.snapshot(), *settled);
    }

    #[test]
    fn mark_manually_stopped_sets_both_flags_atomically() {
        let store = SessionStore::new();
        let message = store.add(MessageDraft::assistant_streaming());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_observer = Arc::clone(&seen);
        store.subscribe(move |snapshot| {
            if let Some(message) = snapshot.messages.last() {
                seen_by_observer
                    .lock()
                    .expect("observer log lock")
                    .push((message.is_streaming, message.was_manually_stopped));
            }
        });

        store.mark_manually_stopped(message.id);

        let snapshot = store.snapshot();
        let stopped = snapshot.message(message.id).expect("message present");
        assert!(!stopped.is_streaming);
        assert!(stopped.was_manually_stopped);
        assert_eq!(snapshot.streaming_message_id, None);
        // The observer never saw an intermediate flag combination.
        assert_eq!(
            *seen.lock().expect("observer log lock"),
            vec![(false, true)]
        );
    }

    #[test]
    fn stop_transitions_is_processing_when_not_waiting() {
        let store = SessionStore::new();
        let message = store.add(MessageDraft::assistant_streaming());
        assert!(store.is_processing());

        store.mark_manually_stopped(message.id);

        assert!(!store.is_processing());
    }

    #[test]
    fn set_error_then_clear_restores_prior_state() {
        let store = SessionStore::new();
        let message = store.add(MessageDraft::assistant("hello"));
        let before = store.snapshot();

        store.set_error(message.id, Some("boom".to_string()));
        assert_eq!(
            store
                .snapshot()
                .message(message.id)
                .and_then(|m| m.error.clone()),
            Some("boom".to_string())
        );

        store.set_error(message.id, None);
        assert_eq!(*store.snapshot(), *before);
    }

    #[test]
    fn set_error_coexists_with_terminal_state() {
        let store = SessionStore::new();
        let message = store.add(MessageDraft::assistant_streaming());
        store.finalize(message.id);

        store.set_error(message.id, Some("late failure".to_string()));

        let snapshot = store.snapshot();
        let target = snapshot.message(message.id).expect("message present");
        assert!(!target.is_streaming);
        assert_eq!(target.error.as_deref(), Some("late failure"));
    }

    #[test]
    fn clear_preserves_session_identity_fields() {
        let store = SessionStore::new();
        store.set_waiting(true);
        store.set_conversation_id(Some(ConversationId::new("conv-9")));
        store.set_task_id(Some(TaskId::new("task-3")));
        store.add(MessageDraft::user("hi"));
        store.add(MessageDraft::assistant_streaming());

        store.clear();

        let snapshot = store.snapshot();
        assert!(snapshot.messages.is_empty());
        assert_eq!(snapshot.streaming_message_id, None);
        assert!(snapshot.is_waiting_for_response);
        assert_eq!(
            snapshot.current_conversation_id,
            Some(ConversationId::new("conv-9"))
        );
        assert_eq!(snapshot.current_task_id, Some(TaskId::new("task-3")));
    }

    #[test]
    fn message_count_only_grows_on_add_and_resets_on_clear() {
        let store = SessionStore::new();
        let user = store.add(MessageDraft::user("hi"));
        let assistant = store.add(MessageDraft::assistant_streaming());
        assert_eq!(store.snapshot().messages.len(), 2);

        store.append_chunk(assistant.id, "partial");
        store.set_error(user.id, Some("oops".to_string()));
        store.finalize(assistant.id);
        store.mark_manually_stopped(assistant.id);
        store.set_waiting(true);
        assert_eq!(store.snapshot().messages.len(), 2);

        store.clear();
        assert_eq!(store.snapshot().messages.len(), 0);
    }

    #[test]
    fn is_processing_derives_from_waiting_or_pointer() {
        let store = SessionStore::new();
        assert!(!store.is_processing());

        store.set_waiting(true);
        assert!(store.is_processing());

        store.set_waiting(false);
        let message = store.add(MessageDraft::assistant_streaming());
        assert!(store.is_processing());

        store.finalize(message.id);
        assert!(!store.is_processing());
    }

    #[test]
    fn setters_are_independent_flags() {
        let store = SessionStore::new();

        store.set_task_id(Some(TaskId::new("task-1")));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.current_task_id, Some(TaskId::new("task-1")));
        assert!(!snapshot.is_waiting_for_response);
        assert_eq!(snapshot.current_conversation_id, None);
    }

    #[test]
    fn observers_see_one_snapshot_per_state_change_and_none_after_unsubscribe() {
        let store = SessionStore::new();
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        let observer = store.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let message = store.add(MessageDraft::assistant_streaming());
        store.append_chunk(message.id, "a");
        store.append_chunk(MessageId::generate(), "dropped");
        store.set_waiting(false);
        assert_eq!(notified.load(Ordering::SeqCst), 2);

        store.unsubscribe(observer);
        store.finalize(message.id);
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn full_streaming_round_trip_matches_expected_final_state() {
        let store = SessionStore::new();
        store.add(MessageDraft::user("hi"));
        let assistant = store.add(MessageDraft::assistant_streaming());

        store.append_chunk(assistant.id, "He");
        store.append_chunk(assistant.id, "llo");
        store.finalize(assistant.id);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.messages[0].role, Role::User);
        assert_eq!(snapshot.messages[0].text, "hi");
        assert_eq!(snapshot.messages[1].role, Role::Assistant);
        assert_eq!(snapshot.messages[1].text, "Hello");
        assert!(!snapshot.messages[1].is_streaming);
        assert_eq!(snapshot.streaming_message_id, None);
        assert_eq!(snapshot.is_processing(), snapshot.is_waiting_for_response);
    }

    #[test]
    fn snapshot_serializes_with_stable_field_names() {
        let store = SessionStore::new();
        store.set_conversation_id(Some(ConversationId::new("conv-1")));
        store.add(MessageDraft::user("hi"));

        let serialized =
            serde_json::to_value(store.snapshot().as_ref()).expect("snapshot serializes");

        assert_eq!(serialized["current_conversation_id"], "conv-1");
        assert_eq!(serialized["messages"][0]["role"], "user");
        assert_eq!(serialized["messages"][0]["text"], "hi");
    }
}
