/// Transport event payloads applied to the store.
pub mod events;
/// Typed identifiers for messages and backend-assigned tokens.
pub mod ids;
/// Domain entities for one chat turn.
pub mod message;
/// Immutable per-version view of the session.
pub mod snapshot;
/// The single-writer session state store.
pub mod store;

pub use events::StreamEvent;
pub use ids::{ConversationId, MessageId, TaskId};
pub use message::{Attachment, Message, MessageDraft, Role};
pub use snapshot::SessionSnapshot;
pub use store::{ObserverId, SessionStore, SnapshotObserver};
