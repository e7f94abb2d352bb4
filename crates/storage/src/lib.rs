pub mod bridge;
pub mod error;
pub mod history;
pub mod ids;
pub mod snapshot;
pub mod sqlite;
pub mod store;
pub mod types;

pub use bridge::{
    DEFAULT_SAVE_DEBOUNCE, NoopSaveTrigger, PersistenceBridge, PersistenceFailureSink,
    SaveChannel, SaveTrigger, SnapshotSource,
};
pub use error::{StorageError, StorageResult};
pub use history::HistoryStore;
pub use ids::{ConversationId, MessageId, RoundId};
pub use snapshot::{
    ConversationSnapshot, JsonFileSnapshotStore, MemorySnapshotStore, SNAPSHOT_KEY, Snapshot,
    SnapshotStore,
};
pub use sqlite::SqliteSnapshotStore;
pub use store::{ChatStore, ConversationStore};
pub use types::{
    Amount, Annotations, CallKind, CallOutcome, CardStatus, Conversation, DEFAULT_PARTICIPANT_NAME,
    Direction, LastMessageSummary, MessageKind, MessageRecord, NewConversation, Participant,
    PaymentCard, ResourceBindings, VisualPrefs, unix_timestamp_millis,
};
