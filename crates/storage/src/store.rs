use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::bridge::{NoopSaveTrigger, SaveTrigger, SnapshotSource};
use super::error::{NotFoundSnafu, StorageResult};
use super::history::HistoryStore;
use super::ids::{ConversationId, MessageId, RoundId};
use super::snapshot::{ConversationSnapshot, SNAPSHOT_VERSION, Snapshot};
use super::types::{Conversation, LastMessageSummary, MessageRecord, NewConversation, unix_timestamp_millis};

/// One conversation and its history behind a dedicated lock.
///
/// Components receive the sub-store of the conversation they work on, so work on
/// one conversation never contends with, or leaks into, another.
pub struct ConversationStore {
    id: ConversationId,
    conversation: Mutex<Conversation>,
    history: Mutex<HistoryStore>,
    saver: Arc<dyn SaveTrigger>,
}

impl ConversationStore {
    fn new(conversation: Conversation, history: HistoryStore, saver: Arc<dyn SaveTrigger>) -> Self {
        Self {
            id: conversation.id,
            conversation: Mutex::new(conversation),
            history: Mutex::new(history),
            saver,
        }
    }

    pub fn id(&self) -> ConversationId {
        self.id
    }

    pub fn conversation(&self) -> Conversation {
        self.conversation.lock().clone()
    }

    pub fn update_conversation(&self, update: impl FnOnce(&mut Conversation)) {
        {
            let mut conversation = self.conversation.lock();
            update(&mut conversation);
            conversation.id = self.id;
        }
        self.saver.request_save();
    }

    pub fn append(&self, record: MessageRecord) -> StorageResult<()> {
        {
            let mut history = self.history.lock();
            history.append(record)?;
            self.refresh_summary(&history);
        }
        self.saver.request_save();
        Ok(())
    }

    pub fn replace(&self, id: MessageId, record: MessageRecord) -> StorageResult<MessageRecord> {
        let previous = {
            let mut history = self.history.lock();
            let previous = history.replace(id, record)?;
            self.refresh_summary(&history);
            previous
        };
        self.saver.request_save();
        Ok(previous)
    }

    /// Applies `update` to a copy of the record and stores it under the same id.
    pub fn modify(
        &self,
        id: MessageId,
        update: impl FnOnce(&mut MessageRecord),
    ) -> StorageResult<MessageRecord> {
        let updated = {
            let mut history = self.history.lock();
            let Some(current) = history.get(id) else {
                return NotFoundSnafu {
                    stage: "conversation-modify",
                    entity: "message",
                    id: id.to_string(),
                }
                .fail();
            };
            let mut next = current.clone();
            update(&mut next);
            next.id = id;
            history.replace(id, next.clone())?;
            self.refresh_summary(&history);
            next
        };
        self.saver.request_save();
        Ok(updated)
    }

    pub fn remove(&self, id: MessageId) -> StorageResult<MessageRecord> {
        let removed = {
            let mut history = self.history.lock();
            let removed = history.remove(id)?;
            self.refresh_summary(&history);
            removed
        };
        self.saver.request_save();
        Ok(removed)
    }

    pub fn remove_round(&self, round_id: RoundId) -> Vec<MessageRecord> {
        let removed = {
            let mut history = self.history.lock();
            let removed = history.remove_round(round_id);
            self.refresh_summary(&history);
            removed
        };
        if !removed.is_empty() {
            self.saver.request_save();
        }
        removed
    }

    pub fn list(&self) -> Vec<MessageRecord> {
        self.history.lock().list().to_vec()
    }

    /// Runs `read` against the live history without cloning it.
    pub fn with_history<T>(&self, read: impl FnOnce(&HistoryStore) -> T) -> T {
        read(&self.history.lock())
    }

    pub fn position(&self, id: MessageId) -> Option<usize> {
        self.history.lock().position(id)
    }

    pub fn get(&self, id: MessageId) -> Option<MessageRecord> {
        self.history.lock().get(id).cloned()
    }

    /// Finds the newest record matching `predicate`.
    pub fn find_last(&self, predicate: impl Fn(&MessageRecord) -> bool) -> Option<MessageRecord> {
        self.history
            .lock()
            .list()
            .iter()
            .rev()
            .find(|record| predicate(record))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.lock().is_empty()
    }

    pub fn unread_count(&self) -> usize {
        self.history.lock().unread_count()
    }

    pub fn mark_all_read(&self) -> usize {
        let changed = self.history.lock().mark_all_read();
        if changed > 0 {
            self.saver.request_save();
        }
        changed
    }

    fn refresh_summary(&self, history: &HistoryStore) {
        let summary = history.last().map(|record| LastMessageSummary {
            text: record.kind.summary(),
            at_unix_ms: record.created_at_unix_ms,
        });
        self.conversation.lock().last_message = summary;
    }

    fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            conversation: self.conversation(),
            records: self.list(),
        }
    }
}

/// Owner of every conversation sub-store; the source of truth for chat state.
pub struct ChatStore {
    conversations: RwLock<BTreeMap<ConversationId, Arc<ConversationStore>>>,
    saver: Arc<dyn SaveTrigger>,
}

impl ChatStore {
    pub fn new(saver: Arc<dyn SaveTrigger>) -> Self {
        Self {
            conversations: RwLock::new(BTreeMap::new()),
            saver,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(NoopSaveTrigger))
    }

    /// Rebuilds the store from a snapshot. Conversations whose history is not
    /// well-formed are skipped and logged.
    pub fn restore(snapshot: Snapshot, saver: Arc<dyn SaveTrigger>) -> Self {
        let store = Self::new(saver);
        {
            let mut conversations = store.conversations.write();
            for entry in snapshot.conversations {
                let id = entry.conversation.id;
                match HistoryStore::from_records(entry.records) {
                    Ok(history) => {
                        conversations.insert(
                            id,
                            Arc::new(ConversationStore::new(
                                entry.conversation,
                                history,
                                Arc::clone(&store.saver),
                            )),
                        );
                    }
                    Err(error) => {
                        tracing::warn!(conversation = %id, "skipping unreadable conversation history: {error}");
                    }
                }
            }
        }
        store
    }

    pub fn create_conversation(&self, input: NewConversation) -> Arc<ConversationStore> {
        let conversation = Conversation {
            id: ConversationId::new_v7(),
            participant: input.participant,
            alias: input.alias,
            last_message: None,
            bindings: input.bindings,
            prefs: input.prefs,
        };
        let id = conversation.id;
        let store = Arc::new(ConversationStore::new(
            conversation,
            HistoryStore::new(),
            Arc::clone(&self.saver),
        ));
        self.conversations.write().insert(id, Arc::clone(&store));
        tracing::info!(conversation = %id, "created conversation");
        self.saver.request_save();
        store
    }

    pub fn conversation(&self, id: ConversationId) -> Option<Arc<ConversationStore>> {
        self.conversations.read().get(&id).cloned()
    }

    pub fn require_conversation(&self, id: ConversationId) -> StorageResult<Arc<ConversationStore>> {
        match self.conversation(id) {
            Some(store) => Ok(store),
            None => NotFoundSnafu {
                stage: "chat-store-require-conversation",
                entity: "conversation",
                id: id.to_string(),
            }
            .fail(),
        }
    }

    /// Removes a conversation together with its whole history.
    pub fn remove_conversation(&self, id: ConversationId) -> StorageResult<Conversation> {
        let Some(removed) = self.conversations.write().remove(&id) else {
            return NotFoundSnafu {
                stage: "chat-store-remove-conversation",
                entity: "conversation",
                id: id.to_string(),
            }
            .fail();
        };
        self.saver.request_save();
        Ok(removed.conversation())
    }

    pub fn list_conversations(&self) -> Vec<Conversation> {
        self.conversations
            .read()
            .values()
            .map(|store| store.conversation())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.conversations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.read().is_empty()
    }
}

impl SnapshotSource for ChatStore {
    fn snapshot(&self) -> Snapshot {
        let stores = self
            .conversations
            .read()
            .values()
            .cloned()
            .collect::<Vec<_>>();
        Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at_unix_ms: unix_timestamp_millis(),
            conversations: stores.iter().map(|store| store.snapshot()).collect(),
        }
    }
}
