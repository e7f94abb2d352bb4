use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use murmur_storage::{
    ChatStore, ConversationId, Direction, MessageId, MessageKind, MessageRecord, RoundId,
    unix_timestamp_millis,
};
use parking_lot::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;

/// One record waiting for its delivery time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledEntry {
    pub kind: MessageKind,
    pub direction: Direction,
    /// Delay after the previous entry of the same round.
    pub delay_ms: u64,
    pub reply_to: Option<MessageId>,
}

/// What the sequencer needs to know about the screen at delivery time.
pub trait DeliveryObserver: Send + Sync {
    fn is_showing(&self, conversation: ConversationId) -> bool;
    fn delivered(&self, conversation: ConversationId, record: &MessageRecord);
}

/// Observer for headless use: nothing is ever on screen.
#[derive(Debug, Default)]
pub struct Offscreen;

impl DeliveryObserver for Offscreen {
    fn is_showing(&self, _conversation: ConversationId) -> bool {
        false
    }

    fn delivered(&self, _conversation: ConversationId, _record: &MessageRecord) {}
}

/// Delivery tasks in flight, keyed by the conversation they write to.
#[derive(Debug, Default)]
struct DeliveryQueue {
    rounds: HashMap<ConversationId, Vec<(RoundId, AbortHandle)>>,
}

impl DeliveryQueue {
    fn register(&mut self, conversation: ConversationId, round: RoundId, handle: AbortHandle) {
        let rounds = self.rounds.entry(conversation).or_default();
        rounds.retain(|(_, handle)| !handle.is_finished());
        rounds.push((round, handle));
    }

    fn cancel(&mut self, conversation: ConversationId) -> usize {
        let Some(rounds) = self.rounds.remove(&conversation) else {
            return 0;
        };
        abort_all(rounds)
    }

    fn cancel_round(&mut self, conversation: ConversationId, round: RoundId) -> bool {
        let Some(rounds) = self.rounds.get_mut(&conversation) else {
            return false;
        };
        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(rounds)
            .into_iter()
            .partition(|(id, _)| *id == round);
        *rounds = rest;
        abort_all(matching) > 0
    }

    fn cancel_all(&mut self) -> usize {
        self.rounds.drain().map(|(_, rounds)| abort_all(rounds)).sum()
    }

    fn pending(&self, conversation: ConversationId) -> usize {
        self.rounds.get(&conversation).map_or(0, |rounds| {
            rounds
                .iter()
                .filter(|(_, handle)| !handle.is_finished())
                .count()
        })
    }
}

fn abort_all(rounds: Vec<(RoundId, AbortHandle)>) -> usize {
    let mut aborted = 0;
    for (_, handle) in rounds {
        if !handle.is_finished() {
            handle.abort();
            aborted += 1;
        }
    }
    aborted
}

/// Releases the records of a round one by one at their scheduled offsets.
///
/// Each record commits to the conversation it was scheduled for, whichever view
/// is on screen when it fires. Rounds run independently, so two rounds of one
/// conversation may interleave.
pub struct MessageSequencer {
    store: Arc<ChatStore>,
    observer: Arc<dyn DeliveryObserver>,
    queue: Mutex<DeliveryQueue>,
}

impl MessageSequencer {
    pub fn new(store: Arc<ChatStore>, observer: Arc<dyn DeliveryObserver>) -> Self {
        Self {
            store,
            observer,
            queue: Mutex::new(DeliveryQueue::default()),
        }
    }

    /// Spawns the delivery task of one round. The handle resolves to the number of
    /// records committed.
    pub fn schedule(
        &self,
        conversation: ConversationId,
        round: RoundId,
        entries: Vec<ScheduledEntry>,
    ) -> JoinHandle<usize> {
        let store = Arc::clone(&self.store);
        let observer = Arc::clone(&self.observer);
        let entry_count = entries.len();

        let task = tokio::spawn(async move {
            let started = Instant::now();
            let mut offset = Duration::ZERO;
            let mut last_created_at = 0_u64;
            let mut delivered = 0;

            for entry in entries {
                offset = offset.saturating_add(Duration::from_millis(entry.delay_ms));
                tokio::time::sleep_until(started + offset).await;

                let Some(target) = store.conversation(conversation) else {
                    tracing::debug!(%conversation, %round, "conversation gone, stopping delivery");
                    break;
                };

                let created_at = unix_timestamp_millis().max(last_created_at + 1);
                last_created_at = created_at;

                let mut record = MessageRecord::new(entry.kind, entry.direction)
                    .with_round(round)
                    .with_reply_to(entry.reply_to)
                    .with_created_at(created_at);
                let showing = observer.is_showing(conversation);
                record.read = showing;

                if let Err(error) = target.append(record.clone()) {
                    tracing::warn!(%conversation, %round, "failed to commit scheduled record: {error}");
                    continue;
                }
                delivered += 1;
                if showing {
                    observer.delivered(conversation, &record);
                }
            }

            tracing::debug!(%conversation, %round, delivered, "round delivered");
            delivered
        });

        tracing::debug!(%conversation, %round, entries = entry_count, "round scheduled");
        self.queue
            .lock()
            .register(conversation, round, task.abort_handle());
        task
    }

    /// Number of rounds of `conversation` that are still delivering.
    pub fn pending_rounds(&self, conversation: ConversationId) -> usize {
        self.queue.lock().pending(conversation)
    }

    /// Stops every undelivered round of a conversation that is being removed.
    pub fn cancel_conversation(&self, conversation: ConversationId) -> usize {
        let cancelled = self.queue.lock().cancel(conversation);
        if cancelled > 0 {
            tracing::info!(%conversation, cancelled, "cancelled pending rounds");
        }
        cancelled
    }

    /// Stops one round if it is still delivering.
    pub fn cancel_round(&self, conversation: ConversationId, round: RoundId) -> bool {
        let cancelled = self.queue.lock().cancel_round(conversation, round);
        if cancelled {
            tracing::debug!(%conversation, %round, "cancelled round");
        }
        cancelled
    }

    /// Stops every undelivered round. Used on teardown.
    pub fn shutdown(&self) -> usize {
        let cancelled = self.queue.lock().cancel_all();
        tracing::info!(cancelled, "message sequencer stopped");
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use murmur_storage::NewConversation;

    use super::*;

    #[derive(Default)]
    struct ScreenStub {
        showing: Mutex<Option<ConversationId>>,
        seen: Mutex<Vec<(ConversationId, MessageId)>>,
    }

    impl DeliveryObserver for ScreenStub {
        fn is_showing(&self, conversation: ConversationId) -> bool {
            *self.showing.lock() == Some(conversation)
        }

        fn delivered(&self, conversation: ConversationId, record: &MessageRecord) {
            self.seen.lock().push((conversation, record.id));
        }
    }

    fn text_entry(text: &str, delay_ms: u64) -> ScheduledEntry {
        ScheduledEntry {
            kind: MessageKind::text(text),
            direction: Direction::Inbound,
            delay_ms,
            reply_to: None,
        }
    }

    fn texts(records: &[MessageRecord]) -> Vec<String> {
        records.iter().map(|record| record.kind.summary()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn entries_land_at_their_offsets_in_order() {
        let store = Arc::new(ChatStore::in_memory());
        let conversation = store.create_conversation(NewConversation::with_participant("Mio"));
        let sequencer = MessageSequencer::new(store.clone(), Arc::new(Offscreen));

        let handle = sequencer.schedule(
            conversation.id(),
            RoundId::new_v7(),
            vec![text_entry("one", 0), text_entry("two", 800), text_entry("three", 600)],
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(texts(&conversation.list()), vec!["one"]);
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(texts(&conversation.list()), vec!["one", "two"]);
        assert_eq!(handle.await.expect("join"), 3);

        let records = conversation.list();
        assert_eq!(texts(&records), vec!["one", "two", "three"]);
        assert!(
            records
                .windows(2)
                .all(|pair| pair[0].created_at_unix_ms < pair[1].created_at_unix_ms)
        );
        assert!(records.iter().all(|record| !record.read));
    }

    #[tokio::test(start_paused = true)]
    async fn records_commit_to_their_own_conversation_after_a_switch() {
        let store = Arc::new(ChatStore::in_memory());
        let first = store.create_conversation(NewConversation::with_participant("Mio"));
        let second = store.create_conversation(NewConversation::with_participant("Ren"));
        let screen = Arc::new(ScreenStub::default());
        *screen.showing.lock() = Some(first.id());
        let sequencer = MessageSequencer::new(store.clone(), screen.clone());

        let handle = sequencer.schedule(
            first.id(),
            RoundId::new_v7(),
            vec![text_entry("seen", 0), text_entry("later", 1_000)],
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        *screen.showing.lock() = Some(second.id());
        handle.await.expect("join");

        let records = first.list();
        assert_eq!(texts(&records), vec!["seen", "later"]);
        assert!(records[0].read);
        assert!(!records[1].read);
        assert!(second.is_empty());
        assert_eq!(screen.seen.lock().as_slice(), &[(first.id(), records[0].id)]);
    }

    #[tokio::test(start_paused = true)]
    async fn two_rounds_of_one_conversation_interleave() {
        let store = Arc::new(ChatStore::in_memory());
        let conversation = store.create_conversation(NewConversation::with_participant("Mio"));
        let sequencer = MessageSequencer::new(store.clone(), Arc::new(Offscreen));

        let first = sequencer.schedule(
            conversation.id(),
            RoundId::new_v7(),
            vec![text_entry("a1", 0), text_entry("a2", 1_000)],
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = sequencer.schedule(
            conversation.id(),
            RoundId::new_v7(),
            vec![text_entry("b1", 0), text_entry("b2", 2_000)],
        );
        assert_eq!(sequencer.pending_rounds(conversation.id()), 2);

        first.await.expect("join");
        second.await.expect("join");
        assert_eq!(texts(&conversation.list()), vec!["a1", "b1", "a2", "b2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_a_conversation_stops_its_rounds() {
        let store = Arc::new(ChatStore::in_memory());
        let conversation = store.create_conversation(NewConversation::with_participant("Mio"));
        let sequencer = MessageSequencer::new(store.clone(), Arc::new(Offscreen));

        let handle = sequencer.schedule(
            conversation.id(),
            RoundId::new_v7(),
            vec![text_entry("now", 0), text_entry("never", 5_000)],
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sequencer.cancel_conversation(conversation.id()), 1);

        assert!(handle.await.expect_err("aborted").is_cancelled());
        assert_eq!(texts(&conversation.list()), vec!["now"]);
        assert_eq!(sequencer.pending_rounds(conversation.id()), 0);
    }
}
