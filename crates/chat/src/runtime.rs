use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwapOption;
use murmur_directive::Extractor;
use murmur_storage::{
    ChatStore, Conversation, ConversationId, ConversationStore, Direction, JsonFileSnapshotStore,
    MessageId, MessageKind, MessageRecord, NewConversation, PersistenceBridge,
    PersistenceFailureSink, RoundId, SaveChannel, SnapshotStore, SqliteSnapshotStore,
    StorageError,
};
use parking_lot::Mutex;
use snafu::{ResultExt, Snafu};
use tokio::task::{JoinError, JoinHandle};

use crate::chat::{
    ActionDispatcher, CollaboratorError, Collaborators, ConversationView, DeliveryObserver,
    DeliveryTarget, InteractionEffect, MessageSequencer, NoticeSink, RenderSurface,
    ResponsePipeline,
};
use crate::settings::ChatSettings;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RuntimeError {
    #[snafu(display("chat storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("collaborator call failed on `{stage}`: {source}"))]
    Collaborator {
        stage: &'static str,
        source: CollaboratorError,
    },
    #[snafu(display("message '{id}' has no text on `{stage}`"))]
    NotText { stage: &'static str, id: MessageId },
    #[snafu(display("background task failed on `{stage}`: {source}"))]
    Task {
        stage: &'static str,
        source: JoinError,
    },
}

/// Handle to one scheduled round of deliveries.
#[derive(Debug)]
pub struct RoundTicket {
    pub conversation: ConversationId,
    pub round_id: RoundId,
    pub scheduled: usize,
    pub thinking: Option<String>,
    delivery: JoinHandle<usize>,
}

impl RoundTicket {
    /// Waits for the round and returns how many records it committed.
    pub async fn delivered(self) -> usize {
        match self.delivery.await {
            Ok(delivered) => delivered,
            Err(error) => {
                tracing::debug!(round = %self.round_id, "round stopped early: {error}");
                0
            }
        }
    }
}

struct ActiveView {
    conversation: ConversationId,
    target: Arc<Mutex<dyn DeliveryTarget>>,
}

/// The single on-screen view slot, read by the sequencer at delivery time.
#[derive(Default)]
pub struct ViewRegistry {
    active: ArcSwapOption<ActiveView>,
}

impl ViewRegistry {
    pub fn show(&self, conversation: ConversationId, target: Arc<Mutex<dyn DeliveryTarget>>) {
        self.active
            .store(Some(Arc::new(ActiveView { conversation, target })));
    }

    /// Clears the slot if it still shows `conversation`.
    pub fn hide(&self, conversation: ConversationId) {
        if self.showing() == Some(conversation) {
            self.active.store(None);
        }
    }

    pub fn showing(&self) -> Option<ConversationId> {
        self.active.load_full().map(|view| view.conversation)
    }

    pub fn refresh(&self, conversation: ConversationId, ids: &[MessageId]) {
        if let Some(view) = self.view_for(conversation) {
            view.target.lock().refresh(ids);
        }
    }

    pub fn rerender(&self, conversation: ConversationId) {
        if let Some(view) = self.view_for(conversation) {
            view.target.lock().rerender();
        }
    }

    fn deliver(&self, conversation: ConversationId, record: &MessageRecord, force_bottom: bool) {
        if let Some(view) = self.view_for(conversation) {
            view.target.lock().deliver(record, force_bottom);
        }
    }

    fn view_for(&self, conversation: ConversationId) -> Option<Arc<ActiveView>> {
        self.active
            .load_full()
            .filter(|view| view.conversation == conversation)
    }
}

impl DeliveryObserver for ViewRegistry {
    fn is_showing(&self, conversation: ConversationId) -> bool {
        self.showing() == Some(conversation)
    }

    fn delivered(&self, conversation: ConversationId, record: &MessageRecord) {
        self.deliver(conversation, record, false);
    }
}

struct NoticeOnFailure(Arc<dyn NoticeSink>);

impl PersistenceFailureSink for NoticeOnFailure {
    fn persistence_failed(&self, message: &str) {
        self.0
            .blocking_notice(&format!("Chat history could not be saved: {message}"));
    }
}

struct Persistence {
    bridge: Arc<PersistenceBridge>,
    writer: JoinHandle<()>,
}

/// Explicit context shared by every chat component: the store, the collaborators
/// and the background tasks that feed them.
pub struct ChatRuntime {
    settings: ChatSettings,
    store: Arc<ChatStore>,
    persistence: Option<Persistence>,
    collaborators: Collaborators,
    pipeline: ResponsePipeline,
    sequencer: MessageSequencer,
    views: Arc<ViewRegistry>,
    reply_gates: Mutex<HashMap<ConversationId, Arc<AtomicBool>>>,
}

impl ChatRuntime {
    /// Opens the durable store and restores the last snapshot. Must run inside a
    /// tokio runtime, which hosts the persistence writer.
    pub fn open(settings: ChatSettings, collaborators: Collaborators) -> RuntimeResult<Self> {
        let fallback: Arc<dyn SnapshotStore> = Arc::new(JsonFileSnapshotStore::new(
            settings.persistence.fallback_dir.clone(),
        ));
        let database_location = settings.persistence.database_path.to_string_lossy();
        let primary: Arc<dyn SnapshotStore> = match SqliteSnapshotStore::open(&database_location) {
            Ok(store) => Arc::new(store),
            Err(error) => {
                tracing::warn!("sqlite snapshot store unavailable, using JSON files only: {error}");
                Arc::clone(&fallback)
            }
        };

        let bridge = Arc::new(
            PersistenceBridge::new(primary, fallback)
                .with_debounce(settings.persistence.save_debounce())
                .with_failure_sink(Arc::new(NoticeOnFailure(Arc::clone(&collaborators.notices)))),
        );

        let store = match bridge.load() {
            Ok(Some(snapshot)) => {
                tracing::info!(conversations = snapshot.conversations.len(), "restored chat state");
                ChatStore::restore(snapshot, bridge.clone())
            }
            Ok(None) => ChatStore::new(bridge.clone()),
            Err(error) => {
                tracing::warn!("chat state unreadable, starting empty: {error}");
                ChatStore::new(bridge.clone())
            }
        };
        let store = Arc::new(store);
        let writer = bridge.spawn_writer(Arc::downgrade(&store));

        Ok(Self::assemble(
            settings,
            store,
            Some(Persistence { bridge, writer }),
            collaborators,
        ))
    }

    /// Runtime without durable storage.
    pub fn in_memory(settings: ChatSettings, collaborators: Collaborators) -> Self {
        Self::assemble(settings, Arc::new(ChatStore::in_memory()), None, collaborators)
    }

    fn assemble(
        settings: ChatSettings,
        store: Arc<ChatStore>,
        persistence: Option<Persistence>,
        collaborators: Collaborators,
    ) -> Self {
        let settings = settings.normalized();
        let views = Arc::new(ViewRegistry::default());
        let pipeline = ResponsePipeline::new(
            Extractor::new(settings.extractor.clone(), settings.pacing.clone()),
            ActionDispatcher::new(collaborators.clone()),
        );
        let sequencer = MessageSequencer::new(Arc::clone(&store), views.clone());
        tracing::info!(durable = persistence.is_some(), "chat runtime ready");

        Self {
            settings,
            store,
            persistence,
            collaborators,
            pipeline,
            sequencer,
            views,
            reply_gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<ChatStore> {
        &self.store
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn sequencer(&self) -> &MessageSequencer {
        &self.sequencer
    }

    pub fn views(&self) -> &ViewRegistry {
        &self.views
    }

    pub fn create_conversation(&self, input: NewConversation) -> Arc<ConversationStore> {
        self.store.create_conversation(input)
    }

    /// Removes a conversation, its history and every round still scheduled for it.
    pub fn remove_conversation(&self, conversation: ConversationId) -> RuntimeResult<Conversation> {
        self.sequencer.cancel_conversation(conversation);
        self.views.hide(conversation);
        self.reply_gates.lock().remove(&conversation);
        self.store
            .remove_conversation(conversation)
            .context(StorageSnafu {
                stage: "runtime-remove-conversation",
            })
    }

    /// Takes back a whole model reply: stops its pending deliveries, removes its
    /// records and rebuilds the view if the conversation is on screen.
    pub fn rollback_round(
        &self,
        conversation: ConversationId,
        round: RoundId,
    ) -> RuntimeResult<Vec<MessageRecord>> {
        let store = self
            .store
            .require_conversation(conversation)
            .context(StorageSnafu {
                stage: "runtime-rollback-round",
            })?;
        self.sequencer.cancel_round(conversation, round);
        let removed = store.remove_round(round);
        tracing::info!(%conversation, %round, removed = removed.len(), "rolled back round");
        if !removed.is_empty() {
            self.views.rerender(conversation);
        }
        Ok(removed)
    }

    /// Puts a conversation on screen. Its records are marked read.
    pub fn open_view<S>(
        &self,
        conversation: ConversationId,
        surface: S,
    ) -> RuntimeResult<Arc<Mutex<ConversationView<S>>>>
    where
        S: RenderSurface + 'static,
    {
        let store = self
            .store
            .require_conversation(conversation)
            .context(StorageSnafu {
                stage: "runtime-open-view",
            })?;
        store.mark_all_read();

        let mut view = ConversationView::new(
            store,
            surface,
            self.settings.render.clone(),
            self.settings.interaction.clone(),
            Arc::clone(&self.collaborators.translator),
            self.reply_gate(conversation),
        );
        view.render(true);

        let view = Arc::new(Mutex::new(view));
        let target: Arc<Mutex<dyn DeliveryTarget>> = view.clone();
        self.views.show(conversation, target);
        tracing::debug!(%conversation, "conversation view opened");
        Ok(view)
    }

    pub fn close_view(&self, conversation: ConversationId) {
        self.views.hide(conversation);
    }

    /// Appends a message written by the local user and shows it right away.
    pub fn send_user_message(&self, conversation: ConversationId, text: &str) -> RuntimeResult<MessageRecord> {
        let store = self
            .store
            .require_conversation(conversation)
            .context(StorageSnafu {
                stage: "runtime-send-user-message",
            })?;
        let mut record = MessageRecord::new(MessageKind::text(text.trim()), Direction::Outbound);
        record.read = true;
        store.append(record.clone()).context(StorageSnafu {
            stage: "runtime-send-user-message",
        })?;
        self.views.deliver(conversation, &record, true);
        Ok(record)
    }

    /// Interprets one model reply and schedules its records.
    pub fn ingest(&self, conversation: ConversationId, raw: &str) -> RuntimeResult<RoundTicket> {
        let store = self
            .store
            .require_conversation(conversation)
            .context(StorageSnafu {
                stage: "runtime-ingest",
            })?;

        let round = self.pipeline.ingest(&store, raw);
        if !round.updated.is_empty() {
            self.views.refresh(conversation, &round.updated);
        }

        let scheduled = round.entries.len();
        let delivery = self
            .sequencer
            .schedule(conversation, round.round_id, round.entries);
        Ok(RoundTicket {
            conversation,
            round_id: round.round_id,
            scheduled,
            thinking: round.thinking,
            delivery,
        })
    }

    /// Asks the model for a reply and ingests it. Returns `None` while another
    /// reply for the same conversation is still in flight.
    pub async fn request_reply(&self, conversation: ConversationId) -> RuntimeResult<Option<RoundTicket>> {
        let Some(in_flight) = InFlight::claim(self.reply_gate(conversation)) else {
            tracing::debug!(%conversation, "reply already in flight");
            return Ok(None);
        };

        let reply = self.collaborators.model.request_reply(conversation).await;
        drop(in_flight);
        let text = reply.context(CollaboratorSnafu {
            stage: "runtime-request-reply",
        })?;
        self.ingest(conversation, &text).map(Some)
    }

    /// Carries out the effects a view hands back to its host.
    pub async fn apply_effect(
        &self,
        conversation: ConversationId,
        effect: InteractionEffect,
    ) -> RuntimeResult<Option<RoundTicket>> {
        match effect {
            InteractionEffect::RequestReply => self.request_reply(conversation).await,
            other => {
                tracing::debug!(%conversation, ?other, "effect left to the host");
                Ok(None)
            }
        }
    }

    /// Translates a text record and stores the result as an annotation.
    pub async fn translate(&self, conversation: ConversationId, id: MessageId) -> RuntimeResult<()> {
        let store = self
            .store
            .require_conversation(conversation)
            .context(StorageSnafu {
                stage: "runtime-translate",
            })?;
        let text = match store.get(id).map(|record| record.kind) {
            Some(MessageKind::Text { text }) => text,
            _ => {
                return NotTextSnafu {
                    stage: "runtime-translate",
                    id,
                }
                .fail();
            }
        };

        let translation = self
            .collaborators
            .translator
            .translate(text)
            .await
            .context(CollaboratorSnafu {
                stage: "runtime-translate",
            })?;
        store
            .modify(id, |record| record.annotations.translation = Some(translation))
            .context(StorageSnafu {
                stage: "runtime-translate",
            })?;
        self.views.refresh(conversation, &[id]);
        Ok(())
    }

    /// Stops pending rounds and writes the final snapshot.
    pub async fn shutdown(self) -> RuntimeResult<Option<SaveChannel>> {
        self.sequencer.shutdown();
        let Some(persistence) = self.persistence else {
            return Ok(None);
        };
        persistence.writer.abort();

        let bridge = persistence.bridge;
        let store = self.store;
        let channel = tokio::task::spawn_blocking(move || bridge.flush(store.as_ref()))
            .await
            .context(TaskSnafu {
                stage: "runtime-shutdown-flush",
            })?
            .context(StorageSnafu {
                stage: "runtime-shutdown-flush",
            })?;
        tracing::info!(?channel, "chat state flushed");
        Ok(Some(channel))
    }

    fn reply_gate(&self, conversation: ConversationId) -> Arc<AtomicBool> {
        self.reply_gates
            .lock()
            .entry(conversation)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }
}

/// Holds a reply gate closed. Dropping it reopens the gate, even when the
/// request future is dropped mid-flight.
struct InFlight(Arc<AtomicBool>);

impl InFlight {
    fn claim(gate: Arc<AtomicBool>) -> Option<Self> {
        (!gate.swap(true, Ordering::AcqRel)).then(|| Self(gate))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::FutureExt;
    use futures::future::BoxFuture;

    use super::*;
    use crate::chat::{CollaboratorResult, HeadlessSurface, ModelCall};

    struct ScriptedModel(&'static str);

    impl ModelCall for ScriptedModel {
        fn request_reply(&self, _conversation: ConversationId) -> BoxFuture<'static, CollaboratorResult<String>> {
            let reply = self.0.to_string();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(reply)
            }
            .boxed()
        }
    }

    struct SlowModel;

    impl ModelCall for SlowModel {
        fn request_reply(&self, _conversation: ConversationId) -> BoxFuture<'static, CollaboratorResult<String>> {
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok("late".to_string())
            }
            .boxed()
        }
    }

    fn runtime(reply: &'static str) -> ChatRuntime {
        ChatRuntime::in_memory(
            ChatSettings::default(),
            Collaborators::local().with_model(Arc::new(ScriptedModel(reply))),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn on_screen_rounds_render_and_arrive_read() {
        let runtime = runtime("[MSG1]hi[/MSG1][MSG2]there[/MSG2]");
        let conversation = runtime.create_conversation(NewConversation::with_participant("Mio"));
        let view = runtime
            .open_view(conversation.id(), HeadlessSurface::default())
            .expect("open view");

        let ticket = runtime
            .request_reply(conversation.id())
            .await
            .expect("reply")
            .expect("not gated");
        assert_eq!(ticket.scheduled, 2);
        assert_eq!(ticket.delivered().await, 2);

        let records = conversation.list();
        assert!(records.iter().all(|record| record.read));
        assert_eq!(view.lock().renderer().surface().message_ids().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_reply_requests_are_gated() {
        let runtime = runtime("ok");
        let conversation = runtime.create_conversation(NewConversation::with_participant("Mio"));
        let (first, second) = tokio::join!(
            runtime.request_reply(conversation.id()),
            runtime.request_reply(conversation.id())
        );
        let gated = [first.expect("first"), second.expect("second")]
            .iter()
            .filter(|ticket| ticket.is_none())
            .count();
        assert_eq!(gated, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_reply_request_reopens_the_gate() {
        let runtime = ChatRuntime::in_memory(
            ChatSettings::default(),
            Collaborators::local().with_model(Arc::new(SlowModel)),
        );
        let conversation = runtime.create_conversation(NewConversation::with_participant("Mio"));

        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), runtime.request_reply(conversation.id())).await;
        assert!(abandoned.is_err());

        let ticket = runtime
            .request_reply(conversation.id())
            .await
            .expect("reply")
            .expect("gate reopened");
        assert_eq!(ticket.delivered().await, 1);
        assert_eq!(conversation.list()[0].kind.summary(), "late");
    }

    #[tokio::test(start_paused = true)]
    async fn rolling_back_rounds_clears_their_bubbles() {
        let runtime = runtime("unused");
        let conversation = runtime.create_conversation(NewConversation::with_participant("Mio"));
        let id = conversation.id();
        let view = runtime
            .open_view(id, HeadlessSurface::default())
            .expect("open view");
        let asked = runtime.send_user_message(id, "hello").expect("send");

        let finished = runtime
            .ingest(id, "[MSG1]hi[/MSG1][MSG2]there[/MSG2]")
            .expect("ingest");
        let finished_round = finished.round_id;
        assert_eq!(finished.delivered().await, 2);

        let pending = runtime.ingest(id, "first\n\nsecond").expect("ingest");
        let pending_round = pending.round_id;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(conversation.len(), 4);

        let removed = runtime.rollback_round(id, pending_round).expect("rollback");
        assert_eq!(removed.len(), 1);
        assert_eq!(pending.delivered().await, 0);
        assert_eq!(conversation.len(), 3);

        let removed = runtime.rollback_round(id, finished_round).expect("rollback");
        assert_eq!(removed.len(), 2);
        assert_eq!(conversation.list()[0].id, asked.id);
        assert_eq!(conversation.len(), 1);
        assert_eq!(view.lock().renderer().surface().message_ids(), vec![asked.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn rounds_for_a_hidden_conversation_stay_unread() {
        let runtime = runtime("[MSG1]psst[/MSG1]");
        let shown = runtime.create_conversation(NewConversation::with_participant("Mio"));
        let hidden = runtime.create_conversation(NewConversation::with_participant("Ren"));
        let view = runtime
            .open_view(shown.id(), HeadlessSurface::default())
            .expect("open view");

        let ticket = runtime.ingest(hidden.id(), "[MSG1]psst[/MSG1]").expect("ingest");
        ticket.delivered().await;

        assert_eq!(hidden.unread_count(), 1);
        assert!(view.lock().renderer().surface().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn removing_a_conversation_cancels_its_rounds() {
        let runtime = runtime("unused");
        let conversation = runtime.create_conversation(NewConversation::with_participant("Mio"));
        let ticket = runtime
            .ingest(conversation.id(), "one\n\ntwo\n\nthree")
            .expect("ingest");
        tokio::time::sleep(Duration::from_millis(10)).await;

        runtime.remove_conversation(conversation.id()).expect("remove");
        assert_eq!(ticket.delivered().await, 0);
        assert!(runtime.store().conversation(conversation.id()).is_none());
    }

    #[tokio::test]
    async fn translation_needs_a_text_record() {
        let runtime = runtime("unused");
        let conversation = runtime.create_conversation(NewConversation::with_participant("Mio"));
        let notice = MessageRecord::new(MessageKind::notice("joined"), Direction::Inbound);
        conversation.append(notice.clone()).expect("append");

        assert!(matches!(
            runtime.translate(conversation.id(), notice.id).await,
            Err(RuntimeError::NotText { .. })
        ));
    }

    #[tokio::test]
    async fn durable_runtime_restores_after_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut settings = ChatSettings::default();
        settings.persistence = crate::settings::PersistenceSettings::rooted_at(dir.path());

        let runtime = ChatRuntime::open(settings.clone(), Collaborators::local()).expect("open");
        let conversation = runtime.create_conversation(NewConversation::with_participant("Mio"));
        runtime
            .send_user_message(conversation.id(), "remember me")
            .expect("send");
        let id = conversation.id();
        assert!(runtime.shutdown().await.expect("shutdown").is_some());

        let reopened = ChatRuntime::open(settings, Collaborators::local()).expect("reopen");
        let restored = reopened.store().conversation(id).expect("restored");
        assert_eq!(restored.list()[0].kind.summary(), "remember me");
    }
}
