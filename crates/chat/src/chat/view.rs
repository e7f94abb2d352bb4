use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use futures::future::BoxFuture;
use murmur_storage::{
    ConversationId, ConversationStore, Direction, MessageId, MessageKind, MessageRecord,
    StorageError,
};
use snafu::{ResultExt, Snafu};
use tokio::time::Instant;

use super::collaborators::{CollaboratorResult, Translator};
use super::interaction::{
    InteractionConfig, InteractionDelegate, InteractionEffect, LayoutProbe,
    PointerEvent,
};
use super::renderer::{RenderConfig, VirtualScrollState, WindowedRenderer};
use super::surface::{ElementRect, RenderSurface};

pub type ViewResult<T> = Result<T, ViewError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ViewError {
    #[snafu(display("history update failed on `{stage}`: {source}"))]
    History {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("message '{id}' cannot be changed on `{stage}`: {reason}"))]
    Unchangeable {
        stage: &'static str,
        id: MessageId,
        reason: &'static str,
    },
}

/// Receives records delivered to the conversation that is on screen.
pub trait DeliveryTarget: Send {
    /// `force_bottom` scrolls even when the reader has scrolled away.
    fn deliver(&mut self, record: &MessageRecord, force_bottom: bool);
    /// Re-renders records that were changed in place.
    fn refresh(&mut self, ids: &[MessageId]);
    /// Rebuilds the window after records left the history.
    fn rerender(&mut self);
}

impl<S: RenderSurface> LayoutProbe for WindowedRenderer<S> {
    fn element_rect(&self, id: MessageId) -> Option<ElementRect> {
        WindowedRenderer::element_rect(self, id)
    }

    fn viewport_height(&self) -> f32 {
        self.metrics().map_or(0., |metrics| metrics.client_height)
    }
}

/// One conversation on screen: its history sub-store, renderer and input delegate.
pub struct ConversationView<S> {
    store: Arc<ConversationStore>,
    renderer: WindowedRenderer<S>,
    delegate: InteractionDelegate,
    translator: Arc<dyn Translator>,
}

impl<S: RenderSurface> ConversationView<S> {
    pub fn new(
        store: Arc<ConversationStore>,
        surface: S,
        render: RenderConfig,
        interaction: InteractionConfig,
        translator: Arc<dyn Translator>,
        reply_in_flight: Arc<AtomicBool>,
    ) -> Self {
        let participant = store.conversation().display_name().to_string();
        let mut delegate = InteractionDelegate::new(interaction, reply_in_flight);
        delegate.attach();
        Self {
            store,
            renderer: WindowedRenderer::new(surface, render, participant),
            delegate,
            translator,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.store.id()
    }

    pub fn renderer(&self) -> &WindowedRenderer<S> {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut WindowedRenderer<S> {
        &mut self.renderer
    }

    pub fn scroll_state(&self) -> VirtualScrollState {
        self.renderer.state()
    }

    pub fn render(&mut self, force_bottom: bool) {
        let participant = self.store.conversation().display_name().to_string();
        self.renderer.set_participant(participant);
        self.renderer.render(&self.store.list(), force_bottom);
    }

    pub fn render_all(&mut self) {
        self.renderer.render_all(&self.store.list());
    }

    pub fn render_window(&mut self) {
        self.renderer.render_window(&self.store.list());
    }

    pub fn load_more(&mut self) -> bool {
        self.renderer.load_more(&self.store.list())
    }

    pub fn on_frame(&mut self) {
        self.renderer.on_frame();
    }

    pub fn on_scroll(&mut self, now: Instant) -> bool {
        self.renderer.on_scroll(&self.store.list(), now)
    }

    pub fn on_tick(&mut self, now: Instant) -> Option<InteractionEffect> {
        self.delegate.on_tick(now, &self.renderer)
    }

    pub fn is_multi_select(&self) -> bool {
        self.delegate.is_multi_select()
    }

    pub fn enter_multi_select(&mut self) {
        self.delegate.set_multi_select(true);
    }

    /// Leaves multi-select and returns the ids that were selected.
    pub fn exit_multi_select(&mut self) -> Vec<MessageId> {
        self.delegate.set_multi_select(false);
        let selected = self.renderer.take_selection();
        for id in &selected {
            if let Some(record) = self.store.get(*id) {
                self.renderer.replace(&record);
            }
        }
        selected
    }

    pub fn selected(&self) -> Vec<MessageId> {
        self.renderer.selected()
    }

    /// Replaces the record with a retracted placeholder under the same id.
    pub fn retract(&mut self, id: MessageId) -> ViewResult<()> {
        let updated = self
            .store
            .modify(id, |record| *record = record.retracted())
            .context(HistorySnafu {
                stage: "view-retract",
            })?;
        self.renderer.replace(&updated);
        Ok(())
    }

    /// Rewrites the text of an outbound text record.
    pub fn edit(&mut self, id: MessageId, text: &str) -> ViewResult<()> {
        let Some(current) = self.store.get(id) else {
            return UnchangeableSnafu {
                stage: "view-edit",
                id,
                reason: "message does not exist",
            }
            .fail();
        };
        if current.direction != Direction::Outbound || !matches!(current.kind, MessageKind::Text { .. }) {
            return UnchangeableSnafu {
                stage: "view-edit",
                id,
                reason: "only your own text messages can be edited",
            }
            .fail();
        }

        let updated = self
            .store
            .modify(id, |record| {
                record.kind = MessageKind::text(text);
                record.annotations.edited = true;
                record.annotations.translation = None;
            })
            .context(HistorySnafu { stage: "view-edit" })?;
        self.renderer.replace(&updated);
        Ok(())
    }

    pub fn delete(&mut self, id: MessageId) -> ViewResult<MessageRecord> {
        let index = self.store.position(id);
        let removed = self
            .store
            .remove(id)
            .context(HistorySnafu {
                stage: "view-delete",
            })?;
        if let Some(index) = index {
            self.renderer.remove(id, index);
        }
        Ok(removed)
    }

    /// Starts translating a text record. The returned future does not borrow the view.
    pub fn translate(&self, id: MessageId) -> ViewResult<BoxFuture<'static, CollaboratorResult<String>>> {
        match self.store.get(id).map(|record| record.kind) {
            Some(MessageKind::Text { text }) => Ok(self.translator.translate(text)),
            Some(_) => UnchangeableSnafu {
                stage: "view-translate",
                id,
                reason: "only text messages can be translated",
            }
            .fail(),
            None => UnchangeableSnafu {
                stage: "view-translate",
                id,
                reason: "message does not exist",
            }
            .fail(),
        }
    }

    pub fn apply_translation(&mut self, id: MessageId, translation: Option<String>) -> ViewResult<()> {
        let updated = self
            .store
            .modify(id, |record| record.annotations.translation = translation)
            .context(HistorySnafu {
                stage: "view-apply-translation",
            })?;
        self.renderer.replace(&updated);
        Ok(())
    }

    /// Marks the whole conversation read and refreshes the window.
    pub fn focus(&mut self) -> usize {
        let marked = self.store.mark_all_read();
        if marked > 0 {
            self.render(false);
        }
        marked
    }

    /// Dispatches pointer input. View-local effects are applied here; the effects
    /// that need the host (activation, reply requests, menus) are returned.
    pub fn handle_pointer(&mut self, event: PointerEvent) -> Vec<InteractionEffect> {
        let effects = self.delegate.handle(event);
        let mut forwarded = Vec::with_capacity(effects.len());
        for effect in effects {
            match effect {
                InteractionEffect::ToggleSelection(id) => self.toggle_selection(id),
                InteractionEffect::JumpToQuote(id) => {
                    self.renderer.reveal(&self.store.list(), id);
                }
                InteractionEffect::DismissTranslation(id) => {
                    if let Err(error) = self.apply_translation(id, None) {
                        tracing::warn!(message = %id, "failed to dismiss translation: {error}");
                    }
                }
                InteractionEffect::LoadMore => {
                    self.load_more();
                }
                other => forwarded.push(other),
            }
        }
        forwarded
    }

    fn toggle_selection(&mut self, id: MessageId) {
        let Some(record) = self.store.get(id) else {
            return;
        };
        let selected = !self.renderer.is_selected(id);
        self.renderer.set_selected(&record, selected);
    }
}

impl<S: RenderSurface> DeliveryTarget for ConversationView<S> {
    fn deliver(&mut self, record: &MessageRecord, force_bottom: bool) {
        self.renderer.append(record, force_bottom);
    }

    fn refresh(&mut self, ids: &[MessageId]) {
        for id in ids {
            if let Some(record) = self.store.get(*id) {
                self.renderer.replace(&record);
            }
        }
    }

    fn rerender(&mut self) {
        self.render(false);
    }
}
