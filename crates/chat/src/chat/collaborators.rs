use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use murmur_storage::{Amount, CallKind, ConversationId, Direction};
use parking_lot::Mutex;
use snafu::Snafu;

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CollaboratorError {
    #[snafu(display("{collaborator} rejected the request on `{stage}`: {reason}"))]
    Rejected {
        stage: &'static str,
        collaborator: &'static str,
        reason: String,
    },
    #[snafu(display("{collaborator} is not available on `{stage}`"))]
    Unavailable {
        stage: &'static str,
        collaborator: &'static str,
    },
}

/// Owner of gift and transfer balances. Returns minted card ids.
pub trait PaymentLedger: Send + Sync {
    fn send_gift(&self, conversation: ConversationId, amount: Amount, note: &str) -> CollaboratorResult<String>;
    fn claim_gift(&self, conversation: ConversationId, card_id: &str) -> CollaboratorResult<()>;
    fn return_gift(&self, conversation: ConversationId, card_id: &str) -> CollaboratorResult<()>;
    fn send_transfer(&self, conversation: ConversationId, amount: Amount, note: &str) -> CollaboratorResult<String>;
    fn claim_transfer(&self, conversation: ConversationId, card_id: &str) -> CollaboratorResult<()>;
    fn return_transfer(&self, conversation: ConversationId, card_id: &str) -> CollaboratorResult<()>;
}

pub trait CallSubsystem: Send + Sync {
    fn receive_call_request(&self, kind: CallKind, caller_name: &str, caller_avatar_ref: Option<&str>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInvite {
    /// Outbound invites were sent by the local user.
    pub direction: Direction,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ListenState {
    #[default]
    Idle,
    Invited(PendingInvite),
    Active,
}

/// Shared-music session control, one state per conversation.
pub trait CoListening: Send + Sync {
    fn get_state(&self, conversation: ConversationId) -> ListenState;
    fn set_state(&self, conversation: ConversationId, state: ListenState);
    fn play_by_name(&self, name: &str) -> CollaboratorResult<()>;
    fn play_next(&self) -> CollaboratorResult<()>;
    fn search_and_add_favorite(&self, name: &str) -> CollaboratorResult<()>;
}

pub trait StickerLookup: Send + Sync {
    /// Resolves a sticker name inside the given sets to an asset reference.
    fn resolve(&self, sticker_sets: &[String], name: &str) -> Option<String>;
}

/// Source of inbound model text. Building the request is the implementor's job.
pub trait ModelCall: Send + Sync {
    fn request_reply(&self, conversation: ConversationId) -> BoxFuture<'static, CollaboratorResult<String>>;
}

pub trait Translator: Send + Sync {
    fn translate(&self, text: String) -> BoxFuture<'static, CollaboratorResult<String>>;
}

/// Blocking notices shown to the user, for failures they must act on.
pub trait NoticeSink: Send + Sync {
    fn blocking_notice(&self, message: &str);
}

/// Every external system the chat core talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub ledger: Arc<dyn PaymentLedger>,
    pub calls: Arc<dyn CallSubsystem>,
    pub listening: Arc<dyn CoListening>,
    pub stickers: Arc<dyn StickerLookup>,
    pub model: Arc<dyn ModelCall>,
    pub translator: Arc<dyn Translator>,
    pub notices: Arc<dyn NoticeSink>,
}

impl Collaborators {
    /// Self-contained implementations with no outside services: a local ledger,
    /// in-process listening state, no stickers, no model and no translator.
    pub fn local() -> Self {
        Self {
            ledger: Arc::new(LocalLedger::default()),
            calls: Arc::new(LoggedCalls),
            listening: Arc::new(LocalListening::default()),
            stickers: Arc::new(NoStickers),
            model: Arc::new(NoModel),
            translator: Arc::new(NoTranslator),
            notices: Arc::new(LoggedNotices),
        }
    }

    pub fn with_model(mut self, model: Arc<dyn ModelCall>) -> Self {
        self.model = model;
        self
    }

    pub fn with_stickers(mut self, stickers: Arc<dyn StickerLookup>) -> Self {
        self.stickers = stickers;
        self
    }

    pub fn with_translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = translator;
        self
    }

    pub fn with_notices(mut self, notices: Arc<dyn NoticeSink>) -> Self {
        self.notices = notices;
        self
    }

    pub fn with_listening(mut self, listening: Arc<dyn CoListening>) -> Self {
        self.listening = listening;
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn PaymentLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_calls(mut self, calls: Arc<dyn CallSubsystem>) -> Self {
        self.calls = calls;
        self
    }
}

/// In-process ledger that only tracks which cards are still open.
#[derive(Debug, Default)]
pub struct LocalLedger {
    next_card: AtomicU64,
    open_cards: Mutex<HashSet<String>>,
}

impl LocalLedger {
    fn mint(&self, prefix: &str) -> String {
        let card_id = format!("{prefix}-{}", self.next_card.fetch_add(1, Ordering::AcqRel) + 1);
        self.open_cards.lock().insert(card_id.clone());
        card_id
    }

    fn settle(&self, stage: &'static str, card_id: &str) -> CollaboratorResult<()> {
        if self.open_cards.lock().remove(card_id) {
            return Ok(());
        }
        RejectedSnafu {
            stage,
            collaborator: "local-ledger",
            reason: format!("card '{card_id}' is not open"),
        }
        .fail()
    }
}

impl PaymentLedger for LocalLedger {
    fn send_gift(&self, _conversation: ConversationId, _amount: Amount, _note: &str) -> CollaboratorResult<String> {
        Ok(self.mint("gift"))
    }

    fn claim_gift(&self, _conversation: ConversationId, card_id: &str) -> CollaboratorResult<()> {
        self.settle("local-ledger-claim-gift", card_id)
    }

    fn return_gift(&self, _conversation: ConversationId, card_id: &str) -> CollaboratorResult<()> {
        self.settle("local-ledger-return-gift", card_id)
    }

    fn send_transfer(&self, _conversation: ConversationId, _amount: Amount, _note: &str) -> CollaboratorResult<String> {
        Ok(self.mint("transfer"))
    }

    fn claim_transfer(&self, _conversation: ConversationId, card_id: &str) -> CollaboratorResult<()> {
        self.settle("local-ledger-claim-transfer", card_id)
    }

    fn return_transfer(&self, _conversation: ConversationId, card_id: &str) -> CollaboratorResult<()> {
        self.settle("local-ledger-return-transfer", card_id)
    }
}

#[derive(Debug, Default)]
pub struct LoggedCalls;

impl CallSubsystem for LoggedCalls {
    fn receive_call_request(&self, kind: CallKind, caller_name: &str, _caller_avatar_ref: Option<&str>) {
        tracing::info!(caller = caller_name, "incoming {}", kind.label());
    }
}

#[derive(Debug, Default)]
pub struct LocalListening {
    states: Mutex<HashMap<ConversationId, ListenState>>,
}

impl CoListening for LocalListening {
    fn get_state(&self, conversation: ConversationId) -> ListenState {
        self.states
            .lock()
            .get(&conversation)
            .cloned()
            .unwrap_or_default()
    }

    fn set_state(&self, conversation: ConversationId, state: ListenState) {
        self.states.lock().insert(conversation, state);
    }

    fn play_by_name(&self, name: &str) -> CollaboratorResult<()> {
        tracing::info!(song = name, "co-listening switched song");
        Ok(())
    }

    fn play_next(&self) -> CollaboratorResult<()> {
        tracing::info!("co-listening skipped to next song");
        Ok(())
    }

    fn search_and_add_favorite(&self, name: &str) -> CollaboratorResult<()> {
        tracing::info!(song = name, "co-listening added favorite");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NoStickers;

impl StickerLookup for NoStickers {
    fn resolve(&self, _sticker_sets: &[String], _name: &str) -> Option<String> {
        None
    }
}

#[derive(Debug, Default)]
pub struct NoModel;

impl ModelCall for NoModel {
    fn request_reply(&self, _conversation: ConversationId) -> BoxFuture<'static, CollaboratorResult<String>> {
        async {
            UnavailableSnafu {
                stage: "request-model-reply",
                collaborator: "model",
            }
            .fail()
        }
        .boxed()
    }
}

#[derive(Debug, Default)]
pub struct NoTranslator;

impl Translator for NoTranslator {
    fn translate(&self, _text: String) -> BoxFuture<'static, CollaboratorResult<String>> {
        async {
            UnavailableSnafu {
                stage: "translate-message",
                collaborator: "translator",
            }
            .fail()
        }
        .boxed()
    }
}

#[derive(Debug, Default)]
pub struct LoggedNotices;

impl NoticeSink for LoggedNotices {
    fn blocking_notice(&self, message: &str) {
        tracing::error!("user notice: {message}");
    }
}
