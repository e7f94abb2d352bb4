use murmur_directive::{Directive, DirectiveAction};
use murmur_storage::{
    CallOutcome, CardStatus, Conversation, ConversationStore, Direction, MessageId, MessageKind,
    MessageRecord, PaymentCard,
};

use super::collaborators::{CollaboratorResult, Collaborators, ListenState, PendingInvite};

/// A record a directive asks to add, placed by the span start of its tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRecord {
    pub kind: MessageKind,
    pub direction: Direction,
    pub anchor: usize,
    /// Explicit pause carried over from the directive.
    pub wait_ms: Option<u64>,
}

/// Outcome of dispatching one reply's directives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dispatch {
    pub planned: Vec<PlannedRecord>,
    /// Existing records that were replaced in place and need a re-render.
    pub updated: Vec<MessageId>,
}

#[derive(Clone, Copy)]
enum CardFamily {
    Gift,
    Transfer,
}

impl CardFamily {
    fn card<'a>(self, kind: &'a MessageKind) -> Option<&'a PaymentCard> {
        match (self, kind) {
            (Self::Gift, MessageKind::Gift(card)) | (Self::Transfer, MessageKind::Transfer(card)) => {
                Some(card)
            }
            _ => None,
        }
    }

    fn card_mut<'a>(self, kind: &'a mut MessageKind) -> Option<&'a mut PaymentCard> {
        match (self, kind) {
            (Self::Gift, MessageKind::Gift(card)) | (Self::Transfer, MessageKind::Transfer(card)) => {
                Some(card)
            }
            _ => None,
        }
    }
}

/// Routes extracted directives to collaborators and plans the records they add.
///
/// Dispatch never fails as a whole: an action that cannot be carried out is
/// logged and skipped, and the remaining actions still run.
#[derive(Clone)]
pub struct ActionDispatcher {
    collaborators: Collaborators,
}

impl ActionDispatcher {
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn dispatch(&self, store: &ConversationStore, actions: &[DirectiveAction]) -> Dispatch {
        let conversation = store.conversation();
        let mut outcome = Dispatch::default();
        for action in actions {
            self.dispatch_one(store, &conversation, action, &mut outcome);
        }
        outcome
    }

    fn dispatch_one(
        &self,
        store: &ConversationStore,
        conversation: &Conversation,
        action: &DirectiveAction,
        outcome: &mut Dispatch,
    ) {
        let anchor = action.span.start;
        let wait_ms = action.wait_ms;
        let mut plan = |kind: MessageKind| {
            outcome.planned.push(PlannedRecord {
                kind,
                direction: Direction::Inbound,
                anchor,
                wait_ms,
            });
        };
        let id = conversation.id;

        match &action.directive {
            Directive::ListenAccept | Directive::ListenReject => {
                let accepted = matches!(action.directive, Directive::ListenAccept);
                match self.collaborators.listening.get_state(id) {
                    ListenState::Invited(PendingInvite {
                        direction: Direction::Outbound,
                        ..
                    }) => {
                        let next = if accepted {
                            ListenState::Active
                        } else {
                            ListenState::Idle
                        };
                        self.collaborators.listening.set_state(id, next);
                    }
                    state => {
                        tracing::debug!(
                            conversation = %id,
                            ?state,
                            "ignoring listen answer without a pending outbound invite"
                        );
                    }
                }
            }
            Directive::ListenInvite { reason } => {
                self.collaborators.listening.set_state(
                    id,
                    ListenState::Invited(PendingInvite {
                        direction: Direction::Inbound,
                        reason: reason.clone(),
                    }),
                );
                let notice = if reason.is_empty() {
                    format!("{} invited you to listen together", conversation.display_name())
                } else {
                    format!(
                        "{} invited you to listen together: {reason}",
                        conversation.display_name()
                    )
                };
                plan(MessageKind::notice(notice));
            }
            Directive::ChangeSong { name } => {
                let result = if name.is_empty() {
                    self.collaborators.listening.play_next()
                } else {
                    self.collaborators.listening.play_by_name(name)
                };
                log_failure("change-song", result);
            }
            Directive::AddFavorite { name } => {
                log_failure(
                    "add-favorite",
                    self.collaborators.listening.search_and_add_favorite(name),
                );
            }
            Directive::CallRequest { kind } => {
                self.collaborators.calls.receive_call_request(
                    *kind,
                    conversation.display_name(),
                    conversation.participant.avatar_ref.as_deref(),
                );
                plan(MessageKind::CallEvent {
                    call: *kind,
                    outcome: CallOutcome::Requested,
                });
            }
            Directive::Sticker { name } => {
                let asset = self
                    .collaborators
                    .stickers
                    .resolve(&conversation.bindings.sticker_sets, name);
                match asset {
                    Some(asset_ref) => plan(MessageKind::Sticker {
                        name: name.clone(),
                        asset_ref,
                    }),
                    None => {
                        tracing::debug!(sticker = %name, "sticker not found in bound sets, sending as text");
                        plan(MessageKind::text(format!("[{name}]")));
                    }
                }
            }
            Directive::VoiceClip {
                transcript,
                duration_secs,
            } => plan(MessageKind::VoiceClip {
                transcript: transcript.clone(),
                duration_secs: *duration_secs,
            }),
            Directive::LocationPin {
                name,
                address,
                radius_m,
            } => plan(MessageKind::LocationPin {
                name: name.clone(),
                address: address.clone(),
                radius_m: *radius_m,
            }),
            Directive::ImageCard { description } => plan(MessageKind::ImageCard {
                description: description.clone(),
            }),
            Directive::GiftSend { amount, note } => {
                match self.collaborators.ledger.send_gift(id, *amount, note) {
                    Ok(card_id) => plan(MessageKind::Gift(PaymentCard {
                        card_id,
                        amount: *amount,
                        note: note.clone(),
                        status: CardStatus::Pending,
                    })),
                    Err(error) => tracing::warn!("dropping gift, ledger refused it: {error}"),
                }
            }
            Directive::TransferSend { amount, note } => {
                match self.collaborators.ledger.send_transfer(id, *amount, note) {
                    Ok(card_id) => plan(MessageKind::Transfer(PaymentCard {
                        card_id,
                        amount: *amount,
                        note: note.clone(),
                        status: CardStatus::Pending,
                    })),
                    Err(error) => tracing::warn!("dropping transfer, ledger refused it: {error}"),
                }
            }
            Directive::GiftClaim { card_id } => {
                let result = self.collaborators.ledger.claim_gift(id, card_id);
                self.settle_card(store, CardFamily::Gift, card_id, CardStatus::Claimed, result, outcome);
            }
            Directive::GiftReturn { card_id } => {
                let result = self.collaborators.ledger.return_gift(id, card_id);
                self.settle_card(store, CardFamily::Gift, card_id, CardStatus::Returned, result, outcome);
            }
            Directive::TransferClaim { card_id } => {
                let result = self.collaborators.ledger.claim_transfer(id, card_id);
                self.settle_card(
                    store,
                    CardFamily::Transfer,
                    card_id,
                    CardStatus::Claimed,
                    result,
                    outcome,
                );
            }
            Directive::TransferReturn { card_id } => {
                let result = self.collaborators.ledger.return_transfer(id, card_id);
                self.settle_card(
                    store,
                    CardFamily::Transfer,
                    card_id,
                    CardStatus::Returned,
                    result,
                    outcome,
                );
            }
            Directive::Retract { target } => {
                self.retract(store, conversation, *target, anchor, wait_ms, outcome);
            }
        }
    }

    fn settle_card(
        &self,
        store: &ConversationStore,
        family: CardFamily,
        card_id: &str,
        status: CardStatus,
        result: CollaboratorResult<()>,
        outcome: &mut Dispatch,
    ) {
        if let Err(error) = result {
            tracing::warn!(card = card_id, "ledger refused card update: {error}");
            return;
        }

        let Some(record) = store.find_last(|record| {
            family
                .card(&record.kind)
                .is_some_and(|card| card.card_id == card_id)
        }) else {
            tracing::warn!(card = card_id, "no card record found for settled card");
            return;
        };

        let updated = store.modify(record.id, |record| {
            if let Some(card) = family.card_mut(&mut record.kind) {
                card.status = status;
            }
        });
        match updated {
            Ok(record) => outcome.updated.push(record.id),
            Err(error) => tracing::warn!(card = card_id, "failed to update card record: {error}"),
        }
    }

    fn retract(
        &self,
        store: &ConversationStore,
        conversation: &Conversation,
        target: MessageId,
        anchor: usize,
        wait_ms: Option<u64>,
        outcome: &mut Dispatch,
    ) {
        let Some(record) = store.get(target) else {
            tracing::warn!(message = %target, "retraction target not found");
            return;
        };
        if record.kind.is_retracted() {
            tracing::debug!(message = %target, "retraction target already retracted");
            return;
        }

        if let Err(error) = store.replace(target, record.retracted()) {
            tracing::warn!(message = %target, "failed to retract message: {error}");
            return;
        }
        outcome.updated.push(target);

        if record.direction == Direction::Outbound {
            outcome.planned.push(PlannedRecord {
                kind: MessageKind::notice(format!(
                    "{} retracted one of your messages",
                    conversation.display_name()
                )),
                direction: Direction::Inbound,
                anchor,
                wait_ms,
            });
        }
    }
}

fn log_failure(action: &'static str, result: CollaboratorResult<()>) {
    if let Err(error) = result {
        tracing::warn!(action, "co-listening request failed: {error}");
    }
}

/// Whether `record` is a card the user may still act on.
pub fn is_open_card(record: &MessageRecord) -> bool {
    match &record.kind {
        MessageKind::Gift(card) | MessageKind::Transfer(card) => card.status == CardStatus::Pending,
        _ => false,
    }
}
