use murmur_directive::{Extraction, Extractor, Fragment, FragmentOrigin, PacingPolicy};
use murmur_storage::{ConversationStore, Direction, MessageId, MessageKind, RoundId};

use super::dispatcher::{ActionDispatcher, PlannedRecord};
use super::sequencer::ScheduledEntry;

/// Everything one model reply turned into, ready for the sequencer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRound {
    pub round_id: RoundId,
    pub entries: Vec<ScheduledEntry>,
    /// Existing records the reply changed in place.
    pub updated: Vec<MessageId>,
    pub thinking: Option<String>,
}

impl PlannedRound {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.updated.is_empty()
    }

    /// Cumulative delivery offsets, one per entry.
    pub fn offsets(&self) -> Vec<u64> {
        self.entries
            .iter()
            .scan(0_u64, |offset, entry| {
                *offset = offset.saturating_add(entry.delay_ms);
                Some(*offset)
            })
            .collect()
    }
}

enum Slot {
    Fragment(Fragment),
    Record(PlannedRecord),
}

impl Slot {
    fn anchor(&self) -> usize {
        match self {
            Self::Fragment(fragment) => fragment.source.start,
            Self::Record(record) => record.anchor,
        }
    }
}

/// Extract, dispatch, then interleave fragments and directive records by their
/// position in the raw reply.
#[derive(Clone)]
pub struct ResponsePipeline {
    extractor: Extractor,
    dispatcher: ActionDispatcher,
}

impl ResponsePipeline {
    pub fn new(extractor: Extractor, dispatcher: ActionDispatcher) -> Self {
        Self {
            extractor,
            dispatcher,
        }
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    pub fn ingest(&self, store: &ConversationStore, raw: &str) -> PlannedRound {
        let extraction = self.extractor.extract(raw);
        let round_id = RoundId::new_v7();
        tracing::debug!(
            conversation = %store.id(),
            round = %round_id,
            fragments = extraction.fragments.len(),
            actions = extraction.actions.len(),
            "extracted model reply"
        );

        let Extraction {
            actions,
            fragments,
            thinking,
            ..
        } = extraction;

        let dispatch = self.dispatcher.dispatch(store, &actions);
        let quoted = store
            .find_last(|record| record.direction == Direction::Outbound)
            .map(|record| record.id);

        let mut slots = fragments
            .into_iter()
            .map(Slot::Fragment)
            .chain(dispatch.planned.into_iter().map(Slot::Record))
            .collect::<Vec<_>>();
        slots.sort_by_key(Slot::anchor);

        let entries = interleave(slots, self.extractor.pacing(), quoted);
        PlannedRound {
            round_id,
            entries,
            updated: dispatch.updated,
            thinking,
        }
    }
}

fn interleave(slots: Vec<Slot>, pacing: &PacingPolicy, quoted: Option<MessageId>) -> Vec<ScheduledEntry> {
    let mut entries = Vec::with_capacity(slots.len());
    let mut after_record = false;

    for slot in slots {
        let first = entries.is_empty();
        let entry = match slot {
            Slot::Fragment(fragment) => {
                let delay_ms = if after_record && !fragment.waited && fragment.delay_ms == 0 {
                    pacing.line_gap_ms
                } else {
                    fragment.delay_ms
                };
                let reply_to = match fragment.origin {
                    FragmentOrigin::Block { reply: true, .. } => quoted,
                    _ => None,
                };
                after_record = false;
                ScheduledEntry {
                    kind: MessageKind::text(fragment.text),
                    direction: Direction::Inbound,
                    delay_ms,
                    reply_to,
                }
            }
            Slot::Record(record) => {
                after_record = true;
                ScheduledEntry {
                    kind: record.kind,
                    direction: record.direction,
                    delay_ms: match record.wait_ms {
                        Some(wait) => wait,
                        None if first => 0,
                        None => pacing.action_gap_ms,
                    },
                    reply_to: None,
                }
            }
        };
        entries.push(entry);
    }
    entries
}
