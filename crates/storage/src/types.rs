use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::ids::{ConversationId, MessageId, RoundId};

/// Fallback display name for participants imported without one.
pub const DEFAULT_PARTICIPANT_NAME: &str = "Companion";

/// Who authored a record. Outbound records were written by the local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Self::Outbound => Self::Inbound,
            Self::Inbound => Self::Outbound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallKind {
    Voice,
    Video,
}

impl CallKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Voice => "voice call",
            Self::Video => "video call",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallOutcome {
    Requested,
    Declined,
    Ended { duration_secs: u32 },
}

/// Pseudo-currency amount stored as integer cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    pub const fn cents(self) -> u64 {
        self.0
    }

    /// Parses `50`, `6.6` or `8.88`. More than two fractional digits, signs and
    /// zero amounts are rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().trim_start_matches(['¥', '￥', '$']).trim();
        let (whole, fraction) = match raw.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (raw, ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return None;
        }
        if !whole.chars().all(|c| c.is_ascii_digit())
            || !fraction.chars().all(|c| c.is_ascii_digit())
            || fraction.len() > 2
        {
            return None;
        }

        let whole = if whole.is_empty() {
            0
        } else {
            whole.parse::<u64>().ok()?
        };
        let fraction = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<u64>().ok()? * 10,
            _ => fraction.parse::<u64>().ok()?,
        };
        let cents = whole.checked_mul(100)?.checked_add(fraction)?;
        (cents > 0).then_some(Self(cents))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CardStatus {
    Pending,
    Claimed,
    Returned,
}

/// Stateful gift or transfer card. `card_id` is minted by the payment ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCard {
    pub card_id: String,
    pub amount: Amount,
    pub note: String,
    pub status: CardStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum MessageKind {
    Text {
        text: String,
    },
    Sticker {
        name: String,
        asset_ref: String,
    },
    VoiceClip {
        transcript: String,
        duration_secs: u32,
    },
    LocationPin {
        name: String,
        address: Option<String>,
        radius_m: Option<u32>,
    },
    CallEvent {
        call: CallKind,
        outcome: CallOutcome,
    },
    Gift(PaymentCard),
    Transfer(PaymentCard),
    ImageCard {
        description: String,
    },
    /// The original payload is kept for the record owner but never rendered.
    Retracted {
        original: Box<MessageKind>,
    },
    SystemNotice {
        text: String,
    },
}

impl MessageKind {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn notice(text: impl Into<String>) -> Self {
        Self::SystemNotice { text: text.into() }
    }

    pub fn is_retracted(&self) -> bool {
        matches!(self, Self::Retracted { .. })
    }

    /// One-line preview used by conversation lists.
    pub fn summary(&self) -> String {
        match self {
            Self::Text { text } => text.lines().next().unwrap_or_default().to_string(),
            Self::Sticker { name, .. } => format!("[Sticker] {name}"),
            Self::VoiceClip { duration_secs, .. } => format!("[Voice] {duration_secs}\""),
            Self::LocationPin { name, .. } => format!("[Location] {name}"),
            Self::CallEvent { call, .. } => format!("[{}]", call.label()),
            Self::Gift(card) => format!("[Gift] {}", card.note),
            Self::Transfer(card) => format!("[Transfer] {}", card.amount),
            Self::ImageCard { .. } => "[Image]".to_string(),
            Self::Retracted { .. } => "A message was retracted".to_string(),
            Self::SystemNotice { text } => text.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotations {
    #[serde(default)]
    pub translation: Option<String>,
    #[serde(default)]
    pub edited: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    #[serde(flatten)]
    pub kind: MessageKind,
    pub direction: Direction,
    pub created_at_unix_ms: u64,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub round_id: Option<RoundId>,
    #[serde(default)]
    pub annotations: Annotations,
}

impl MessageRecord {
    pub fn new(kind: MessageKind, direction: Direction) -> Self {
        Self {
            id: MessageId::new_v7(),
            kind,
            direction,
            created_at_unix_ms: unix_timestamp_millis(),
            read: false,
            reply_to: None,
            round_id: None,
            annotations: Annotations::default(),
        }
    }

    pub fn with_reply_to(mut self, reply_to: Option<MessageId>) -> Self {
        self.reply_to = reply_to;
        self
    }

    pub fn with_round(mut self, round_id: RoundId) -> Self {
        self.round_id = Some(round_id);
        self
    }

    pub fn with_created_at(mut self, created_at_unix_ms: u64) -> Self {
        self.created_at_unix_ms = created_at_unix_ms;
        self
    }

    /// Returns a copy whose kind is wrapped in `Retracted`, keeping id, position
    /// metadata and annotations intact. Already retracted records are returned as is.
    pub fn retracted(&self) -> Self {
        let mut next = self.clone();
        if !next.kind.is_retracted() {
            let original = std::mem::replace(&mut next.kind, MessageKind::notice(String::new()));
            next.kind = MessageKind::Retracted {
                original: Box::new(original),
            };
            next.annotations.translation = None;
        }
        next
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub name: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessageSummary {
    pub text: String,
    pub at_unix_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBindings {
    #[serde(default)]
    pub sticker_sets: Vec<String>,
    #[serde(default)]
    pub lore_ids: Vec<String>,
    #[serde(default)]
    pub persona_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualPrefs {
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default)]
    pub bubble_style: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participant: Participant,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub last_message: Option<LastMessageSummary>,
    #[serde(default)]
    pub bindings: ResourceBindings,
    #[serde(default)]
    pub prefs: VisualPrefs,
}

impl Conversation {
    pub fn display_name(&self) -> &str {
        self.alias
            .as_deref()
            .filter(|alias| !alias.trim().is_empty())
            .unwrap_or(&self.participant.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    pub participant: Participant,
    pub alias: Option<String>,
    pub bindings: ResourceBindings,
    pub prefs: VisualPrefs,
}

impl NewConversation {
    pub fn with_participant(name: impl Into<String>) -> Self {
        let name = name.into();
        let name = if name.trim().is_empty() {
            DEFAULT_PARTICIPANT_NAME.to_string()
        } else {
            name.trim().to_string()
        };

        Self {
            participant: Participant {
                name,
                avatar_ref: None,
            },
            alias: None,
            bindings: ResourceBindings::default(),
            prefs: VisualPrefs::default(),
        }
    }

    pub fn with_sticker_sets(mut self, sticker_sets: Vec<String>) -> Self {
        self.bindings.sticker_sets = sticker_sets;
        self
    }
}

pub fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_u64, |duration| duration.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_parsing_accepts_common_forms() {
        assert_eq!(Amount::parse("50"), Some(Amount::from_cents(5_000)));
        assert_eq!(Amount::parse("6.6"), Some(Amount::from_cents(660)));
        assert_eq!(Amount::parse(" 8.88 "), Some(Amount::from_cents(888)));
        assert_eq!(Amount::parse("¥520"), Some(Amount::from_cents(52_000)));
        assert_eq!(Amount::from_cents(666).to_string(), "6.66");
    }

    #[test]
    fn amount_parsing_rejects_garbage() {
        for raw in ["", "abc", "1.234", "-5", "0", "0.00", ".", "5,00"] {
            assert_eq!(Amount::parse(raw), None, "input {raw:?}");
        }
    }

    #[test]
    fn retraction_keeps_identity_and_original_payload() {
        let record = MessageRecord::new(MessageKind::text("oops"), Direction::Inbound);
        let retracted = record.retracted();

        assert_eq!(retracted.id, record.id);
        assert_eq!(retracted.created_at_unix_ms, record.created_at_unix_ms);
        assert_eq!(
            retracted.kind,
            MessageKind::Retracted {
                original: Box::new(MessageKind::text("oops"))
            }
        );
        assert_eq!(retracted.retracted(), retracted);
    }

    #[test]
    fn record_serializes_with_flattened_kind_tag() {
        let record = MessageRecord::new(
            MessageKind::VoiceClip {
                transcript: "hm".to_string(),
                duration_secs: 3,
            },
            Direction::Inbound,
        );
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["kind"], "voice-clip");
        assert_eq!(json["duration_secs"], 3);

        let back: MessageRecord = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, record);
    }
}
