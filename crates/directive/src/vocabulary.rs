use std::ops::Range;
use std::sync::LazyLock;

use murmur_storage::{Amount, CallKind, MessageId};
use regex::{Captures, Regex};

/// Closed set of side-effect directives a model reply can carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    ListenAccept,
    ListenReject,
    ListenInvite { reason: String },
    ChangeSong { name: String },
    AddFavorite { name: String },
    CallRequest { kind: CallKind },
    Sticker { name: String },
    VoiceClip { transcript: String, duration_secs: u32 },
    LocationPin { name: String, address: Option<String>, radius_m: Option<u32> },
    GiftSend { amount: Amount, note: String },
    GiftClaim { card_id: String },
    GiftReturn { card_id: String },
    TransferSend { amount: Amount, note: String },
    TransferClaim { card_id: String },
    TransferReturn { card_id: String },
    ImageCard { description: String },
    Retract { target: MessageId },
}

impl Directive {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ListenAccept => "listen-accept",
            Self::ListenReject => "listen-reject",
            Self::ListenInvite { .. } => "listen-invite",
            Self::ChangeSong { .. } => "change-song",
            Self::AddFavorite { .. } => "add-favorite",
            Self::CallRequest { .. } => "call-request",
            Self::Sticker { .. } => "sticker",
            Self::VoiceClip { .. } => "voice-clip",
            Self::LocationPin { .. } => "location-pin",
            Self::GiftSend { .. } => "gift-send",
            Self::GiftClaim { .. } => "gift-claim",
            Self::GiftReturn { .. } => "gift-return",
            Self::TransferSend { .. } => "transfer-send",
            Self::TransferClaim { .. } => "transfer-claim",
            Self::TransferReturn { .. } => "transfer-return",
            Self::ImageCard { .. } => "image-card",
            Self::Retract { .. } => "retract",
        }
    }
}

/// A directive together with the byte span of its tag in the raw reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectiveAction {
    pub directive: Directive,
    pub span: Range<usize>,
    /// Pause requested by a wait marker right before the tag.
    pub wait_ms: Option<u64>,
}

pub(crate) struct TagRule {
    pub name: &'static str,
    pub regex: Regex,
    /// `None` means the tag matched but its parameters were unusable.
    pub build: fn(&Captures<'_>) -> Option<Directive>,
}

/// One tag found in a text slice. The tag is removed from visible text even when
/// `directive` is `None`.
pub(crate) struct TagMatch {
    pub rule: &'static str,
    pub range: Range<usize>,
    pub directive: Option<Directive>,
}

fn rule(name: &'static str, pattern: &str, build: fn(&Captures<'_>) -> Option<Directive>) -> TagRule {
    TagRule {
        name,
        regex: Regex::new(pattern).expect("directive tag regex"),
        build,
    }
}

pub(crate) static TAG_TABLE: LazyLock<Vec<TagRule>> = LazyLock::new(|| {
    vec![
        rule("listen-accept", r"\[ACCEPT_LISTEN_INVITATION\]", |_| {
            Some(Directive::ListenAccept)
        }),
        rule("listen-reject", r"\[REJECT_LISTEN_INVITATION\]", |_| {
            Some(Directive::ListenReject)
        }),
        rule("listen-invite", r"\[INVITE_LISTEN\]([^\[\n]*)", |caps| {
            Some(Directive::ListenInvite {
                reason: group(caps, 1).to_string(),
            })
        }),
        rule("change-song", r"\[CHANGE_SONG\]([^\[\n,，。.]*)", |caps| {
            Some(Directive::ChangeSong {
                name: group(caps, 1).to_string(),
            })
        }),
        rule("add-favorite", r"\[ADD_FAVORITE_SONG\]([^\[\n,，。.]*)", |caps| {
            let name = group(caps, 1);
            (!name.is_empty()).then(|| Directive::AddFavorite {
                name: name.to_string(),
            })
        }),
        rule("voice-call", r"\[VOICE_CALL\]", |_| {
            Some(Directive::CallRequest {
                kind: CallKind::Voice,
            })
        }),
        rule("video-call", r"\[VIDEO_CALL\]", |_| {
            Some(Directive::CallRequest {
                kind: CallKind::Video,
            })
        }),
        rule("sticker", r"(?s)【表情包】(.*?)【/表情包】", |caps| {
            let name = group(caps, 1);
            (!name.is_empty()).then(|| Directive::Sticker {
                name: name.to_string(),
            })
        }),
        rule("voice-clip", r"(?s)【语音条】(.*?)【/语音条】", |caps| {
            let mut parts = split_params(group(caps, 1));
            let transcript = parts.next().unwrap_or_default();
            if transcript.is_empty() {
                return None;
            }
            let duration_secs = parts
                .next()
                .and_then(leading_number)
                .map_or(1, |secs| secs.max(1));
            Some(Directive::VoiceClip {
                transcript: transcript.to_string(),
                duration_secs,
            })
        }),
        rule("location-pin", r"(?s)【地理位置】(.*?)【/地理位置】", |caps| {
            let mut parts = split_params(group(caps, 1));
            let name = parts.next().unwrap_or_default();
            if name.is_empty() {
                return None;
            }
            let address = parts
                .next()
                .filter(|address| !address.is_empty())
                .map(str::to_string);
            let radius_m = parts.next().and_then(leading_number);
            Some(Directive::LocationPin {
                name: name.to_string(),
                address,
                radius_m,
            })
        }),
        rule("gift-send", r"(?s)【红包】(.*?)【/红包】", |caps| {
            let (amount, note) = amount_and_note(group(caps, 1))?;
            Some(Directive::GiftSend { amount, note })
        }),
        rule("gift-claim", r"(?s)【领取红包】(.*?)【/领取红包】", |caps| {
            card_id(caps).map(|card_id| Directive::GiftClaim { card_id })
        }),
        rule("gift-return", r"(?s)【退还红包】(.*?)【/退还红包】", |caps| {
            card_id(caps).map(|card_id| Directive::GiftReturn { card_id })
        }),
        rule("transfer-send", r"(?s)【转账】(.*?)【/转账】", |caps| {
            let (amount, note) = amount_and_note(group(caps, 1))?;
            Some(Directive::TransferSend { amount, note })
        }),
        rule("transfer-claim", r"(?s)【确认收款】(.*?)【/确认收款】", |caps| {
            card_id(caps).map(|card_id| Directive::TransferClaim { card_id })
        }),
        rule("transfer-return", r"(?s)【退还转账】(.*?)【/退还转账】", |caps| {
            card_id(caps).map(|card_id| Directive::TransferReturn { card_id })
        }),
        rule("image-card", r"(?s)【图片描述】(.*?)【/图片描述】", |caps| {
            let description = group(caps, 1);
            (!description.is_empty()).then(|| Directive::ImageCard {
                description: description.to_string(),
            })
        }),
        rule("retract", r"(?s)【撤回】(.*?)【/撤回】", |caps| {
            let target = group(caps, 1).parse::<MessageId>().ok()?;
            Some(Directive::Retract { target })
        }),
    ]
});

/// Finds the next tag in `text` at or after `from`. The earliest match wins; ties
/// go to the rule listed first.
pub(crate) fn next_tag(text: &str, from: usize) -> Option<TagMatch> {
    let mut best: Option<(usize, Captures<'_>)> = None;
    for (index, rule) in TAG_TABLE.iter().enumerate() {
        let Some(caps) = rule.regex.captures_at(text, from) else {
            continue;
        };
        let start = caps.get(0).map_or(usize::MAX, |m| m.start());
        let better = match &best {
            Some((_, current)) => start < current.get(0).map_or(usize::MAX, |m| m.start()),
            None => true,
        };
        if better {
            best = Some((index, caps));
        }
    }

    let (index, caps) = best?;
    let whole = caps.get(0)?;
    let rule = &TAG_TABLE[index];
    Some(TagMatch {
        rule: rule.name,
        range: whole.range(),
        directive: (rule.build)(&caps),
    })
}

fn group<'t>(caps: &Captures<'t>, index: usize) -> &'t str {
    caps.get(index).map_or("", |m| m.as_str().trim())
}

fn split_params(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(['|', '｜']).map(str::trim)
}

fn card_id(caps: &Captures<'_>) -> Option<String> {
    let id = group(caps, 1);
    (!id.is_empty() && !id.contains(char::is_whitespace)).then(|| id.to_string())
}

fn amount_and_note(raw: &str) -> Option<(Amount, String)> {
    let mut parts = split_params(raw);
    let amount = Amount::parse(parts.next()?)?;
    let note = parts.collect::<Vec<_>>().join("|");
    Some((amount, note))
}

/// Reads the leading digits of `raw`, so `12秒` and `500m` both parse.
fn leading_number(raw: &str) -> Option<u32> {
    let digits = raw
        .trim()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directive_of(text: &str) -> Option<Directive> {
        next_tag(text, 0).and_then(|found| found.directive)
    }

    #[test]
    fn earliest_tag_wins_regardless_of_table_order() {
        let text = "a【表情包】wave【/表情包】b[ACCEPT_LISTEN_INVITATION]";
        let found = next_tag(text, 0).expect("tag");
        assert_eq!(found.rule, "sticker");
        assert_eq!(&text[found.range.clone()], "【表情包】wave【/表情包】");

        let second = next_tag(text, found.range.end).expect("second tag");
        assert_eq!(second.directive, Some(Directive::ListenAccept));
    }

    #[test]
    fn song_names_stop_at_punctuation() {
        let text = "[CHANGE_SONG]稻香，这首歌很舒服";
        let found = next_tag(text, 0).expect("tag");
        assert_eq!(
            found.directive,
            Some(Directive::ChangeSong {
                name: "稻香".to_string()
            })
        );
        assert_eq!(&text[found.range.end..], "，这首歌很舒服");
    }

    #[test]
    fn invite_reason_is_consumed_to_the_end_of_line() {
        let text = "hey [INVITE_LISTEN]let's listen together\nsecond line";
        let found = next_tag(text, 0).expect("tag");
        assert_eq!(&text[found.range.end..], "\nsecond line");
        assert_eq!(
            found.directive,
            Some(Directive::ListenInvite {
                reason: "let's listen together".to_string()
            })
        );
    }

    #[test]
    fn payment_blocks_parse_amount_and_note() {
        assert_eq!(
            directive_of("【红包】50|happy new year【/红包】"),
            Some(Directive::GiftSend {
                amount: Amount::from_cents(5_000),
                note: "happy new year".to_string(),
            })
        );
        assert_eq!(
            directive_of("【转账】13.14｜【/转账】"),
            Some(Directive::TransferSend {
                amount: Amount::from_cents(1_314),
                note: String::new(),
            })
        );
        assert_eq!(
            directive_of("【领取红包】card-7【/领取红包】"),
            Some(Directive::GiftClaim {
                card_id: "card-7".to_string()
            })
        );
    }

    #[test]
    fn garbled_parameters_match_but_build_nothing() {
        for text in [
            "【红包】lots|yay【/红包】",
            "【确认收款】  【/确认收款】",
            "【撤回】not-an-id【/撤回】",
            "【表情包】【/表情包】",
        ] {
            let found = next_tag(text, 0).expect("tag still matches");
            assert_eq!(found.range, 0..text.len(), "input {text:?}");
            assert_eq!(found.directive, None, "input {text:?}");
        }
    }

    #[test]
    fn voice_and_location_parameters_are_optional() {
        assert_eq!(
            directive_of("【语音条】想你了|12秒【/语音条】"),
            Some(Directive::VoiceClip {
                transcript: "想你了".to_string(),
                duration_secs: 12,
            })
        );
        assert_eq!(
            directive_of("【语音条】hm【/语音条】"),
            Some(Directive::VoiceClip {
                transcript: "hm".to_string(),
                duration_secs: 1,
            })
        );
        assert_eq!(
            directive_of("【地理位置】Cafe|2 Rue X|300米【/地理位置】"),
            Some(Directive::LocationPin {
                name: "Cafe".to_string(),
                address: Some("2 Rue X".to_string()),
                radius_m: Some(300),
            })
        );
        assert_eq!(
            directive_of("【地理位置】Park【/地理位置】"),
            Some(Directive::LocationPin {
                name: "Park".to_string(),
                address: None,
                radius_m: None,
            })
        );
    }

    #[test]
    fn retraction_targets_parse_as_message_ids() {
        let target = MessageId::new_v7();
        let text = format!("【撤回】{target}【/撤回】");
        assert_eq!(directive_of(&text), Some(Directive::Retract { target }));
    }
}
