use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::cleanup::cleanup;
use super::split::{Boundary, split_pieces};
use super::vocabulary::{Directive, DirectiveAction, TagMatch, next_tag};

static THINKING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\[THINK\](.*?)\[/THINK\]|<thinking>(.*?)</thinking>|<think>(.*?)</think>")
        .expect("thinking block regex")
});

static STRUCTURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[(MSG|REPLY)(\d+)\]|\[WAIT(?::[ \t]*([0-9.]*)[ \t]*)?\]")
        .expect("structure marker regex")
});

static BLOCK_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(?:MSG|REPLY)\d+\]").expect("block open regex"));

/// How the extractor treats malformed or under-specified input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorPolicy {
    /// An opened numbered block without its close tag keeps its content up to
    /// the next open marker or the end of the reply. When off, it is dropped.
    pub recover_unclosed_blocks: bool,
    /// Radius given to location pins that name none.
    pub default_location_radius_m: Option<u32>,
}

impl Default for ExtractorPolicy {
    fn default() -> Self {
        Self {
            recover_unclosed_blocks: true,
            default_location_radius_m: None,
        }
    }
}

/// Delays between consecutive deliveries of one reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingPolicy {
    pub paragraph_gap_ms: u64,
    pub line_gap_ms: u64,
    pub wait_default_ms: u64,
    /// Gap before records produced by directives, such as stickers or cards.
    pub action_gap_ms: u64,
    /// Upper bound for one explicit `[WAIT:s]` pause.
    pub max_wait_ms: u64,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            paragraph_gap_ms: 800,
            line_gap_ms: 600,
            wait_default_ms: 500,
            action_gap_ms: 700,
            max_wait_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentOrigin {
    /// `reply` marks `[REPLYn]` blocks, which quote the latest outbound message.
    Block { number: u32, closed: bool, reply: bool },
    Prose(Boundary),
}

/// One future message record. `delay_ms` is relative to the previous fragment.
/// `waited` is set when an explicit wait marker chose the delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub text: String,
    pub delay_ms: u64,
    pub waited: bool,
    pub source: Range<usize>,
    pub origin: FragmentOrigin,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub visible_text: String,
    pub actions: Vec<DirectiveAction>,
    /// Empty when the reply holds nothing to show.
    pub fragments: Vec<Fragment>,
    pub thinking: Option<String>,
}

impl Extraction {
    /// Cumulative delivery offsets, one per fragment.
    pub fn schedule(&self) -> Vec<u64> {
        self.fragments
            .iter()
            .scan(0_u64, |offset, fragment| {
                *offset = offset.saturating_add(fragment.delay_ms);
                Some(*offset)
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty() && self.actions.is_empty()
    }
}

enum Unit {
    Prose(Range<usize>),
    Block {
        number: u32,
        reply: bool,
        marker: Range<usize>,
        content: Range<usize>,
        closed: bool,
    },
    Wait { at: usize, delay_ms: u64 },
}

/// Turns one raw model reply into visible fragments and side-effect directives.
#[derive(Debug, Clone, Default)]
pub struct Extractor {
    policy: ExtractorPolicy,
    pacing: PacingPolicy,
}

impl Extractor {
    pub fn new(policy: ExtractorPolicy, pacing: PacingPolicy) -> Self {
        Self { policy, pacing }
    }

    pub fn policy(&self) -> &ExtractorPolicy {
        &self.policy
    }

    pub fn pacing(&self) -> &PacingPolicy {
        &self.pacing
    }

    pub fn extract(&self, raw: &str) -> Extraction {
        let (hidden, thinking) = hidden_blocks(raw);
        let units = self.units(raw, &hidden);

        let mut pass = Pass {
            raw,
            hidden: &hidden,
            extractor: self,
            actions: Vec::new(),
            fragments: Vec::new(),
            waits: Vec::new(),
        };

        for unit in units {
            match unit {
                Unit::Wait { at, delay_ms } => pass.waits.push((at, delay_ms)),
                Unit::Prose(range) => pass.prose(range),
                Unit::Block {
                    number,
                    reply,
                    marker,
                    content,
                    closed,
                } => pass.block(FragmentOrigin::Block { number, closed, reply }, marker, content),
            }
        }

        let Pass {
            mut actions,
            mut fragments,
            waits,
            ..
        } = pass;
        anchor_waits(&waits, &mut fragments, &mut actions);
        let visible_text = fragments
            .iter()
            .map(|fragment| fragment.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        Extraction {
            visible_text,
            actions,
            fragments,
            thinking,
        }
    }

    /// Walks the structural markers outside hidden blocks in document order.
    fn units(&self, raw: &str, hidden: &[Range<usize>]) -> Vec<Unit> {
        let mut units = Vec::new();
        let mut prose_start = 0;
        let mut cursor = 0;

        while let Some(caps) = STRUCTURE.captures_at(raw, cursor) {
            let Some(marker) = caps.get(0).map(|m| m.range()) else {
                break;
            };
            if within(hidden, marker.start) {
                cursor = marker.end;
                continue;
            }

            units.push(Unit::Prose(prose_start..marker.start));

            let (Some(tag), Some(number)) = (caps.get(1), caps.get(2)) else {
                let seconds = caps.get(3).map_or("", |m| m.as_str());
                units.push(Unit::Wait {
                    at: marker.end,
                    delay_ms: self.wait_ms(seconds),
                });
                prose_start = marker.end;
                cursor = marker.end;
                continue;
            };

            let number_value = number.as_str().parse::<u32>().unwrap_or(0);
            let reply = tag.as_str() == "REPLY";
            let close = format!("[/{}{}]", tag.as_str(), number.as_str());
            match raw[marker.end..].find(&close) {
                Some(offset) => {
                    let close_start = marker.end + offset;
                    units.push(Unit::Block {
                        number: number_value,
                        reply,
                        marker: marker.clone(),
                        content: marker.end..close_start,
                        closed: true,
                    });
                    cursor = close_start + close.len();
                }
                None => {
                    let end = next_open(raw, marker.end, hidden).unwrap_or(raw.len());
                    if self.policy.recover_unclosed_blocks {
                        tracing::debug!(
                            block = number_value,
                            "recovering numbered block without close tag"
                        );
                        units.push(Unit::Block {
                            number: number_value,
                            reply,
                            marker: marker.clone(),
                            content: marker.end..end,
                            closed: false,
                        });
                    } else {
                        tracing::debug!(
                            block = number_value,
                            "dropping numbered block without close tag"
                        );
                    }
                    cursor = end;
                }
            }
            prose_start = cursor;
        }

        units.push(Unit::Prose(prose_start..raw.len()));
        units
    }

    fn wait_ms(&self, seconds: &str) -> u64 {
        let max_ms = self.pacing.max_wait_ms;
        match seconds.parse::<f64>() {
            Ok(seconds) if seconds.is_finite() && seconds >= 0.0 => {
                let requested = (seconds * 1000.0).round();
                if requested >= max_ms as f64 {
                    tracing::debug!(requested, max_ms, "clamping wait marker");
                    max_ms
                } else {
                    requested as u64
                }
            }
            _ => self.pacing.wait_default_ms.min(max_ms),
        }
    }

    fn finish_directive(&self, directive: Directive) -> Directive {
        match directive {
            Directive::LocationPin {
                name,
                address,
                radius_m: None,
            } => Directive::LocationPin {
                name,
                address,
                radius_m: self.policy.default_location_radius_m,
            },
            other => other,
        }
    }
}

struct Pass<'a> {
    raw: &'a str,
    hidden: &'a [Range<usize>],
    extractor: &'a Extractor,
    actions: Vec<DirectiveAction>,
    fragments: Vec<Fragment>,
    /// `(position after the marker, delay)` per wait marker, in document order.
    waits: Vec<(usize, u64)>,
}

impl Pass<'_> {
    fn prose(&mut self, range: Range<usize>) {
        if range.is_empty() {
            return;
        }

        let tags = self.scan_tags(range.clone());
        let hidden = self.hidden;
        let masked = |index: usize| {
            within(hidden, index) || tags.iter().any(|tag| tag.range.contains(&index))
        };

        let mut pending = Boundary::Start;
        for piece in split_pieces(self.raw, range, masked) {
            pending = pending.max(piece.boundary);
            let piece_tags = tags
                .iter()
                .filter(|tag| piece.range.contains(&tag.range.start))
                .collect::<Vec<_>>();
            self.record_actions(&piece_tags);

            let text = cleanup(&self.visible(piece.range.clone(), &piece_tags));
            if text.is_empty() {
                continue;
            }
            let boundary = pending;
            pending = Boundary::Start;
            self.push_fragment(text, piece.range, FragmentOrigin::Prose(boundary), boundary);
        }
    }

    fn block(&mut self, origin: FragmentOrigin, marker: Range<usize>, content: Range<usize>) {
        let tags = self.scan_tags(content.clone());
        let tag_refs = tags.iter().collect::<Vec<_>>();
        self.record_actions(&tag_refs);

        let text = cleanup(&self.visible(content.clone(), &tag_refs));
        if text.is_empty() {
            return;
        }
        self.push_fragment(text, marker.start..content.end, origin, Boundary::Line);
    }

    fn push_fragment(&mut self, text: String, source: Range<usize>, origin: FragmentOrigin, boundary: Boundary) {
        let pacing = &self.extractor.pacing;
        let delay_ms = match boundary {
            _ if self.fragments.is_empty() => 0,
            Boundary::Paragraph => pacing.paragraph_gap_ms,
            Boundary::Line | Boundary::Start => pacing.line_gap_ms,
        };
        self.fragments.push(Fragment {
            text,
            delay_ms,
            waited: false,
            source,
            origin,
        });
    }

    fn record_actions(&mut self, tags: &[&TagMatch]) {
        for tag in tags {
            match &tag.directive {
                Some(directive) => self.actions.push(DirectiveAction {
                    directive: self.extractor.finish_directive(directive.clone()),
                    span: tag.range.clone(),
                    wait_ms: None,
                }),
                None => {
                    tracing::warn!(
                        tag = tag.rule,
                        span = ?tag.range,
                        "dropping directive with unusable parameters"
                    );
                }
            }
        }
    }

    /// Tags inside `range`, skipping hidden blocks, with spans into the raw reply.
    fn scan_tags(&self, range: Range<usize>) -> Vec<TagMatch> {
        let mut found = Vec::new();
        for live in subtract(range, self.hidden) {
            let slice = &self.raw[live.clone()];
            let mut cursor = 0;
            while let Some(mut tag) = next_tag(slice, cursor) {
                cursor = tag.range.end.max(cursor + 1);
                tag.range = live.start + tag.range.start..live.start + tag.range.end;
                found.push(tag);
                if cursor >= slice.len() {
                    break;
                }
            }
        }
        found
    }

    /// `raw[range]` without hidden blocks and without the given tags.
    fn visible(&self, range: Range<usize>, tags: &[&TagMatch]) -> String {
        let mut cuts = self
            .hidden
            .iter()
            .cloned()
            .chain(tags.iter().map(|tag| tag.range.clone()))
            .collect::<Vec<_>>();
        cuts.sort_by_key(|cut| cut.start);

        let mut output = String::new();
        let mut cursor = range.start;
        for cut in cuts {
            if cut.end <= cursor || cut.start >= range.end {
                continue;
            }
            if cut.start > cursor {
                output.push_str(&self.raw[cursor..cut.start]);
            }
            cursor = cut.end.min(range.end);
        }
        if cursor < range.end {
            output.push_str(&self.raw[cursor..range.end]);
        }
        output
    }
}

/// Gives each wait to whatever comes next in the raw reply, fragment or
/// directive. A fragment wins a tie, matching the delivery order. Waits with
/// nothing after them are dropped; of two waits before one item the later wins.
fn anchor_waits(waits: &[(usize, u64)], fragments: &mut [Fragment], actions: &mut [DirectiveAction]) {
    for &(at, delay_ms) in waits {
        let fragment = fragments
            .iter()
            .position(|fragment| fragment.source.start >= at);
        let action = actions
            .iter()
            .enumerate()
            .filter(|(_, action)| action.span.start >= at)
            .min_by_key(|(_, action)| action.span.start)
            .map(|(index, _)| index);

        match (fragment, action) {
            (Some(f), Some(a)) if actions[a].span.start < fragments[f].source.start => {
                actions[a].wait_ms = Some(delay_ms);
            }
            (Some(f), _) => {
                fragments[f].delay_ms = delay_ms;
                fragments[f].waited = true;
            }
            (None, Some(a)) => actions[a].wait_ms = Some(delay_ms),
            (None, None) => tracing::debug!(at, "wait marker with nothing after it"),
        }
    }
}

fn hidden_blocks(raw: &str) -> (Vec<Range<usize>>, Option<String>) {
    let mut ranges = Vec::new();
    let mut thoughts = Vec::new();
    for caps in THINKING.captures_iter(raw) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        ranges.push(whole.range());
        let inner = (1..=3)
            .find_map(|group| caps.get(group))
            .map_or("", |m| m.as_str().trim());
        if !inner.is_empty() {
            thoughts.push(inner.to_string());
        }
    }
    let thinking = (!thoughts.is_empty()).then(|| thoughts.join("\n\n"));
    (ranges, thinking)
}

fn next_open(raw: &str, from: usize, hidden: &[Range<usize>]) -> Option<usize> {
    let mut cursor = from;
    while let Some(found) = BLOCK_OPEN.find_at(raw, cursor) {
        if !within(hidden, found.start()) {
            return Some(found.start());
        }
        cursor = found.end();
    }
    None
}

fn within(ranges: &[Range<usize>], index: usize) -> bool {
    ranges.iter().any(|range| range.contains(&index))
}

/// `range` minus `holes`, as ordered disjoint ranges.
fn subtract(range: Range<usize>, holes: &[Range<usize>]) -> Vec<Range<usize>> {
    let mut holes = holes
        .iter()
        .filter(|hole| hole.start < range.end && hole.end > range.start)
        .cloned()
        .collect::<Vec<_>>();
    holes.sort_by_key(|hole| hole.start);

    let mut live = Vec::new();
    let mut cursor = range.start;
    for hole in holes {
        if hole.start > cursor {
            live.push(cursor..hole.start);
        }
        cursor = cursor.max(hole.end);
    }
    if cursor < range.end {
        live.push(cursor..range.end);
    }
    live
}
