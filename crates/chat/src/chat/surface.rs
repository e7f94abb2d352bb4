use std::fmt;

use murmur_storage::{
    CallOutcome, CardStatus, Direction, MessageId, MessageKind, MessageRecord, PaymentCard,
};
use snafu::Snafu;

const DEFAULT_CONTENT_WIDTH: f32 = 680.;
const DEFAULT_VIEWPORT_HEIGHT: f32 = 600.;
const OUTBOUND_BUBBLE_MAX_WIDTH: f32 = 540.;
const BUBBLE_PADDING_X: f32 = 14.;
const BUBBLE_PADDING_Y: f32 = 10.;
const INBOUND_LABEL_HEIGHT: f32 = 16.;
const INBOUND_LABEL_GAP: f32 = 8.;
const TRANSLATION_GAP: f32 = 6.;
const ROW_GAP: f32 = 12.;
const LOAD_MORE_HEIGHT: f32 = 32.;
const ESTIMATED_TEXT_LINE_HEIGHT: f32 = 18.;
const ESTIMATED_CHAR_WIDTH: f32 = 7.0;

pub const RETRACTED_PLACEHOLDER: &str = "This message was retracted";

pub type SurfaceResult<T> = Result<T, SurfaceError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SurfaceError {
    #[snafu(display("render container is detached on `{stage}`"))]
    Detached { stage: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKey {
    LoadMore,
    Message(MessageId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BubbleStyle {
    Bubble,
    Notice,
    Placeholder,
}

/// Display-ready projection of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BubbleView {
    pub id: MessageId,
    pub direction: Direction,
    pub style: BubbleStyle,
    pub text: String,
    /// Sender label, shown above inbound bubbles.
    pub label: Option<String>,
    pub read: bool,
    pub reply_to: Option<MessageId>,
    pub translation: Option<String>,
    pub selected: bool,
    pub edited: bool,
}

impl BubbleView {
    pub fn from_record(record: &MessageRecord, participant: &str, selected: bool) -> Self {
        let (style, text) = match &record.kind {
            MessageKind::Retracted { .. } => {
                (BubbleStyle::Placeholder, RETRACTED_PLACEHOLDER.to_string())
            }
            MessageKind::SystemNotice { text } => (BubbleStyle::Notice, text.clone()),
            kind => (BubbleStyle::Bubble, display_text(kind)),
        };
        let label = (style == BubbleStyle::Bubble && record.direction == Direction::Inbound)
            .then(|| participant.to_string());

        Self {
            id: record.id,
            direction: record.direction,
            style,
            text,
            label,
            read: record.read,
            reply_to: record.reply_to,
            translation: record.annotations.translation.clone(),
            selected,
            edited: record.annotations.edited,
        }
    }
}

impl fmt::Display for BubbleView {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = if self.selected { "*" } else { " " };
        match (self.style, self.direction) {
            (BubbleStyle::Notice, _) | (BubbleStyle::Placeholder, _) => {
                write!(formatter, "{marker}   -- {} --", self.text)?;
            }
            (BubbleStyle::Bubble, Direction::Outbound) => {
                write!(formatter, "{marker} > {}", self.text)?;
            }
            (BubbleStyle::Bubble, Direction::Inbound) => {
                let label = self.label.as_deref().unwrap_or_default();
                write!(formatter, "{marker} < {label}: {}", self.text)?;
            }
        }
        if self.edited {
            write!(formatter, " (edited)")?;
        }
        if let Some(translation) = &self.translation {
            write!(formatter, " [{translation}]")?;
        }
        Ok(())
    }
}

fn display_text(kind: &MessageKind) -> String {
    match kind {
        MessageKind::Text { text } => text.clone(),
        MessageKind::Sticker { name, .. } => format!("[Sticker: {name}]"),
        MessageKind::VoiceClip {
            transcript,
            duration_secs,
        } => format!("[Voice {duration_secs}\"] {transcript}"),
        MessageKind::LocationPin {
            name,
            address,
            radius_m,
        } => {
            let mut text = format!("[Location] {name}");
            if let Some(address) = address {
                text.push_str(&format!(", {address}"));
            }
            if let Some(radius_m) = radius_m {
                text.push_str(&format!(" (within {radius_m} m)"));
            }
            text
        }
        MessageKind::CallEvent { call, outcome } => match outcome {
            CallOutcome::Requested => format!("[{} requested]", call.label()),
            CallOutcome::Declined => format!("[{} declined]", call.label()),
            CallOutcome::Ended { duration_secs } => {
                format!("[{} ended after {duration_secs}s]", call.label())
            }
        },
        MessageKind::Gift(card) => card_text("Gift", card),
        MessageKind::Transfer(card) => card_text("Transfer", card),
        MessageKind::ImageCard { description } => format!("[Image] {description}"),
        MessageKind::Retracted { .. } => RETRACTED_PLACEHOLDER.to_string(),
        MessageKind::SystemNotice { text } => text.clone(),
    }
}

fn card_text(label: &str, card: &PaymentCard) -> String {
    let status = match card.status {
        CardStatus::Pending => "pending",
        CardStatus::Claimed => "claimed",
        CardStatus::Returned => "returned",
    };
    if card.note.is_empty() {
        format!("[{label} {}] ({status})", card.amount)
    } else {
        format!("[{label} {}] {} ({status})", card.amount, card.note)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderNode {
    LoadMore { remaining: usize },
    Message(BubbleView),
}

impl RenderNode {
    pub fn key(&self) -> NodeKey {
        match self {
            Self::LoadMore { .. } => NodeKey::LoadMore,
            Self::Message(bubble) => NodeKey::Message(bubble.id),
        }
    }
}

impl fmt::Display for RenderNode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoadMore { remaining } => {
                write!(formatter, "  ^ load {remaining} earlier messages")
            }
            Self::Message(bubble) => fmt::Display::fmt(bubble, formatter),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollMetrics {
    pub scroll_top: f32,
    pub scroll_height: f32,
    pub client_height: f32,
}

impl ScrollMetrics {
    pub fn max_scroll_top(&self) -> f32 {
        (self.scroll_height - self.client_height).max(0.)
    }

    pub fn distance_from_bottom(&self) -> f32 {
        (self.max_scroll_top() - self.scroll_top).max(0.)
    }
}

/// Node box relative to the top of the viewport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElementRect {
    pub top: f32,
    pub height: f32,
}

impl ElementRect {
    pub fn bottom(&self) -> f32 {
        self.top + self.height
    }
}

/// The scrollable message container a view draws into.
///
/// Nodes are kept in display order. Layout may be deferred until the next frame,
/// so metrics read right after a mutation may still describe the old layout.
pub trait RenderSurface: Send {
    fn clear(&mut self) -> SurfaceResult<()>;
    fn append(&mut self, node: RenderNode) -> SurfaceResult<()>;
    /// Inserts `nodes` above every existing node, keeping their order.
    fn prepend(&mut self, nodes: Vec<RenderNode>) -> SurfaceResult<()>;
    /// Returns false when no node has that key.
    fn replace(&mut self, key: NodeKey, node: RenderNode) -> SurfaceResult<bool>;
    fn remove(&mut self, key: NodeKey) -> SurfaceResult<bool>;
    fn metrics(&self) -> SurfaceResult<ScrollMetrics>;
    fn set_scroll_top(&mut self, scroll_top: f32) -> SurfaceResult<()>;
    fn scroll_into_view(&mut self, key: NodeKey) -> SurfaceResult<bool>;
    fn element_rect(&self, key: NodeKey) -> SurfaceResult<Option<ElementRect>>;
}

/// In-memory surface with estimated text layout. Used by the replay binary and tests.
#[derive(Debug, Clone)]
pub struct HeadlessSurface {
    nodes: Vec<(RenderNode, f32)>,
    scroll_top: f32,
    client_height: f32,
    content_width: f32,
    detached: bool,
}

impl Default for HeadlessSurface {
    fn default() -> Self {
        Self::new(DEFAULT_CONTENT_WIDTH, DEFAULT_VIEWPORT_HEIGHT)
    }
}

impl HeadlessSurface {
    pub fn new(content_width: f32, client_height: f32) -> Self {
        Self {
            nodes: Vec::new(),
            scroll_top: 0.,
            client_height,
            content_width: content_width.max(1.),
            detached: false,
        }
    }

    pub fn detach(&mut self) {
        self.detached = true;
    }

    pub fn reattach(&mut self) {
        self.detached = false;
    }

    pub fn keys(&self) -> Vec<NodeKey> {
        self.nodes.iter().map(|(node, _)| node.key()).collect()
    }

    pub fn message_ids(&self) -> Vec<MessageId> {
        self.nodes
            .iter()
            .filter_map(|(node, _)| match node {
                RenderNode::Message(bubble) => Some(bubble.id),
                RenderNode::LoadMore { .. } => None,
            })
            .collect()
    }

    pub fn node(&self, key: NodeKey) -> Option<&RenderNode> {
        self.nodes
            .iter()
            .map(|(node, _)| node)
            .find(|node| node.key() == key)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Text rendering of every node, top to bottom.
    pub fn dump(&self) -> String {
        self.nodes
            .iter()
            .map(|(node, _)| node.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn ensure_attached(&self, stage: &'static str) -> SurfaceResult<()> {
        if self.detached {
            return DetachedSnafu { stage }.fail();
        }
        Ok(())
    }

    fn scroll_height(&self) -> f32 {
        self.nodes.iter().map(|(_, height)| height).sum()
    }

    fn top_of(&self, key: NodeKey) -> Option<(f32, f32)> {
        let mut top = 0.;
        for (node, height) in &self.nodes {
            if node.key() == key {
                return Some((top, *height));
            }
            top += height;
        }
        None
    }

    fn clamp_scroll(&mut self) {
        let max = (self.scroll_height() - self.client_height).max(0.);
        self.scroll_top = self.scroll_top.clamp(0., max);
    }

    fn measure(&self, node: RenderNode) -> (RenderNode, f32) {
        let height = estimate_node_height(&node, self.content_width);
        (node, height)
    }
}

impl RenderSurface for HeadlessSurface {
    fn clear(&mut self) -> SurfaceResult<()> {
        self.ensure_attached("surface-clear")?;
        self.nodes.clear();
        self.scroll_top = 0.;
        Ok(())
    }

    fn append(&mut self, node: RenderNode) -> SurfaceResult<()> {
        self.ensure_attached("surface-append")?;
        let measured = self.measure(node);
        self.nodes.push(measured);
        Ok(())
    }

    fn prepend(&mut self, nodes: Vec<RenderNode>) -> SurfaceResult<()> {
        self.ensure_attached("surface-prepend")?;
        let measured = nodes
            .into_iter()
            .map(|node| self.measure(node))
            .collect::<Vec<_>>();
        self.nodes.splice(0..0, measured);
        Ok(())
    }

    fn replace(&mut self, key: NodeKey, node: RenderNode) -> SurfaceResult<bool> {
        self.ensure_attached("surface-replace")?;
        let Some(index) = self.nodes.iter().position(|(node, _)| node.key() == key) else {
            return Ok(false);
        };
        self.nodes[index] = self.measure(node);
        self.clamp_scroll();
        Ok(true)
    }

    fn remove(&mut self, key: NodeKey) -> SurfaceResult<bool> {
        self.ensure_attached("surface-remove")?;
        let Some(index) = self.nodes.iter().position(|(node, _)| node.key() == key) else {
            return Ok(false);
        };
        self.nodes.remove(index);
        self.clamp_scroll();
        Ok(true)
    }

    fn metrics(&self) -> SurfaceResult<ScrollMetrics> {
        self.ensure_attached("surface-metrics")?;
        Ok(ScrollMetrics {
            scroll_top: self.scroll_top,
            scroll_height: self.scroll_height(),
            client_height: self.client_height,
        })
    }

    fn set_scroll_top(&mut self, scroll_top: f32) -> SurfaceResult<()> {
        self.ensure_attached("surface-set-scroll-top")?;
        self.scroll_top = scroll_top;
        self.clamp_scroll();
        Ok(())
    }

    fn scroll_into_view(&mut self, key: NodeKey) -> SurfaceResult<bool> {
        self.ensure_attached("surface-scroll-into-view")?;
        let Some((top, _)) = self.top_of(key) else {
            return Ok(false);
        };
        self.scroll_top = top;
        self.clamp_scroll();
        Ok(true)
    }

    fn element_rect(&self, key: NodeKey) -> SurfaceResult<Option<ElementRect>> {
        self.ensure_attached("surface-element-rect")?;
        Ok(self.top_of(key).map(|(top, height)| ElementRect {
            top: top - self.scroll_top,
            height,
        }))
    }
}

fn estimate_node_height(node: &RenderNode, content_width: f32) -> f32 {
    let bubble = match node {
        RenderNode::LoadMore { .. } => return LOAD_MORE_HEIGHT,
        RenderNode::Message(bubble) => bubble,
    };

    let body = match (bubble.style, bubble.direction) {
        (BubbleStyle::Notice | BubbleStyle::Placeholder, _) => {
            estimate_text_height(&bubble.text, content_width)
        }
        (BubbleStyle::Bubble, Direction::Outbound) => {
            let bubble_width = content_width.min(OUTBOUND_BUBBLE_MAX_WIDTH);
            let text_width = (bubble_width - BUBBLE_PADDING_X * 2.).max(1.);
            estimate_text_height(&bubble.text, text_width) + BUBBLE_PADDING_Y * 2.
        }
        (BubbleStyle::Bubble, Direction::Inbound) => {
            INBOUND_LABEL_HEIGHT
                + INBOUND_LABEL_GAP
                + estimate_text_height(&bubble.text, content_width)
        }
    };

    let translation = bubble.translation.as_deref().map_or(0., |translation| {
        TRANSLATION_GAP + estimate_text_height(translation, content_width)
    });
    body + translation + ROW_GAP
}

fn estimate_text_height(content: &str, width: f32) -> f32 {
    if content.is_empty() {
        return ESTIMATED_TEXT_LINE_HEIGHT;
    }

    let chars_per_line = (width / ESTIMATED_CHAR_WIDTH).floor().max(1.0) as usize;

    let mut line_count = 0usize;
    for line in content.lines() {
        let char_count = line.chars().count().max(1);
        line_count += char_count.div_ceil(chars_per_line);
    }

    // A trailing newline opens one more empty line.
    if content.ends_with('\n') {
        line_count += 1;
    }

    ESTIMATED_TEXT_LINE_HEIGHT * line_count.max(1) as f32
}
