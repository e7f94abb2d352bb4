use std::collections::HashSet;
use std::time::Duration;

use murmur_storage::{MessageId, MessageRecord};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::scroll_manager::{AUTO_FOLLOW_RESUME_THRESHOLD, ScrollManager};
use super::surface::{
    BubbleView, ElementRect, NodeKey, RenderNode, RenderSurface, ScrollMetrics, SurfaceResult,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub virtual_scroll: bool,
    pub batch_size: usize,
    /// Extra records loaded above a quote-jump target.
    pub buffer_size: usize,
    pub scroll_threshold_px: f32,
    pub scroll_throttle_ms: u64,
    pub follow_tolerance_px: f32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            virtual_scroll: true,
            batch_size: 20,
            buffer_size: 15,
            scroll_threshold_px: 150.,
            scroll_throttle_ms: 100,
            follow_tolerance_px: AUTO_FOLLOW_RESUME_THRESHOLD,
        }
    }
}

/// Window bookkeeping of one view. Records before `start_offset` are not rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualScrollState {
    pub enabled: bool,
    pub batch_size: usize,
    pub buffer_size: usize,
    pub start_offset: usize,
    pub loading_more: bool,
}

/// Metrics captured right before earlier records were prepended.
#[derive(Debug, Clone, Copy)]
struct ScrollAnchor {
    scroll_top: f32,
    scroll_height: f32,
}

/// Renders the tail of a history and grows the window upward on demand.
///
/// Prepending moves content under the reader; the renderer captures the scroll
/// metrics before every prepend and restores the reading position on the next
/// frame, once the surface has laid the new nodes out.
pub struct WindowedRenderer<S> {
    surface: S,
    config: RenderConfig,
    state: VirtualScrollState,
    scroll: ScrollManager,
    participant: String,
    selected: HashSet<MessageId>,
    rendered: usize,
    anchor: Option<ScrollAnchor>,
    pending_reveal: Option<MessageId>,
    last_scroll_check: Option<Instant>,
}

impl<S: RenderSurface> WindowedRenderer<S> {
    pub fn new(surface: S, config: RenderConfig, participant: impl Into<String>) -> Self {
        let state = VirtualScrollState {
            enabled: config.virtual_scroll,
            batch_size: config.batch_size.max(1),
            buffer_size: config.buffer_size,
            start_offset: 0,
            loading_more: false,
        };
        Self {
            surface,
            scroll: ScrollManager::new(config.follow_tolerance_px),
            config,
            state,
            participant: participant.into(),
            selected: HashSet::new(),
            rendered: 0,
            anchor: None,
            pending_reveal: None,
            last_scroll_check: None,
        }
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn state(&self) -> VirtualScrollState {
        self.state
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// Number of records currently on the surface.
    pub fn rendered_count(&self) -> usize {
        self.rendered
    }

    pub fn is_following_bottom(&self) -> bool {
        self.scroll.is_following_bottom()
    }

    pub fn set_participant(&mut self, participant: impl Into<String>) {
        self.participant = participant.into();
    }

    pub fn is_selected(&self, id: MessageId) -> bool {
        self.selected.contains(&id)
    }

    pub fn selected(&self) -> Vec<MessageId> {
        self.selected.iter().copied().collect()
    }

    pub fn render(&mut self, records: &[MessageRecord], force_bottom: bool) {
        if !self.state.enabled || records.len() <= self.state.batch_size {
            self.render_all(records);
        } else {
            self.render_window(records);
        }
        if force_bottom {
            self.scroll.request_scroll_to_bottom();
        } else {
            self.scroll.request_scroll_to_bottom_if_following();
        }
    }

    pub fn render_all(&mut self, records: &[MessageRecord]) {
        self.rebuild(records, 0);
    }

    pub fn render_window(&mut self, records: &[MessageRecord]) {
        let start = records.len().saturating_sub(self.state.batch_size);
        self.rebuild(records, start);
    }

    fn rebuild(&mut self, records: &[MessageRecord], start: usize) {
        self.state.start_offset = start;
        self.state.loading_more = false;
        self.anchor = None;
        self.pending_reveal = None;
        self.rendered = 0;

        let nodes = records[start..]
            .iter()
            .map(|record| self.node(record))
            .collect::<Vec<_>>();
        let count = nodes.len();
        match fill(&mut self.surface, start, nodes) {
            Ok(()) => self.rendered = count,
            Err(error) => tracing::warn!(start, "skipping render: {error}"),
        }
    }

    /// Prepends up to one batch of earlier records. A call while a previous load is
    /// still waiting for its frame does nothing.
    pub fn load_more(&mut self, records: &[MessageRecord]) -> bool {
        if self.state.loading_more {
            tracing::debug!("load more ignored, previous load still pending");
            return false;
        }
        if self.state.start_offset == 0 {
            return false;
        }
        let start = self.state.start_offset.saturating_sub(self.state.batch_size);
        self.extend_window(records, start)
    }

    /// Renders `records[start..start_offset]` above the window and arms the anchor.
    fn extend_window(&mut self, records: &[MessageRecord], start: usize) -> bool {
        let end = self.state.start_offset.min(records.len());
        if start >= end {
            return false;
        }
        self.state.loading_more = true;

        let mut nodes = Vec::with_capacity(end - start + 1);
        if start > 0 {
            nodes.push(RenderNode::LoadMore { remaining: start });
        }
        nodes.extend(records[start..end].iter().map(|record| self.node(record)));

        match prepend_above(&mut self.surface, nodes) {
            Ok(before) => {
                self.rendered += end - start;
                self.state.start_offset = start;
                self.anchor = Some(ScrollAnchor {
                    scroll_top: before.scroll_top,
                    scroll_height: before.scroll_height,
                });
                tracing::debug!(loaded = end - start, start_offset = start, "prepended earlier records");
                true
            }
            Err(error) => {
                self.state.loading_more = false;
                tracing::warn!("skipping load more: {error}");
                false
            }
        }
    }

    /// Runs after the surface laid out the latest changes.
    pub fn on_frame(&mut self) {
        if let Err(error) = self.apply_frame() {
            self.state.loading_more = false;
            self.anchor = None;
            self.pending_reveal = None;
            tracing::warn!("skipping frame update: {error}");
        }
    }

    fn apply_frame(&mut self) -> SurfaceResult<()> {
        if let Some(anchor) = self.anchor.take() {
            let metrics = self.surface.metrics()?;
            let inserted = metrics.scroll_height - anchor.scroll_height;
            self.surface.set_scroll_top(anchor.scroll_top + inserted)?;
            self.state.loading_more = false;
            self.scroll.update_follow_state(&self.surface.metrics()?);
        }

        if let Some(target) = self.pending_reveal.take() {
            self.surface.scroll_into_view(NodeKey::Message(target))?;
            self.scroll.update_follow_state(&self.surface.metrics()?);
            return Ok(());
        }

        self.scroll.apply_pending_scroll(&mut self.surface)?;
        Ok(())
    }

    /// Scroll handler. Loads earlier records when the reader nears the top.
    pub fn on_scroll(&mut self, records: &[MessageRecord], now: Instant) -> bool {
        let throttle = Duration::from_millis(self.config.scroll_throttle_ms);
        if self
            .last_scroll_check
            .is_some_and(|last| now.saturating_duration_since(last) < throttle)
        {
            return false;
        }
        self.last_scroll_check = Some(now);

        let metrics = match self.surface.metrics() {
            Ok(metrics) => metrics,
            Err(error) => {
                tracing::warn!("skipping scroll check: {error}");
                return false;
            }
        };
        self.scroll.update_follow_state(&metrics);

        if metrics.scroll_top < self.config.scroll_threshold_px
            && self.state.start_offset > 0
            && !self.state.loading_more
        {
            return self.load_more(records);
        }
        false
    }

    /// Adds a newly delivered record at the bottom.
    pub fn append(&mut self, record: &MessageRecord, force_bottom: bool) {
        if let Ok(metrics) = self.surface.metrics() {
            self.scroll.update_follow_state(&metrics);
        }
        if let Err(error) = self.surface.append(self.node(record)) {
            tracing::warn!(message = %record.id, "skipping append: {error}");
            return;
        }
        self.rendered += 1;

        if force_bottom {
            self.scroll.request_scroll_to_bottom();
        } else {
            self.scroll.request_scroll_to_bottom_if_following();
        }
    }

    /// Re-renders one record in place. Records outside the window are left alone.
    pub fn replace(&mut self, record: &MessageRecord) -> bool {
        match self
            .surface
            .replace(NodeKey::Message(record.id), self.node(record))
        {
            Ok(replaced) => replaced,
            Err(error) => {
                tracing::warn!(message = %record.id, "skipping replace: {error}");
                false
            }
        }
    }

    /// Drops a record that was at `index` in the history before removal.
    pub fn remove(&mut self, id: MessageId, index: usize) {
        self.selected.remove(&id);
        if index < self.state.start_offset {
            self.state.start_offset -= 1;
            let remaining = self.state.start_offset;
            let result = if remaining == 0 {
                self.surface.remove(NodeKey::LoadMore)
            } else {
                self.surface
                    .replace(NodeKey::LoadMore, RenderNode::LoadMore { remaining })
            };
            if let Err(error) = result {
                tracing::warn!("skipping load-more update: {error}");
            }
            return;
        }

        match self.surface.remove(NodeKey::Message(id)) {
            Ok(true) => self.rendered = self.rendered.saturating_sub(1),
            Ok(false) => {}
            Err(error) => tracing::warn!(message = %id, "skipping remove: {error}"),
        }
    }

    /// Brings a record into view, growing the window upward if it is not rendered.
    pub fn reveal(&mut self, records: &[MessageRecord], id: MessageId) -> bool {
        let Some(index) = records.iter().position(|record| record.id == id) else {
            tracing::debug!(message = %id, "quote target no longer exists");
            return false;
        };

        if index < self.state.start_offset {
            if self.state.loading_more {
                tracing::debug!(message = %id, "reveal ignored, load still pending");
                return false;
            }
            let start = index.saturating_sub(self.state.buffer_size);
            if !self.extend_window(records, start) {
                return false;
            }
            self.pending_reveal = Some(id);
            return true;
        }

        match self.surface.scroll_into_view(NodeKey::Message(id)) {
            Ok(found) => found,
            Err(error) => {
                tracing::warn!(message = %id, "skipping reveal: {error}");
                false
            }
        }
    }

    pub fn set_selected(&mut self, record: &MessageRecord, selected: bool) {
        let changed = if selected {
            self.selected.insert(record.id)
        } else {
            self.selected.remove(&record.id)
        };
        if changed {
            self.replace(record);
        }
    }

    /// Clears the selection and returns the ids that were selected.
    pub fn take_selection(&mut self) -> Vec<MessageId> {
        self.selected.drain().collect()
    }

    pub fn metrics(&self) -> SurfaceResult<ScrollMetrics> {
        self.surface.metrics()
    }

    pub fn element_rect(&self, id: MessageId) -> Option<ElementRect> {
        self.surface
            .element_rect(NodeKey::Message(id))
            .ok()
            .flatten()
    }

    fn node(&self, record: &MessageRecord) -> RenderNode {
        RenderNode::Message(BubbleView::from_record(
            record,
            &self.participant,
            self.selected.contains(&record.id),
        ))
    }
}

fn fill<S: RenderSurface>(surface: &mut S, start: usize, nodes: Vec<RenderNode>) -> SurfaceResult<()> {
    surface.clear()?;
    if start > 0 {
        surface.append(RenderNode::LoadMore { remaining: start })?;
    }
    for node in nodes {
        surface.append(node)?;
    }
    Ok(())
}

/// Swaps the load-more node for `nodes` and returns the metrics from before.
fn prepend_above<S: RenderSurface>(surface: &mut S, nodes: Vec<RenderNode>) -> SurfaceResult<ScrollMetrics> {
    let before = surface.metrics()?;
    surface.remove(NodeKey::LoadMore)?;
    surface.prepend(nodes)?;
    Ok(before)
}

#[cfg(test)]
mod tests {
    use murmur_storage::{Direction, MessageKind};

    use super::*;
    use crate::chat::surface::HeadlessSurface;

    fn history(count: usize) -> Vec<MessageRecord> {
        (0..count)
            .map(|index| {
                let direction = if index % 2 == 0 {
                    Direction::Inbound
                } else {
                    Direction::Outbound
                };
                MessageRecord::new(MessageKind::text(format!("message {index}")), direction)
            })
            .collect()
    }

    fn renderer(batch_size: usize) -> WindowedRenderer<HeadlessSurface> {
        let config = RenderConfig {
            batch_size,
            buffer_size: 3,
            ..RenderConfig::default()
        };
        WindowedRenderer::new(HeadlessSurface::new(680., 200.), config, "Mio")
    }

    #[test]
    fn short_histories_render_in_full() {
        let records = history(5);
        let mut renderer = renderer(10);
        renderer.render(&records, true);
        assert_eq!(renderer.state().start_offset, 0);
        assert_eq!(renderer.rendered_count(), 5);
        assert!(!renderer.surface().keys().contains(&NodeKey::LoadMore));
    }

    #[test]
    fn long_histories_render_the_trailing_batch() {
        let records = history(25);
        let mut renderer = renderer(10);
        renderer.render(&records, true);

        assert_eq!(renderer.state().start_offset, 15);
        assert_eq!(renderer.rendered_count(), 10);
        let keys = renderer.surface().keys();
        assert_eq!(keys[0], NodeKey::LoadMore);
        assert_eq!(keys[1], NodeKey::Message(records[15].id));
        assert_eq!(
            renderer.surface().node(NodeKey::LoadMore),
            Some(&RenderNode::LoadMore { remaining: 15 })
        );
    }

    #[test]
    fn load_more_lowers_the_offset_down_to_zero() {
        let records = history(25);
        let mut renderer = renderer(10);
        renderer.render(&records, true);
        renderer.on_frame();

        assert!(renderer.load_more(&records));
        renderer.on_frame();
        assert_eq!(renderer.state().start_offset, 5);
        assert_eq!(renderer.rendered_count(), 20);

        assert!(renderer.load_more(&records));
        renderer.on_frame();
        assert_eq!(renderer.state().start_offset, 0);
        assert_eq!(renderer.rendered_count(), 25);
        assert_eq!(renderer.surface().message_ids().len(), 25);
        assert!(!renderer.surface().keys().contains(&NodeKey::LoadMore));
        assert!(!renderer.load_more(&records));
    }

    #[test]
    fn second_load_while_pending_is_ignored_and_anchor_holds() {
        let records = history(40);
        let mut renderer = renderer(10);
        renderer.render(&records, true);
        renderer.on_frame();
        renderer.surface_mut().set_scroll_top(40.).expect("scroll");
        let before = renderer.metrics().expect("metrics");

        assert!(renderer.load_more(&records));
        assert!(renderer.state().loading_more);
        assert!(!renderer.load_more(&records));
        assert_eq!(renderer.state().start_offset, 20);

        let inserted = renderer.metrics().expect("metrics").scroll_height - before.scroll_height;
        renderer.on_frame();
        let after = renderer.metrics().expect("metrics");
        assert!(!renderer.state().loading_more);
        assert!(inserted > 0.);
        assert_eq!(after.scroll_top, before.scroll_top + inserted);
    }

    #[test]
    fn scrolling_near_the_top_loads_once_per_throttle_window() {
        let records = history(40);
        let mut renderer = renderer(10);
        renderer.render(&records, true);
        renderer.on_frame();
        renderer.surface_mut().set_scroll_top(0.).expect("scroll");

        let now = Instant::now();
        assert!(renderer.on_scroll(&records, now));
        renderer.on_frame();
        renderer.surface_mut().set_scroll_top(0.).expect("scroll");
        assert!(!renderer.on_scroll(&records, now + Duration::from_millis(50)));
        assert!(renderer.on_scroll(&records, now + Duration::from_millis(150)));
        assert_eq!(renderer.state().start_offset, 10);
    }

    #[test]
    fn append_follows_only_when_pinned_to_bottom() {
        let records = history(12);
        let mut renderer = renderer(10);
        renderer.render(&records, true);
        renderer.on_frame();
        let bottom = renderer.metrics().expect("metrics");
        assert_eq!(bottom.scroll_top, bottom.max_scroll_top());

        let next = MessageRecord::new(MessageKind::text("new"), Direction::Inbound);
        renderer.append(&next, false);
        renderer.on_frame();
        let metrics = renderer.metrics().expect("metrics");
        assert_eq!(metrics.scroll_top, metrics.max_scroll_top());

        renderer.surface_mut().set_scroll_top(0.).expect("scroll");
        renderer.on_scroll(&records, Instant::now());
        renderer.on_frame();
        let reading = renderer.metrics().expect("metrics").scroll_top;
        let later = MessageRecord::new(MessageKind::text("later"), Direction::Inbound);
        renderer.append(&later, false);
        renderer.on_frame();
        assert_eq!(renderer.metrics().expect("metrics").scroll_top, reading);
    }

    #[test]
    fn reveal_grows_the_window_to_the_target_with_a_buffer() {
        let records = history(40);
        let mut renderer = renderer(10);
        renderer.render(&records, true);
        renderer.on_frame();

        assert!(renderer.reveal(&records, records[12].id));
        renderer.on_frame();
        assert_eq!(renderer.state().start_offset, 9);
        let rect = renderer.element_rect(records[12].id).expect("rendered");
        assert_eq!(rect.top, 0.);
        assert!(!renderer.reveal(&records, MessageId::new_v7()));
    }

    #[test]
    fn detached_surface_resets_the_loading_flag() {
        let records = history(30);
        let mut renderer = renderer(10);
        renderer.render(&records, true);
        renderer.surface_mut().detach();

        assert!(!renderer.load_more(&records));
        assert!(!renderer.state().loading_more);
        renderer.surface_mut().reattach();
        assert!(renderer.load_more(&records));
    }

    #[test]
    fn removing_a_record_above_the_window_updates_the_counter() {
        let records = history(15);
        let mut renderer = renderer(10);
        renderer.render(&records, true);

        renderer.remove(records[2].id, 2);
        assert_eq!(renderer.state().start_offset, 4);
        assert_eq!(
            renderer.surface().node(NodeKey::LoadMore),
            Some(&RenderNode::LoadMore { remaining: 4 })
        );

        renderer.remove(records[14].id, 13);
        assert_eq!(renderer.rendered_count(), 9);
    }
}
