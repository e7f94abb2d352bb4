use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use murmur_storage::{Direction, MessageId};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::surface::ElementRect;

const MENU_ITEM_HEIGHT: f32 = 36.;
const MENU_PADDING: f32 = 8.;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractionConfig {
    pub long_press_ms: u64,
    pub move_tolerance_px: f32,
    pub double_tap_ms: u64,
    pub reply_debounce_ms: u64,
}

impl Default for InteractionConfig {
    fn default() -> Self {
        Self {
            long_press_ms: 500,
            move_tolerance_px: 10.,
            double_tap_ms: 300,
            reply_debounce_ms: 1_000,
        }
    }
}

/// What a pointer landed on, resolved by the host before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitTarget {
    Avatar {
        id: MessageId,
        direction: Direction,
    },
    Bubble {
        id: MessageId,
        direction: Direction,
        retracted: bool,
        editable: bool,
    },
    QuoteJump {
        target: MessageId,
    },
    TranslationDismiss {
        id: MessageId,
    },
    LoadMore,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerPhase {
    Down,
    Move,
    Up,
    DoubleClick,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerEvent {
    pub phase: PointerPhase,
    pub target: HitTarget,
    pub x: f32,
    pub y: f32,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuItem {
    Translate,
    Edit,
    Retract,
    Delete,
    MultiSelect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuPlacement {
    Above,
    Below,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractionEffect {
    Activate(MessageId),
    ToggleSelection(MessageId),
    RequestReply,
    OpenContextMenu {
        id: MessageId,
        items: Vec<MenuItem>,
        placement: MenuPlacement,
    },
    JumpToQuote(MessageId),
    DismissTranslation(MessageId),
    LoadMore,
}

/// Geometry the delegate needs to place a context menu.
pub trait LayoutProbe {
    fn element_rect(&self, id: MessageId) -> Option<ElementRect>;
    fn viewport_height(&self) -> f32;
}

#[derive(Debug, Clone, Copy)]
struct Press {
    target: HitTarget,
    x: f32,
    y: f32,
    started: Instant,
    fired: bool,
}

/// Turns raw pointer input of one view into high-level effects.
///
/// Owns the single long-press timer and double-tap counter of its view. The
/// host drives the timer through `on_tick`.
#[derive(Debug)]
pub struct InteractionDelegate {
    config: InteractionConfig,
    attached: bool,
    multi_select: bool,
    press: Option<Press>,
    last_avatar_tap: Option<(MessageId, Instant)>,
    last_reply_request: Option<Instant>,
    reply_in_flight: Arc<AtomicBool>,
}

impl InteractionDelegate {
    pub fn new(config: InteractionConfig, reply_in_flight: Arc<AtomicBool>) -> Self {
        Self {
            config,
            attached: false,
            multi_select: false,
            press: None,
            last_avatar_tap: None,
            last_reply_request: None,
            reply_in_flight,
        }
    }

    /// Binds the delegate to its view. Returns false if it was already bound.
    pub fn attach(&mut self) -> bool {
        if self.attached {
            tracing::debug!("interaction delegate already attached");
            return false;
        }
        self.attached = true;
        true
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn set_multi_select(&mut self, enabled: bool) {
        self.multi_select = enabled;
        self.press = None;
    }

    pub fn is_multi_select(&self) -> bool {
        self.multi_select
    }

    pub fn handle(&mut self, event: PointerEvent) -> Vec<InteractionEffect> {
        if !self.attached {
            return Vec::new();
        }
        match event.phase {
            PointerPhase::Down => {
                self.press = Some(Press {
                    target: event.target,
                    x: event.x,
                    y: event.y,
                    started: event.at,
                    fired: false,
                });
                Vec::new()
            }
            PointerPhase::Move => {
                if let Some(press) = self.press {
                    let distance = (event.x - press.x).hypot(event.y - press.y);
                    if distance > self.config.move_tolerance_px {
                        self.press = None;
                    }
                }
                Vec::new()
            }
            PointerPhase::Up => {
                let Some(press) = self.press.take() else {
                    return Vec::new();
                };
                if press.fired || press.target != event.target {
                    return Vec::new();
                }
                self.tap(event.target, event.at)
            }
            PointerPhase::DoubleClick => match event.target {
                HitTarget::Avatar {
                    direction: Direction::Inbound,
                    ..
                } => self.request_reply(event.at).into_iter().collect(),
                _ => Vec::new(),
            },
        }
    }

    /// Fires the long-press menu once the press has been held long enough.
    pub fn on_tick(&mut self, now: Instant, layout: &dyn LayoutProbe) -> Option<InteractionEffect> {
        let press = self.press.as_mut()?;
        if press.fired || self.multi_select {
            return None;
        }
        if now.saturating_duration_since(press.started) < Duration::from_millis(self.config.long_press_ms) {
            return None;
        }
        let HitTarget::Bubble {
            id,
            direction,
            retracted,
            editable,
        } = press.target
        else {
            return None;
        };
        press.fired = true;

        let items = menu_items(direction, retracted, editable);
        let menu_height = items.len() as f32 * MENU_ITEM_HEIGHT + MENU_PADDING * 2.;
        let placement = match layout.element_rect(id) {
            Some(rect) => place_menu(rect, menu_height, layout.viewport_height()),
            None => MenuPlacement::Below,
        };
        Some(InteractionEffect::OpenContextMenu {
            id,
            items,
            placement,
        })
    }

    fn tap(&mut self, target: HitTarget, at: Instant) -> Vec<InteractionEffect> {
        match target {
            HitTarget::Avatar { id, direction } => {
                let double_tap = self.last_avatar_tap.is_some_and(|(last, when)| {
                    last == id
                        && at.saturating_duration_since(when)
                            <= Duration::from_millis(self.config.double_tap_ms)
                });
                if double_tap {
                    self.last_avatar_tap = None;
                    if direction == Direction::Inbound {
                        return self.request_reply(at).into_iter().collect();
                    }
                    return Vec::new();
                }
                self.last_avatar_tap = Some((id, at));
                vec![self.activate(id)]
            }
            HitTarget::Bubble { id, .. } => vec![self.activate(id)],
            HitTarget::QuoteJump { target } => vec![InteractionEffect::JumpToQuote(target)],
            HitTarget::TranslationDismiss { id } => vec![InteractionEffect::DismissTranslation(id)],
            HitTarget::LoadMore => vec![InteractionEffect::LoadMore],
            HitTarget::Background => Vec::new(),
        }
    }

    fn activate(&self, id: MessageId) -> InteractionEffect {
        if self.multi_select {
            InteractionEffect::ToggleSelection(id)
        } else {
            InteractionEffect::Activate(id)
        }
    }

    fn request_reply(&mut self, at: Instant) -> Option<InteractionEffect> {
        if self.reply_in_flight.load(Ordering::Acquire) {
            tracing::debug!("reply request suppressed, previous reply still in flight");
            return None;
        }
        let debounce = Duration::from_millis(self.config.reply_debounce_ms);
        if self
            .last_reply_request
            .is_some_and(|last| at.saturating_duration_since(last) < debounce)
        {
            tracing::debug!("reply request debounced");
            return None;
        }
        self.last_reply_request = Some(at);
        Some(InteractionEffect::RequestReply)
    }
}

fn menu_items(direction: Direction, retracted: bool, editable: bool) -> Vec<MenuItem> {
    if retracted {
        return vec![MenuItem::Delete];
    }
    let mut items = Vec::with_capacity(5);
    match direction {
        Direction::Inbound => items.push(MenuItem::Translate),
        Direction::Outbound if editable => items.push(MenuItem::Edit),
        Direction::Outbound => {}
    }
    items.extend([MenuItem::Retract, MenuItem::Delete, MenuItem::MultiSelect]);
    items
}

/// Opens below the bubble unless that overflows the viewport and above fits.
pub fn place_menu(rect: ElementRect, menu_height: f32, viewport_height: f32) -> MenuPlacement {
    if rect.bottom() + menu_height <= viewport_height {
        MenuPlacement::Below
    } else if rect.top - menu_height >= 0. {
        MenuPlacement::Above
    } else {
        MenuPlacement::Below
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedLayout {
        rect: Option<ElementRect>,
        viewport: f32,
    }

    impl LayoutProbe for FixedLayout {
        fn element_rect(&self, _id: MessageId) -> Option<ElementRect> {
            self.rect
        }

        fn viewport_height(&self) -> f32 {
            self.viewport
        }
    }

    fn delegate() -> (InteractionDelegate, Arc<AtomicBool>) {
        let gate = Arc::new(AtomicBool::new(false));
        let mut delegate = InteractionDelegate::new(InteractionConfig::default(), gate.clone());
        assert!(delegate.attach());
        (delegate, gate)
    }

    fn event(phase: PointerPhase, target: HitTarget, x: f32, at: Instant) -> PointerEvent {
        PointerEvent {
            phase,
            target,
            x,
            y: 0.,
            at,
        }
    }

    fn tap(delegate: &mut InteractionDelegate, target: HitTarget, at: Instant) -> Vec<InteractionEffect> {
        delegate.handle(event(PointerPhase::Down, target, 0., at));
        delegate.handle(event(PointerPhase::Up, target, 0., at + Duration::from_millis(40)))
    }

    fn inbound_avatar(id: MessageId) -> HitTarget {
        HitTarget::Avatar {
            id,
            direction: Direction::Inbound,
        }
    }

    fn bubble(id: MessageId) -> HitTarget {
        HitTarget::Bubble {
            id,
            direction: Direction::Outbound,
            retracted: false,
            editable: true,
        }
    }

    #[test]
    fn second_attach_is_refused() {
        let (mut delegate, _) = delegate();
        assert!(!delegate.attach());
    }

    #[test]
    fn double_tap_on_inbound_avatar_requests_a_reply_once() {
        let (mut delegate, _) = delegate();
        let id = MessageId::new_v7();
        let start = Instant::now();

        assert_eq!(
            tap(&mut delegate, inbound_avatar(id), start),
            vec![InteractionEffect::Activate(id)]
        );
        assert_eq!(
            tap(&mut delegate, inbound_avatar(id), start + Duration::from_millis(200)),
            vec![InteractionEffect::RequestReply]
        );

        tap(&mut delegate, inbound_avatar(id), start + Duration::from_millis(500));
        assert!(tap(&mut delegate, inbound_avatar(id), start + Duration::from_millis(700)).is_empty());
    }

    #[test]
    fn reply_requests_are_suppressed_while_in_flight() {
        let (mut delegate, gate) = delegate();
        let id = MessageId::new_v7();
        gate.store(true, Ordering::Release);
        let double_click = event(PointerPhase::DoubleClick, inbound_avatar(id), 0., Instant::now());
        assert!(delegate.handle(double_click).is_empty());

        gate.store(false, Ordering::Release);
        assert_eq!(delegate.handle(double_click), vec![InteractionEffect::RequestReply]);
    }

    #[test]
    fn long_press_opens_a_menu_that_fits_the_viewport() {
        let (mut delegate, _) = delegate();
        let id = MessageId::new_v7();
        let start = Instant::now();
        let near_bottom = FixedLayout {
            rect: Some(ElementRect {
                top: 500.,
                height: 40.,
            }),
            viewport: 600.,
        };

        delegate.handle(event(PointerPhase::Down, bubble(id), 0., start));
        assert_eq!(delegate.on_tick(start + Duration::from_millis(300), &near_bottom), None);
        let Some(InteractionEffect::OpenContextMenu {
            items, placement, ..
        }) = delegate.on_tick(start + Duration::from_millis(500), &near_bottom)
        else {
            panic!("long press did not fire");
        };
        assert_eq!(placement, MenuPlacement::Above);
        assert_eq!(items[0], MenuItem::Edit);

        assert_eq!(delegate.on_tick(start + Duration::from_millis(900), &near_bottom), None);
        let released = delegate.handle(event(PointerPhase::Up, bubble(id), 0., start + Duration::from_millis(950)));
        assert!(released.is_empty());
    }

    #[test]
    fn movement_cancels_the_long_press() {
        let (mut delegate, _) = delegate();
        let id = MessageId::new_v7();
        let start = Instant::now();
        let layout = FixedLayout {
            rect: None,
            viewport: 600.,
        };

        delegate.handle(event(PointerPhase::Down, bubble(id), 0., start));
        delegate.handle(event(PointerPhase::Move, bubble(id), 15., start + Duration::from_millis(100)));
        assert_eq!(delegate.on_tick(start + Duration::from_millis(600), &layout), None);
    }

    #[test]
    fn taps_toggle_selection_in_multi_select_mode() {
        let (mut delegate, _) = delegate();
        let id = MessageId::new_v7();
        delegate.set_multi_select(true);
        assert_eq!(
            tap(&mut delegate, bubble(id), Instant::now()),
            vec![InteractionEffect::ToggleSelection(id)]
        );
    }

    #[test]
    fn retracted_bubbles_only_offer_delete() {
        assert_eq!(menu_items(Direction::Inbound, true, false), vec![MenuItem::Delete]);
        assert_eq!(
            menu_items(Direction::Inbound, false, false),
            vec![
                MenuItem::Translate,
                MenuItem::Retract,
                MenuItem::Delete,
                MenuItem::MultiSelect
            ]
        );
    }
}
