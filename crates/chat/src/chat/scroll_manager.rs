use super::surface::{RenderSurface, ScrollMetrics, SurfaceResult};

/// Near-bottom distance used to resume follow mode deterministically.
pub const AUTO_FOLLOW_RESUME_THRESHOLD: f32 = 24.;
/// Small delta used to ignore floating-point scroll jitter.
const SCROLL_DELTA_EPSILON: f32 = 1.0;

/// Tracks whether the view follows the newest record, independent from content.
#[derive(Debug, Clone)]
pub struct ScrollManager {
    pending_scroll_to_bottom: bool,
    follow_bottom: bool,
    last_scroll_offset: f32,
    last_max_offset: f32,
    resume_threshold: f32,
}

impl ScrollManager {
    pub fn new(resume_threshold: f32) -> Self {
        Self {
            pending_scroll_to_bottom: false,
            follow_bottom: true,
            last_scroll_offset: 0.,
            last_max_offset: 0.,
            resume_threshold,
        }
    }

    pub fn is_following_bottom(&self) -> bool {
        self.follow_bottom
    }

    pub fn has_pending_scroll(&self) -> bool {
        self.pending_scroll_to_bottom
    }

    pub fn request_scroll_to_bottom(&mut self) {
        self.pending_scroll_to_bottom = true;
        self.follow_bottom = true;
    }

    pub fn request_scroll_to_bottom_if_following(&mut self) {
        if self.follow_bottom || self.was_near_bottom() {
            self.pending_scroll_to_bottom = true;
        }
    }

    pub fn reset(&mut self) {
        self.last_scroll_offset = 0.;
        self.last_max_offset = 0.;
        self.follow_bottom = true;
        self.pending_scroll_to_bottom = true;
    }

    pub fn update_follow_state(&mut self, metrics: &ScrollMetrics) {
        let offset = metrics.scroll_top;
        let max_offset = metrics.max_scroll_top();
        let offset_delta = offset - self.last_scroll_offset;
        let max_delta = (max_offset - self.last_max_offset).abs();
        let content_size_changed = max_delta > SCROLL_DELTA_EPSILON;
        let user_scrolled_up = offset_delta < -SCROLL_DELTA_EPSILON && !content_size_changed;
        let user_scrolled_down = offset_delta > SCROLL_DELTA_EPSILON && !content_size_changed;

        // An explicit follow request keeps follow mode on until it is fulfilled.
        if self.pending_scroll_to_bottom || (content_size_changed && self.was_near_bottom()) {
            self.follow_bottom = true;
        } else if self.follow_bottom {
            if user_scrolled_up {
                self.follow_bottom = false;
            }
        } else if user_scrolled_down && self.is_near_bottom(metrics) {
            self.follow_bottom = true;
        }

        self.last_scroll_offset = offset;
        self.last_max_offset = max_offset;
    }

    /// Scrolls to the newest record if a request is pending. Returns whether it did.
    pub fn apply_pending_scroll(&mut self, surface: &mut dyn RenderSurface) -> SurfaceResult<bool> {
        if !self.pending_scroll_to_bottom {
            return Ok(false);
        }
        self.pending_scroll_to_bottom = false;

        let metrics = surface.metrics()?;
        surface.set_scroll_top(metrics.max_scroll_top())?;
        self.last_scroll_offset = metrics.max_scroll_top();
        self.last_max_offset = metrics.max_scroll_top();
        Ok(true)
    }

    pub fn is_near_bottom(&self, metrics: &ScrollMetrics) -> bool {
        metrics.max_scroll_top() <= 0. || metrics.distance_from_bottom() <= self.resume_threshold
    }

    fn was_near_bottom(&self) -> bool {
        if self.last_max_offset <= 0. {
            return true;
        }
        (self.last_max_offset - self.last_scroll_offset).abs() <= self.resume_threshold
    }
}

impl Default for ScrollManager {
    fn default() -> Self {
        Self::new(AUTO_FOLLOW_RESUME_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(scroll_top: f32, scroll_height: f32) -> ScrollMetrics {
        ScrollMetrics {
            scroll_top,
            scroll_height,
            client_height: 100.,
        }
    }

    #[test]
    fn scrolling_up_pauses_follow_and_returning_resumes_it() {
        let mut manager = ScrollManager::default();
        manager.update_follow_state(&metrics(400., 500.));
        assert!(manager.is_following_bottom());

        manager.update_follow_state(&metrics(200., 500.));
        assert!(!manager.is_following_bottom());

        manager.update_follow_state(&metrics(390., 500.));
        assert!(manager.is_following_bottom());
    }

    #[test]
    fn growth_near_bottom_keeps_following() {
        let mut manager = ScrollManager::default();
        manager.update_follow_state(&metrics(390., 500.));
        manager.update_follow_state(&metrics(390., 560.));
        assert!(manager.is_following_bottom());
    }

    #[test]
    fn follow_request_is_skipped_when_reader_is_far_up() {
        let mut manager = ScrollManager::default();
        manager.update_follow_state(&metrics(400., 500.));
        manager.update_follow_state(&metrics(100., 500.));
        manager.request_scroll_to_bottom_if_following();
        assert!(!manager.has_pending_scroll());

        manager.request_scroll_to_bottom();
        assert!(manager.has_pending_scroll());
        assert!(manager.is_following_bottom());
    }
}
