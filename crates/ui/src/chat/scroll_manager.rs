use gpui::{Bounds, Pixels, point};
use gpui_component::VirtualListScrollHandle;

/// Distance from the tail, in pixels, that still counts as "at the bottom".
const TAIL_THRESHOLD: f32 = 24.0;
/// Offset changes below this are layout jitter, not user scrolling.
const JITTER: f32 = 1.0;

/// One reading of the list's vertical scroll position.
///
/// gpui scrolls down with negative offsets, so the tail sits at `offset_y == -max_offset_y`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScrollSample {
    pub offset_y: f32,
    pub max_offset_y: f32,
}

impl ScrollSample {
    fn at_tail(self) -> bool {
        self.max_offset_y <= 0.0 || (self.offset_y + self.max_offset_y).abs() <= TAIL_THRESHOLD
    }
}

/// Decides whether the list should stick to the newest message.
#[derive(Debug, Clone, PartialEq)]
pub struct FollowState {
    following: bool,
    jump_requested: bool,
    previous: ScrollSample,
}

impl FollowState {
    pub fn new() -> Self {
        Self {
            following: true,
            jump_requested: false,
            previous: ScrollSample::default(),
        }
    }

    pub fn is_following(&self) -> bool {
        self.following
    }

    /// Forces the next sync to land on the tail and re-enables following.
    pub fn request_jump(&mut self) {
        self.jump_requested = true;
        self.following = true;
    }

    /// Jumps only when the reader was already at the tail.
    pub fn request_jump_if_tailing(&mut self) {
        if self.following || self.previous.at_tail() {
            self.jump_requested = true;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
        self.jump_requested = true;
    }

    /// Feeds the latest scroll position and updates follow mode from how it moved.
    pub fn observe(&mut self, sample: ScrollSample) {
        let content_resized = (sample.max_offset_y - self.previous.max_offset_y).abs() > JITTER;
        let moved = sample.offset_y - self.previous.offset_y;

        if self.jump_requested || (content_resized && self.previous.at_tail()) {
            self.following = true;
        } else if content_resized {
            // Growth while the reader is away from the tail leaves the mode untouched.
        } else if self.following && moved > JITTER {
            self.following = false;
        } else if !self.following && moved < -JITTER && sample.at_tail() {
            self.following = true;
        }

        self.previous = sample;
    }

    /// Returns whether the list should be moved to the tail now, consuming any request.
    pub fn take_jump(&mut self) -> bool {
        let jump = self.following || self.jump_requested;
        self.jump_requested = false;
        jump
    }
}

impl Default for FollowState {
    fn default() -> Self {
        Self::new()
    }
}

/// Binds a [`FollowState`] to the virtual list's scroll handle.
pub struct ScrollManager {
    handle: VirtualListScrollHandle,
    follow: FollowState,
}

impl ScrollManager {
    pub fn new() -> Self {
        Self {
            handle: VirtualListScrollHandle::new(),
            follow: FollowState::new(),
        }
    }

    pub fn handle(&self) -> &VirtualListScrollHandle {
        &self.handle
    }

    pub fn bounds(&self) -> Bounds<Pixels> {
        self.handle.bounds()
    }

    pub fn request_scroll_to_bottom(&mut self) {
        self.follow.request_jump();
    }

    pub fn request_scroll_to_bottom_if_following(&mut self) {
        self.follow.request_jump_if_tailing();
    }

    pub fn reset(&mut self) {
        self.follow.reset();
    }

    /// Reads the current position, then moves to the tail if following. Call once per frame.
    pub fn sync(&mut self) {
        let offset = self.handle.offset();
        let max_offset = self.handle.max_offset().height;
        self.follow.observe(ScrollSample {
            offset_y: f32::from(offset.y),
            max_offset_y: f32::from(max_offset),
        });

        if self.follow.take_jump() {
            let target_y = if max_offset > Pixels::ZERO {
                -max_offset
            } else {
                Pixels::ZERO
            };
            self.handle.set_offset(point(offset.x, target_y));
        }
    }
}

impl Default for ScrollManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(offset_y: f32, max_offset_y: f32) -> ScrollSample {
        ScrollSample {
            offset_y,
            max_offset_y,
        }
    }

    #[test]
    fn scrolling_up_pauses_and_returning_to_tail_resumes() {
        let mut follow = FollowState::new();
        follow.observe(sample(-500.0, 500.0));
        assert!(follow.take_jump());

        follow.observe(sample(-300.0, 500.0));
        assert!(!follow.is_following());
        assert!(!follow.take_jump());

        follow.observe(sample(-490.0, 500.0));
        assert!(follow.is_following());
    }

    #[test]
    fn growth_at_tail_keeps_following_but_not_when_reading_history() {
        let mut follow = FollowState::new();
        follow.observe(sample(-500.0, 500.0));
        follow.observe(sample(-500.0, 560.0));
        assert!(follow.is_following());

        follow.observe(sample(-200.0, 560.0));
        assert!(!follow.is_following());
        follow.observe(sample(-200.0, 640.0));
        assert!(!follow.is_following());
        assert!(!follow.take_jump());
    }

    #[test]
    fn explicit_jump_overrides_paused_follow() {
        let mut follow = FollowState::new();
        follow.observe(sample(-500.0, 500.0));
        follow.observe(sample(-100.0, 500.0));
        assert!(!follow.is_following());

        follow.request_jump();
        follow.observe(sample(-100.0, 500.0));
        assert!(follow.take_jump());
        assert!(follow.is_following());
    }
}
