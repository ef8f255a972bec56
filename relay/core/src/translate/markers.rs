//! Progress Marker Schedule
//!
//! Synthetic liveness chunks shown while a long generation produces no
//! content. The glyph sequence is:
//!
//! ```text
//! ⏳  ◐  ◐.  ◐..  ◓  ◓.  ◓..  ◑  ◑.  ◑..  ◒  ◒.  ◒..  ◐ ...
//! ```
//!
//! (shown for `repeat_limit = 3`). Intervals between markers grow
//! geometrically from `min_interval` up to `max_interval`.

use std::time::Duration;

/// First marker of every stream
pub const HOURGLASS: &str = "⏳";

/// Rotation phases after the hourglass
pub const CIRCLE_PHASES: [&str; 4] = ["◐", "◓", "◑", "◒"];

/// Timing and shape of progress markers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MarkerPolicy {
    /// Silence before the first marker, and the interval after real content
    pub min_interval: Duration,
    /// Upper bound on the interval between markers
    pub max_interval: Duration,
    /// Interval multiplier applied after each marker
    pub backoff_factor: u32,
    /// Markers shown per rotation phase before advancing
    pub repeat_limit: u32,
}

impl Default for MarkerPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(30),
            backoff_factor: 2,
            repeat_limit: 3,
        }
    }
}

impl MarkerPolicy {
    /// Interval following `current` when no content has appeared
    #[must_use]
    pub fn grow(&self, current: Duration) -> Duration {
        current
            .saturating_mul(self.backoff_factor.max(1))
            .min(self.max_interval)
            .max(self.min_interval)
    }
}

/// Position in the glyph sequence
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GlyphCursor {
    hourglass_shown: bool,
    /// Index into [`CIRCLE_PHASES`]
    pub glyph_index: usize,
    /// Dots appended to the current phase
    pub dot_count: u32,
}

impl GlyphCursor {
    /// Produce the next marker and advance
    pub fn advance(&mut self, repeat_limit: u32) -> String {
        if !self.hourglass_shown {
            self.hourglass_shown = true;
            return HOURGLASS.to_string();
        }

        let mut marker = CIRCLE_PHASES[self.glyph_index].to_string();
        for _ in 0..self.dot_count {
            marker.push('.');
        }

        self.dot_count += 1;
        if self.dot_count >= repeat_limit.max(1) {
            self.dot_count = 0;
            self.glyph_index = (self.glyph_index + 1) % CIRCLE_PHASES.len();
        }
        marker
    }
}
