//! Scroll sampling for the scrolled reading modes: the current location is
//! the nearest anchor above the viewport top, recomputed once scrolling has
//! been quiet for the debounce period.

use std::time::{Duration, Instant};

use folio_core::{AnchorPosition, MIN_SCROLL_DEBOUNCE_MS};

/// The anchor owning the viewport whose top line is `offset`: the last
/// anchor starting at or above `offset + lookahead`. `None` when the
/// viewport is still above the first anchor.
pub fn nearest_anchor(
    offset: f64,
    anchors: &[AnchorPosition],
    lookahead: usize,
) -> Option<&AnchorPosition> {
    let top = if offset.is_finite() && offset > 0.0 {
        offset.floor() as usize
    } else {
        0
    };
    let limit = top.saturating_add(lookahead);
    anchors
        .iter()
        .filter(|anchor| anchor.line <= limit)
        .fold(None, |best: Option<&AnchorPosition>, anchor| match best {
            Some(best) if best.line >= anchor.line => Some(best),
            _ => Some(anchor),
        })
}

/// Holds the latest scroll offset until no new sample arrived for the
/// quiet period.
#[derive(Debug, Clone)]
pub struct ScrollDebouncer {
    quiet: Duration,
    pending: Option<(f64, Instant)>,
}

impl ScrollDebouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet: quiet.max(Duration::from_millis(MIN_SCROLL_DEBOUNCE_MS)),
            pending: None,
        }
    }

    pub fn quiet(&self) -> Duration {
        self.quiet
    }

    pub fn set_quiet(&mut self, quiet: Duration) {
        self.quiet = quiet.max(Duration::from_millis(MIN_SCROLL_DEBOUNCE_MS));
    }

    /// Restarts the quiet period.
    pub fn record(&mut self, offset: f64, now: Instant) {
        self.pending = Some((offset, now));
    }

    /// Returns the settled offset once, after the quiet period elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<f64> {
        let (offset, at) = self.pending?;
        if now.saturating_duration_since(at) < self.quiet {
            return None;
        }
        self.pending = None;
        Some(offset)
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}
