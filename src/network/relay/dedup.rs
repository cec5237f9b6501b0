// Duplicate suppression for lastMove notifications
// The store may deliver the same change more than once; a move seen again
// inside the window is the same move, not a new one

use std::time::Duration;
use tokio::time::Instant;

use super::schema::LastMove;

#[derive(Debug, Clone)]
pub struct MoveDeduper {
    window: Duration,
    last: Option<(LastMove, Instant)>,
}

impl MoveDeduper {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// True if `mv` repeats the last processed move within the window.
    /// Otherwise `mv` becomes the last processed move.
    pub fn is_duplicate(&mut self, mv: LastMove, now: Instant) -> bool {
        if let Some((seen, at)) = self.last {
            if seen == mv && now.saturating_duration_since(at) < self.window {
                return true;
            }
        }
        self.record(mv, now);
        false
    }

    /// Remember a move we produced ourselves, so its echo is dropped
    pub fn record(&mut self, mv: LastMove, now: Instant) {
        self.last = Some((mv, now));
    }

    pub fn clear(&mut self) {
        self.last = None;
    }
}
