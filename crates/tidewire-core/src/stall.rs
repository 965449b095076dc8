//! Client-side watchdog for silent connections.
//!
//! Every received event (liveness included) calls [`StallDetector::touch`].
//! The connection evaluates [`StallDetector::is_stalled`] on each check tick
//! and abandons the transport once the silence exceeds the window, without
//! waiting for a transport-level error that may never come.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct StallDetector {
    window: Duration,
    last_touch: Instant,
}

impl StallDetector {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_touch: Instant::now(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn touch(&mut self) {
        self.touch_at(Instant::now());
    }

    pub fn touch_at(&mut self, now: Instant) {
        self.last_touch = now;
    }

    /// Time since the last touch.
    pub fn silence(&self) -> Duration {
        self.silence_at(Instant::now())
    }

    pub fn silence_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_touch)
    }

    pub fn is_stalled(&self) -> bool {
        self.is_stalled_at(Instant::now())
    }

    pub fn is_stalled_at(&self, now: Instant) -> bool {
        self.silence_at(now) > self.window
    }
}
