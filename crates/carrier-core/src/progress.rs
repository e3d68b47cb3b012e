//! Progress event throttling
//!
//! A transfer reports progress at most once per interval, or every `stride`
//! chunks when a stride is set. The final progress event before completion is
//! emitted by the engine regardless of the throttle.

use std::time::{Duration, Instant};

/// Rate limiter for `FileProgress` events of one transfer
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    stride: u32,
    last: Option<Instant>,
    chunks_since: u32,
}

impl ProgressThrottle {
    /// Create a throttle; `stride == 0` disables chunk-count reporting
    #[must_use]
    pub fn new(interval: Duration, stride: u32) -> Self {
        Self {
            interval,
            stride,
            last: None,
            chunks_since: 0,
        }
    }

    /// Count one chunk and decide whether progress should be reported
    pub fn on_chunk(&mut self, now: Instant) -> bool {
        self.chunks_since = self.chunks_since.saturating_add(1);

        let by_stride = self.stride > 0 && self.chunks_since >= self.stride;
        let by_time = match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };

        if by_stride || by_time {
            self.last = Some(now);
            self.chunks_since = 0;
            true
        } else {
            false
        }
    }
}
