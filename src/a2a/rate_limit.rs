//! Per-caller sliding-window rate limiting.
//!
//! Each caller gets `rpm` requests per minute plus a burst allowance.
//! The counter resets at the window boundary; exhaustion reports how long
//! until then.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: u32 },
    Exceeded { retry_after: Duration },
}

struct CallerWindow {
    count: u32,
    window_start: Instant,
}

pub struct CallerRateLimiter {
    rpm: u32,
    burst: u32,
    window: Duration,
    state: Mutex<HashMap<i64, CallerWindow>>,
}

impl CallerRateLimiter {
    pub fn new(rpm: u32, burst: u32) -> Self {
        Self {
            rpm,
            burst,
            window: Duration::from_secs(60),
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, caller_id: i64) -> RateLimitDecision {
        let now = Instant::now();
        let mut state = self.state.lock();
        let entry = state.entry(caller_id).or_insert(CallerWindow {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= self.window {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count += 1;
        let limit = self.rpm + self.burst;
        if entry.count > limit {
            let reset_at = entry.window_start + self.window;
            RateLimitDecision::Exceeded {
                retry_after: reset_at.saturating_duration_since(now),
            }
        } else {
            RateLimitDecision::Allowed {
                remaining: limit - entry.count,
            }
        }
    }

    /// Drop idle windows; called from a background task.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let window = self.window;
        self.state
            .lock()
            .retain(|_, entry| now.duration_since(entry.window_start) < window * 2);
    }
}
