//! Process-wide request pacing
//!
//! A token-bucket style pacer: `take` returns once the caller may proceed,
//! spacing grants one `1/rate` interval apart. Two buckets exist per
//! process, one ahead of every registry request and a separate one for tag
//! listing so that list-heavy rule expansion cannot starve transfers.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(per_second: u32) -> Self {
        let per_second = per_second.max(1);
        RateLimiter {
            interval: Duration::from_secs(1) / per_second,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// Wait for the next grant. Grants are handed out in arrival order at
    /// a fixed pace; an idle limiter grants immediately.
    pub async fn take(&self) {
        let wake = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let at = (*next).max(now);
            *next = at + self.interval;
            at
        };
        tokio::time::sleep_until(wake).await;
    }
}
