/*
[INPUT]:  Per-domain request quota (rate per period)
[OUTPUT]: Permission to issue one request, immediately or after waiting
[POS]:    HTTP layer - client-side throttling ahead of every REST call
[UPDATE]: When quota semantics or guard timing change
*/

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Extra wait past the window boundary so the next window has surely opened.
pub const WINDOW_GUARD: Duration = Duration::from_millis(50);

/// Requests per second allowed on the real domain.
pub const REAL_REQUESTS_PER_SECOND: u32 = 19;
/// Requests per second allowed on the virtual domain.
pub const VIRTUAL_REQUESTS_PER_SECOND: u32 = 2;

#[derive(Debug)]
struct Window {
    /// Start of the current window; `None` until the first call.
    last: Option<Instant>,
    count: u32,
}

/// Fixed-window throttle anchored at the first call of each window.
///
/// At most `rate` calls succeed per `period`. A failed non-blocking attempt
/// leaves the window untouched.
#[derive(Debug)]
pub struct RateLimiter {
    rate: u32,
    period: Duration,
    window: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(rate: u32, period: Duration) -> Self {
        Self {
            rate: rate.max(1),
            period,
            window: Mutex::new(Window {
                last: None,
                count: 0,
            }),
        }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Take a slot if one is free in the current window.
    pub fn try_acquire(&self) -> bool {
        self.take_slot().is_ok()
    }

    /// Take a slot, waiting for the next window when the current one is full.
    ///
    /// `on_wait` is invoked with the planned wait before sleeping. Always
    /// returns `true`.
    pub async fn acquire(&self, on_wait: Option<&(dyn Fn(Duration) + Send + Sync)>) -> bool {
        loop {
            let wait = match self.take_slot() {
                Ok(()) => return true,
                Err(wait) => wait,
            };

            if let Some(callback) = on_wait {
                callback(wait);
            }
            debug!(rate = self.rate, ?wait, "rate limit reached, waiting for next window");
            tokio::time::sleep(wait).await;
        }
    }

    /// Number of slots used in the current window.
    pub fn used(&self) -> u32 {
        let window = self.lock();
        match window.last {
            Some(last) if last.elapsed() < self.period => window.count,
            _ => 0,
        }
    }

    /// Ok when a slot was taken, otherwise the time until the window resets.
    fn take_slot(&self) -> Result<(), Duration> {
        let mut window = self.lock();
        let now = Instant::now();
        let elapsed = match window.last.map(|last| now.saturating_duration_since(last)) {
            Some(elapsed) if elapsed < self.period => elapsed,
            _ => {
                window.last = Some(now);
                window.count = 0;
                Duration::ZERO
            }
        };

        if window.count < self.rate {
            window.count += 1;
            return Ok(());
        }

        Err(self.period.saturating_sub(elapsed) + WINDOW_GUARD)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Window> {
        self.window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
