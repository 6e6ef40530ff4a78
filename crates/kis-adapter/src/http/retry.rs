/*
[INPUT]:  Errors from REST calls and WebSocket connects
[OUTPUT]: Retry decisions and exponential backoff delays with jitter
[POS]:    HTTP layer - failure classification shared by REST and streaming
[UPDATE]: When changing retry bounds or error classification
*/

use std::time::Duration;

use rand::Rng;

use crate::http::KisError;

/// How the request engine reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network failure or 5xx: exponential backoff.
    Transient,
    /// Provider asked to slow down: short fixed delay.
    Throttled,
    /// Bearer token rejected: reissue and retry once.
    TokenExpired,
    /// Surface immediately.
    Fatal,
}

/// Bounded exponential backoff with symmetric jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first; `None` retries forever.
    pub max_attempts: Option<u32>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Fraction of the delay added or removed at random (0.1 = ±10%).
    pub jitter: f64,
}

impl RetryPolicy {
    /// Policy for REST calls.
    pub fn rest() -> Self {
        Self {
            max_attempts: Some(3),
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            jitter: 0.1,
        }
    }

    /// Policy for WebSocket reconnects.
    pub fn reconnect() -> Self {
        Self {
            max_attempts: None,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.1,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn classify(err: &KisError) -> ErrorClass {
        if err.is_rate_limited() {
            ErrorClass::Throttled
        } else if err.is_token_expired() {
            ErrorClass::TokenExpired
        } else if err.is_retryable() {
            ErrorClass::Transient
        } else {
            ErrorClass::Fatal
        }
    }

    /// `attempt` is the number of attempts already made.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }

    /// Whether a transient error after `attempt` attempts should be retried.
    pub fn should_retry(&self, err: &KisError, attempt: u32) -> bool {
        Self::classify(err) == ErrorClass::Transient && !self.is_exhausted(attempt)
    }

    /// Delay before the next try, after `attempt` attempts (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter <= 0.0 || nominal.is_zero() {
            return nominal;
        }

        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        nominal.mul_f64(1.0 + spread)
    }

    /// Delay without jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.factor.powi(exp);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::rest()
    }
}
