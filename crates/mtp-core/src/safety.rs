use crate::value::Value;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RateLimitError {
    #[error("invalid rate format '{0}', expected forms like '10/s', '60/m', '3600/h'")]
    Malformed(String),
    #[error("rate must be positive, got {0}")]
    NonPositive(f64),
}

/// Parse `"<number>/<s|m|h>"` into operations per second.
pub fn parse_rate_string(rate: &str) -> Result<f64, RateLimitError> {
    let malformed = || RateLimitError::Malformed(rate.to_string());
    let (number, unit) = rate.trim().split_once('/').ok_or_else(malformed)?;

    let digits = number.strip_prefix('-').unwrap_or(number);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(malformed());
    }
    let value: f64 = number.parse().map_err(|_| malformed())?;

    let divisor = match unit {
        "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        _ => return Err(malformed()),
    };
    if value <= 0.0 {
        return Err(RateLimitError::NonPositive(value));
    }
    Ok(value / divisor)
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket limiter. The bucket starts with a single token.
#[derive(Debug)]
pub struct RateLimiter {
    max_per_second: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(max_per_second: f64) -> Self {
        Self {
            max_per_second,
            bucket: Mutex::new(Bucket {
                tokens: 1.0,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_rate_string(rate: &str) -> Result<Self, RateLimitError> {
        parse_rate_string(rate).map(Self::new)
    }

    pub fn max_per_second(&self) -> f64 {
        self.max_per_second
    }

    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Refill for the time elapsed until `now`, then take one token if available.
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        // Sub-1/s rates still need room for one whole token.
        let capacity = self.max_per_second.max(1.0);
        bucket.tokens = (bucket.tokens + elapsed * self.max_per_second).min(capacity);
        bucket.last_refill = bucket.last_refill.max(now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteValidation {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl WriteValidation {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn denied(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Gate for every tag write: allowlist, rate limit, and the safe-state table.
#[derive(Debug)]
pub struct SafetyController {
    write_allowlist: HashSet<String>,
    safe_state_outputs: Vec<(String, Value)>,
    rate_limiter: Option<RateLimiter>,
}

impl SafetyController {
    pub fn new(
        write_allowlist: impl IntoIterator<Item = String>,
        safe_state_outputs: Vec<(String, Value)>,
        rate_limiter: Option<RateLimiter>,
    ) -> Self {
        Self {
            write_allowlist: write_allowlist.into_iter().collect(),
            safe_state_outputs,
            rate_limiter,
        }
    }

    /// A controller with nothing allowlisted and no rate limit.
    pub fn deny_all() -> Self {
        Self::new(Vec::new(), Vec::new(), None)
    }

    pub fn validate_write(&self, tag: &str) -> WriteValidation {
        if self.write_allowlist.contains(tag) {
            WriteValidation::allowed()
        } else {
            WriteValidation::denied(format!("Tag '{tag}' not in write allowlist"))
        }
    }

    pub fn check_rate_limit(&self) -> bool {
        self.rate_limiter
            .as_ref()
            .map_or(true, RateLimiter::try_acquire)
    }

    pub fn is_allowlisted(&self, tag: &str) -> bool {
        self.write_allowlist.contains(tag)
    }

    /// Safe-state outputs in configured order.
    pub fn get_safe_state_values(&self) -> &[(String, Value)] {
        &self.safe_state_outputs
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }
}
