//! # Rate Regulation
//!
//! Token-bucket pacing of outbound ODATA/RDATA (and optionally SPM). Tokens
//! are bytes; the bucket refills continuously at the configured rate and is
//! capped at one second of burst. Each check covers the full TPDU including
//! the IP header overhead the stack will add.

use quanta::Instant;
use std::time::Duration;

/// Token-bucket rate limiter.
///
/// The only mutable resource shared between the send path and the timer's
/// RDATA pop; callers serialize access externally.
#[derive(Debug)]
pub struct RateLimiter {
    /// Budget in bytes per second.
    rate_per_sec: u64,
    /// IP header bytes added to every TPDU.
    iphdr_len: usize,
    /// Available tokens in bytes.
    tokens: u64,
    /// Last refill time.
    last_fill: Instant,
}

impl RateLimiter {
    pub fn new(rate_per_sec: u64, iphdr_len: usize, now: Instant) -> Self {
        assert!(rate_per_sec > 0, "rate must be positive");
        RateLimiter {
            rate_per_sec,
            iphdr_len,
            tokens: rate_per_sec,
            last_fill: now,
        }
    }

    /// Try to spend tokens for a TPDU of `tpdu_len` bytes (IP header added
    /// internally). On `true` the tokens are deducted.
    ///
    /// Blocking callers that receive `false` should sleep for
    /// [`RateLimiter::time_until`] and retry; non-blocking callers surface
    /// `RateLimited`.
    pub fn check(&mut self, tpdu_len: usize, now: Instant) -> bool {
        self.refill(now);
        let cost = (tpdu_len + self.iphdr_len) as u64;
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// How long until `tpdu_len` bytes of tokens will be available.
    pub fn time_until(&self, tpdu_len: usize, now: Instant) -> Duration {
        let cost = (tpdu_len + self.iphdr_len) as u64;
        let have = self.tokens + self.accrued(now);
        if have >= cost {
            return Duration::ZERO;
        }
        let missing = cost - have;
        Duration::from_nanos(missing.saturating_mul(1_000_000_000) / self.rate_per_sec)
    }

    pub fn rate(&self) -> u64 {
        self.rate_per_sec
    }

    fn refill(&mut self, now: Instant) {
        self.tokens = (self.tokens + self.accrued(now)).min(self.rate_per_sec);
        self.last_fill = now;
    }

    fn accrued(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.last_fill);
        (elapsed.as_nanos() as u64).saturating_mul(self.rate_per_sec) / 1_000_000_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_bucket_permits_burst() {
        let now = Instant::now();
        let mut rl = RateLimiter::new(10_000, 20, now);
        // 1 second of budget up front.
        let mut sent = 0usize;
        while rl.check(1480, now) {
            sent += 1;
        }
        assert_eq!(sent, 10_000 / 1500);
    }

    #[test]
    fn refuses_when_empty_then_refills() {
        let now = Instant::now();
        let mut rl = RateLimiter::new(1500, 20, now);
        assert!(rl.check(1480, now));
        assert!(!rl.check(1480, now));

        // One second later the bucket is full again.
        let later = now + Duration::from_secs(1);
        assert!(rl.check(1480, later));
    }

    #[test]
    fn iphdr_overhead_counted() {
        let now = Instant::now();
        let mut rl = RateLimiter::new(1000, 20, now);
        // 990 + 20 exceeds the 1000-byte budget.
        assert!(!rl.check(990, now));
        assert!(rl.check(980, now));
    }

    #[test]
    fn time_until_scales_with_deficit() {
        let now = Instant::now();
        let mut rl = RateLimiter::new(1000, 0, now);
        assert!(rl.check(1000, now));
        let wait = rl.time_until(500, now);
        assert!(wait >= Duration::from_millis(499), "wait was {wait:?}");
        assert!(wait <= Duration::from_millis(501), "wait was {wait:?}");
    }

    #[test]
    fn bucket_caps_at_one_second() {
        let now = Instant::now();
        let mut rl = RateLimiter::new(1000, 0, now);
        // Idle for ten seconds: still only one second of burst.
        let later = now + Duration::from_secs(10);
        assert!(rl.check(1000, later));
        assert!(!rl.check(1, later));
    }
}
