//! Per-connection message rate limiting.
//!
//! Classic token bucket, parameterised by role:
//!   phone — 30 msg/min sustained, burst 30
//!   agent — 120 msg/min sustained, burst 120
//!
//! Each inbound application frame costs 1 token. Empty bucket = deny.

use std::time::Instant;

use pairlink_core::Role;

/// Hard cap on a single application frame.
pub const MAX_MESSAGE_SIZE: usize = 5 * 1024 * 1024;

const PHONE_MESSAGES_PER_MINUTE: f64 = 30.0;
const AGENT_MESSAGES_PER_MINUTE: f64 = 120.0;

#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// Bucket sized for a connection of the given role.
    pub fn for_role(role: Role) -> Self {
        let per_minute = match role {
            Role::Phone => PHONE_MESSAGES_PER_MINUTE,
            Role::Agent => AGENT_MESSAGES_PER_MINUTE,
        };
        Self::new(per_minute, per_minute / 60.0)
    }

    /// Returns true if the frame may proceed, false if rate limited.
    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens.min(self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_bucket_depletes_after_burst() {
        let mut bucket = TokenBucket::for_role(Role::Phone);
        let mut allowed = 0;
        for _ in 0..100 {
            if bucket.allow() {
                allowed += 1;
            }
        }
        // Burst of 30, then denial (no meaningful refill in-loop).
        assert!(allowed >= 30);
        assert!(allowed < 35);
    }

    #[test]
    fn agent_bucket_is_four_times_larger() {
        let mut bucket = TokenBucket::for_role(Role::Agent);
        let mut allowed = 0;
        for _ in 0..300 {
            if bucket.allow() {
                allowed += 1;
            }
        }
        assert!(allowed >= 120);
        assert!(allowed < 125);
    }

    #[test]
    fn thirty_first_rapid_phone_frame_is_denied() {
        let mut bucket = TokenBucket::for_role(Role::Phone);
        for i in 0..30 {
            assert!(bucket.allow(), "frame {i} should pass");
        }
        assert!(!bucket.allow(), "frame 31 should be rate limited");
    }

    #[test]
    fn refill_restores_tokens_over_time() {
        let mut bucket = TokenBucket::new(2.0, 1000.0);
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(!bucket.allow());

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(bucket.allow(), "refill should have restored a token");
    }
}
