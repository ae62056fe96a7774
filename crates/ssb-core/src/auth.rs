use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

use subtle::ConstantTimeEq;

use crate::domain::UserId;

// ============== Identity Gate ==============

/// Membership check against the static identity allow-list.
///
/// Constant-time lookup in a hash set; an empty allow-list admits nobody
/// (`Config::load` rejects that at startup anyway). No normalization: ids are
/// compared by exact equality.
pub fn is_allowed_user(user_id: Option<UserId>, allowed_users: &HashSet<i64>) -> bool {
    let Some(user_id) = user_id else {
        return false;
    };
    allowed_users.contains(&user_id.0)
}

// ============== Authenticator ==============

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthResult {
    Success,
    WrongSecret,
}

/// Validates a submitted secret against the configured one.
#[derive(Clone)]
pub struct Authenticator {
    secret: String,
}

impl Authenticator {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// Constant-time comparison of the supplied secret.
    ///
    /// `ct_eq` only works on same-length slices, so the length check comes
    /// first; the comparison itself never short-circuits on content.
    pub fn try_authenticate(&self, supplied: &str) -> AuthResult {
        let a = supplied.as_bytes();
        let b = self.secret.as_bytes();
        if a.len() == b.len() && bool::from(a.ct_eq(b)) {
            AuthResult::Success
        } else {
            AuthResult::WrongSecret
        }
    }
}

// ============== Auth Attempt Throttle (Token Bucket) ==============

#[derive(Clone, Debug)]
struct Bucket {
    tokens: f64,
    last_update: Instant,
}

/// Per-identity token bucket limiting authentication attempts.
///
/// A single static secret with no lockout is brute-forceable, so this is the
/// attempt-counting hook; it ships disabled unless configured on.
#[derive(Clone, Debug)]
pub struct AuthThrottle {
    enabled: bool,
    max_tokens: f64,
    refill_per_sec: f64,
    buckets: HashMap<UserId, Bucket>,
}

impl AuthThrottle {
    pub fn new(enabled: bool, max_attempts: u32, window: Duration) -> Self {
        let max_tokens = max_attempts as f64;
        let window_secs = window.as_secs_f64().max(1e-9);

        Self {
            enabled,
            max_tokens,
            refill_per_sec: max_tokens / window_secs,
            buckets: HashMap::new(),
        }
    }

    /// Returns whether an attempt is allowed and, if not, how long until the
    /// next one would be.
    pub fn check(&mut self, user_id: UserId) -> (bool, Option<Duration>) {
        self.check_at(user_id, Instant::now())
    }

    pub fn check_at(&mut self, user_id: UserId, now: Instant) -> (bool, Option<Duration>) {
        if !self.enabled {
            return (true, None);
        }

        let bucket = self.buckets.entry(user_id).or_insert_with(|| Bucket {
            tokens: self.max_tokens,
            last_update: now,
        });

        let elapsed = now.duration_since(bucket.last_update).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.max_tokens);
        bucket.last_update = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return (true, None);
        }

        let secs = (1.0 - bucket.tokens) / self.refill_per_sec;
        (false, Some(Duration::from_secs_f64(secs.max(0.0))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_requires_membership() {
        let allowed: HashSet<i64> = [10, 20].into_iter().collect();
        assert!(is_allowed_user(Some(UserId(10)), &allowed));
        assert!(!is_allowed_user(Some(UserId(30)), &allowed));
        assert!(!is_allowed_user(None, &allowed));
        assert!(!is_allowed_user(Some(UserId(10)), &HashSet::new()));
    }

    #[test]
    fn authenticator_accepts_only_exact_secret() {
        let auth = Authenticator::new("hunter2".to_string());
        assert_eq!(auth.try_authenticate("hunter2"), AuthResult::Success);
        assert_eq!(auth.try_authenticate("hunter3"), AuthResult::WrongSecret);
        assert_eq!(auth.try_authenticate("hunter22"), AuthResult::WrongSecret);
        assert_eq!(auth.try_authenticate(""), AuthResult::WrongSecret);
    }

    #[test]
    fn throttle_basic_refill() {
        let start = Instant::now();
        let mut th = AuthThrottle::new(true, 2, Duration::from_secs(10));
        let u = UserId(1);

        assert!(th.check_at(u, start).0);
        assert!(th.check_at(u, start).0);
        assert!(!th.check_at(u, start).0);

        // After 5 seconds one token has refilled (2 tokens / 10s).
        let (ok, _) = th.check_at(u, start + Duration::from_secs(5));
        assert!(ok);
    }

    #[test]
    fn throttle_disabled_always_allows() {
        let start = Instant::now();
        let mut th = AuthThrottle::new(false, 1, Duration::from_secs(60));
        let u = UserId(1);
        for _ in 0..10 {
            assert!(th.check_at(u, start).0);
        }
    }

    #[test]
    fn throttle_is_per_identity() {
        let start = Instant::now();
        let mut th = AuthThrottle::new(true, 1, Duration::from_secs(60));
        assert!(th.check_at(UserId(1), start).0);
        assert!(!th.check_at(UserId(1), start).0);
        // A different identity has its own bucket.
        assert!(th.check_at(UserId(2), start).0);
    }
}
