//! Identity-aware fixed-window rate limiting.
//!
//! Buckets are keyed by verified subject when one exists, otherwise by
//! network origin — a caller cannot dodge its own bucket by switching
//! source addresses once authenticated. Each bucket is a count plus a
//! window start; the check-and-increment is one critical section so the
//! configured maximum is never exceeded under concurrent bursts.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::auth::Principal;

/// Time source, injectable for tests.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;
}

/// Wall-clock backed [`Clock`].
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Bucket key: subject takes priority over origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateKey {
    /// Verified subject of an authenticated principal.
    Subject(String),
    /// Network origin, for unauthenticated callers.
    Origin(IpAddr),
}

impl RateKey {
    /// Derive the bucket key for a request.
    #[must_use]
    pub fn derive(principal: &Principal, origin: IpAddr) -> Self {
        match &principal.subject {
            Some(subject) => Self::Subject(subject.clone()),
            None => Self::Origin(origin),
        }
    }

    /// Key kind label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Subject(_) => "subject",
            Self::Origin(_) => "origin",
        }
    }
}

impl std::fmt::Display for RateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subject(s) => write!(f, "subject:{s}"),
            Self::Origin(ip) => write!(f, "origin:{ip}"),
        }
    }
}

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Request admitted; `remaining` slots left in the current window.
    Allowed {
        /// Requests left in this window.
        remaining: u32,
    },
    /// Request rejected; retry after the current window resets.
    Limited {
        /// Time until the window resets. Always positive, never more than
        /// the window length.
        retry_after: Duration,
    },
}

struct Bucket {
    window_start: Instant,
    count: u32,
}

/// One fixed-window limiter class (e.g. `general`, `heavy`).
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    buckets: DashMap<RateKey, Mutex<Bucket>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter with the system clock.
    #[must_use]
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self::with_clock(window, max_requests, Arc::new(SystemClock))
    }

    /// Create a limiter with an injected clock.
    #[must_use]
    pub fn with_clock(window: Duration, max_requests: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            window,
            max_requests,
            buckets: DashMap::new(),
            clock,
        }
    }

    /// Check and count one request against `key`.
    ///
    /// A bucket whose window has elapsed is reset before counting, so the
    /// first request of a new window always succeeds.
    pub fn check(&self, key: &RateKey) -> Decision {
        let now = self.clock.now();
        let entry = self.buckets.entry(key.clone()).or_insert_with(|| {
            Mutex::new(Bucket {
                window_start: now,
                count: 0,
            })
        });

        let mut bucket = entry.lock();
        if now.duration_since(bucket.window_start) >= self.window {
            bucket.window_start = now;
            bucket.count = 0;
        }

        if bucket.count < self.max_requests {
            bucket.count += 1;
            Decision::Allowed {
                remaining: self.max_requests - bucket.count,
            }
        } else {
            Decision::Limited {
                retry_after: self.window - now.duration_since(bucket.window_start),
            }
        }
    }

    /// Drop buckets idle for more than one full window past expiry.
    /// Called periodically so abandoned keys do not accumulate.
    pub fn purge_idle(&self) {
        let now = self.clock.now();
        let horizon = self.window * 2;
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.lock().window_start) < horizon);
    }

    /// Current number of live buckets.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// `Retry-After` header value in whole seconds, rounded up and at least 1.
#[must_use]
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 || secs == 0 {
        secs + 1
    } else {
        secs
    }
}
