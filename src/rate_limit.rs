//! Rate limits, both for calling upstream APIs and for protecting our own
//! endpoints from individual clients.

use std::{
    fmt,
    str::FromStr,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use leaky_bucket::RateLimiter;

use crate::prelude::*;

/// The period over which the rate limit is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitPeriod {
    /// Per second.
    Second,
    /// Per minute.
    Minute,
}

impl RateLimitPeriod {
    /// Convert this period to a [`Duration`].
    pub fn to_duration(self) -> Duration {
        match self {
            RateLimitPeriod::Second => Duration::from_secs(1),
            RateLimitPeriod::Minute => Duration::from_secs(60),
        }
    }
}

impl fmt::Display for RateLimitPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitPeriod::Second => write!(f, "s"),
            RateLimitPeriod::Minute => write!(f, "m"),
        }
    }
}

impl FromStr for RateLimitPeriod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "s" => Ok(RateLimitPeriod::Second),
            "m" => Ok(RateLimitPeriod::Minute),
            _ => Err(anyhow!("Unsupported rate limit period: {:?}", s)),
        }
    }
}

/// A rate limit, written as `"30/m"` or `"10/s"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimit {
    /// The maximum number of requests allowed in the period.
    pub max_requests: usize,
    /// The period over which the rate limit is applied.
    pub per_period: RateLimitPeriod,
}

impl RateLimit {
    /// Create a new [`RateLimit`].
    pub fn new(max_requests: usize, per_period: RateLimitPeriod) -> Self {
        Self {
            max_requests,
            per_period,
        }
    }

    /// Create a [`RateLimiter`] for throttling our own outbound calls.
    pub fn to_rate_limiter(&self) -> RateLimiter {
        // We refill the whole bucket once per period and start full, so a burst
        // right after startup may use the entire allowance at once.
        RateLimiter::builder()
            .initial(self.max_requests)
            .refill(self.max_requests)
            .max(self.max_requests)
            .interval(self.per_period.to_duration())
            .build()
    }
}

impl Default for RateLimit {
    /// 30 requests per minute, our default for the OCR endpoint.
    fn default() -> Self {
        Self::new(30, RateLimitPeriod::Minute)
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.max_requests, self.per_period)
    }
}

impl FromStr for RateLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |s: &str| -> Result<_> {
            let mut parts = s.splitn(2, '/');
            let max_requests = parts
                .next()
                .ok_or_else(|| anyhow!("Missing max requests"))?
                .parse::<usize>()?;
            let per_period = parts
                .next()
                .ok_or_else(|| anyhow!("Missing period"))?
                .parse::<RateLimitPeriod>()?;
            Ok(Self {
                max_requests,
                per_period,
            })
        };
        parse(s).with_context(|| format!("Failed to parse rate limit: {:?}", s))
    }
}

/// The outcome of checking a client against a [`ClientRateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The request may proceed.
    Allowed {
        /// Requests left in the current window.
        remaining: usize,
    },
    /// The client must wait before trying again.
    Limited {
        /// Time until the client's window resets.
        retry_after: Duration,
    },
}

impl RateDecision {
    /// Was the request allowed?
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// Per-client admission control for inbound requests.
///
/// The in-memory implementation only works for a single process. A
/// horizontally scaled deployment would implement this trait on top of
/// shared storage.
pub trait ClientRateLimiter: Send + Sync + 'static {
    /// Count one request from `client_id` and decide whether to admit it.
    fn check(&self, client_id: &str) -> RateDecision;
}

/// Counter state for one client.
#[derive(Debug, Clone, Copy)]
struct Window {
    /// Requests admitted since `reset_at - period`.
    count: usize,
    /// When this window expires.
    reset_at: Instant,
}

/// In-memory counters keyed by client, each with a reset timestamp.
///
/// Nothing is persisted, so all limits reset when the process restarts.
#[derive(Debug)]
pub struct InMemoryRateLimiter {
    limit: RateLimit,
    windows: DashMap<String, Window>,
}

/// Prune expired windows once the map grows beyond this many clients.
const PRUNE_THRESHOLD: usize = 10_000;

impl InMemoryRateLimiter {
    /// Create a limiter enforcing `limit` for every client.
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            windows: DashMap::new(),
        }
    }

    /// The configured limit.
    pub fn limit(&self) -> &RateLimit {
        &self.limit
    }

    /// Check a client at an explicit point in time.
    pub fn check_at(&self, client_id: &str, now: Instant) -> RateDecision {
        let period = self.limit.per_period.to_duration();
        if self.windows.len() > PRUNE_THRESHOLD {
            self.windows.retain(|_, window| window.reset_at > now);
        }

        // The entry guard locks this client's shard until we return.
        let mut window = self.windows.entry(client_id.to_owned()).or_insert(Window {
            count: 0,
            reset_at: now + period,
        });
        if now >= window.reset_at {
            window.count = 0;
            window.reset_at = now + period;
        }

        if window.count >= self.limit.max_requests {
            let retry_after = window.reset_at.saturating_duration_since(now);
            warn!(client_id, ?retry_after, "Rate limit exceeded");
            RateDecision::Limited { retry_after }
        } else {
            window.count += 1;
            let remaining = self.limit.max_requests - window.count;
            trace!(client_id, remaining, "Rate limit OK");
            RateDecision::Allowed { remaining }
        }
    }
}

impl ClientRateLimiter for InMemoryRateLimiter {
    fn check(&self, client_id: &str) -> RateDecision {
        self.check_at(client_id, Instant::now())
    }
}
