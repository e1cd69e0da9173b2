//! `RateLimitStats` — a point-in-time usage snapshot, grounded on the
//! original's `RateLimitStats`/`test_rate_limit_stats`: one past-usage
//! figure *per configured limit* (each against that limit's own sliding
//! window), plus a single current/next figure per dimension shared by every
//! limit in that dimension — current and queued usage have no per-window
//! distinction, only the past ledger does.

use crate::limit::RateLimit;

/// A snapshot across every resource dimension, returned by
/// [`crate::MultiRateLimit::stats`].
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitStats {
    /// The configured limit matrix, one `Vec<RateLimit>` per dimension.
    pub limits: Vec<Vec<RateLimit>>,
    /// Past usage, per dimension, per limit within that dimension — each
    /// figure computed against its own limit's sliding window.
    pub past_uses: Vec<Vec<u64>>,
    /// In-flight usage, per dimension.
    pub current_uses: Vec<u64>,
    /// Queued-but-not-dispatched usage, per dimension.
    pub next_uses: Vec<u64>,
}

impl RateLimitStats {
    /// `100 * past / limit.resource_limit`, per limit.
    pub fn past_use_percents(&self) -> Vec<Vec<f64>> {
        self.per_limit(|past, _current, _next, limit| past as f64 / limit.resource_limit() as f64)
    }

    /// `100 * (past + current) / limit.resource_limit`, per limit — the
    /// fraction of that limit's budget already spoken for by completed and
    /// in-flight work.
    pub fn current_use_percents(&self) -> Vec<Vec<f64>> {
        self.per_limit(|past, current, _next, limit| (past + current) as f64 / limit.resource_limit() as f64)
    }

    /// `100 * (past + current + next) / limit.resource_limit`, per limit —
    /// the fraction of that limit's budget spoken for once the whole queue
    /// drains.
    pub fn next_use_percents(&self) -> Vec<Vec<f64>> {
        self.per_limit(|past, current, next, limit| (past + current + next) as f64 / limit.resource_limit() as f64)
    }

    fn per_limit(&self, f: impl Fn(u64, u64, u64, &RateLimit) -> f64) -> Vec<Vec<f64>> {
        self.limits
            .iter()
            .enumerate()
            .map(|(d, per_dim)| {
                let past = &self.past_uses[d];
                let current = self.current_uses[d];
                let next = self.next_uses[d];
                per_dim
                    .iter()
                    .zip(past.iter())
                    .map(|(limit, &p)| 100.0 * f(p, current, next, limit))
                    .collect()
            })
            .collect()
    }
}
