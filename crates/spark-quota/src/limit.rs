//! `RateLimit` — a single (amount, window) budget, and the `LimitMatrix`
//! that groups several of them per resource dimension.

use crate::error::ConstructionError;

/// An immutable `(resource_limit, period_seconds)` pair: at most
/// `resource_limit` units of usage may be charged in any sliding window of
/// `period_seconds`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    resource_limit: u64,
    period_seconds: f64,
}

impl RateLimit {
    /// Construct a limit, rejecting non-positive limits or periods.
    pub fn new(resource_limit: u64, period_seconds: f64) -> Result<Self, ConstructionError> {
        if resource_limit == 0 || !(period_seconds > 0.0) {
            return Err(ConstructionError::InvalidRateLimit {
                resource_limit,
                period_seconds,
            });
        }
        Ok(Self {
            resource_limit,
            period_seconds,
        })
    }

    /// Out-of-scope convenience constructors, supplemented from the
    /// original `SecondRateLimit`/`MinuteRateLimit`/`HourRateLimit`/
    /// `DayRateLimit` subclasses — trivial one-line wrappers, carrying no
    /// independent validation.
    pub fn per_second(resource_limit: u64) -> Result<Self, ConstructionError> {
        Self::new(resource_limit, 1.0)
    }

    pub fn per_minute(resource_limit: u64) -> Result<Self, ConstructionError> {
        Self::new(resource_limit, 60.0)
    }

    pub fn per_hour(resource_limit: u64) -> Result<Self, ConstructionError> {
        Self::new(resource_limit, 3600.0)
    }

    pub fn per_day(resource_limit: u64) -> Result<Self, ConstructionError> {
        Self::new(resource_limit, 86400.0)
    }

    pub fn resource_limit(&self) -> u64 {
        self.resource_limit
    }

    pub fn period_seconds(&self) -> f64 {
        self.period_seconds
    }
}

/// Validate a `limits` matrix (one `Vec<RateLimit>` per resource
/// dimension) and compute `W_max`, the longest period across every limit.
///
/// Returns `(dimension_count, w_max)`.
pub(crate) fn validate_matrix(limits: &[Vec<RateLimit>]) -> Result<(usize, f64), ConstructionError> {
    if limits.is_empty() {
        return Err(ConstructionError::EmptyMatrix);
    }
    let mut w_max = 0.0_f64;
    for (dimension, per_dim) in limits.iter().enumerate() {
        if per_dim.is_empty() {
            return Err(ConstructionError::EmptyDimension { dimension });
        }
        for limit in per_dim {
            w_max = w_max.max(limit.period_seconds());
        }
    }
    Ok((limits.len(), w_max))
}

/// The smallest `resource_limit` among all limits configured for a
/// dimension — the admission-time "could this job ever run" cap from
/// spec.md §4.5 step 2.
pub(crate) fn smallest_limit(per_dim: &[RateLimit]) -> u64 {
    per_dim
        .iter()
        .map(RateLimit::resource_limit)
        .min()
        .expect("validated dimensions are never empty")
}
