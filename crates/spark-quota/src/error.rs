//! Stable error taxonomy for the admission core.
//!
//! Mirrors the layering in `spark-core::error`: construction-time and
//! admission-time failures are returned synchronously to the caller, while
//! failures that occur once a job is already queued or running are
//! delivered through the reservation ticket instead of a `Result` the
//! caller can `?`-propagate, since by that point the caller has already
//! moved on to awaiting the ticket.

use std::fmt;

/// Failure constructing a [`crate::MultiRateLimit`] or a [`crate::RateLimit`].
///
/// All variants are synchronous — callers see them immediately, never via a
/// ticket.
#[derive(Debug, thiserror::Error)]
pub enum ConstructionError {
    #[error("rate limit resource_limit={resource_limit} period_seconds={period_seconds} must both be positive")]
    InvalidRateLimit {
        resource_limit: u64,
        period_seconds: f64,
    },
    #[error("limit matrix must declare at least one resource dimension")]
    EmptyMatrix,
    #[error("dimension {dimension} declares no rate limits")]
    EmptyDimension { dimension: usize },
    #[error("max_concurrent must be at least 1")]
    ZeroConcurrency,
    #[cfg(feature = "persistence")]
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// [`MultiRateLimit::reserve`](crate::MultiRateLimit::reserve) fails either
/// because the request itself is inadmissible, or because the instance has
/// already been told to shut down.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReserveError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Terminated(#[from] AfterTerminationError),
}

/// Failure admitting a freshly `reserve`d job into the queue.
///
/// Also synchronous: an un-runnable request (one that could never fit
/// under some limit no matter how empty the system is) is rejected before
/// it ever touches [`crate::queue::NextQueue`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdmissionError {
    #[error("usage vector has length {actual}, expected {expected}")]
    WrongLength { expected: usize, actual: usize },
    #[error("usage[{dimension}]={requested} exceeds the smallest configured limit ({limit}) for that dimension and could never be admitted")]
    Unrunnable {
        dimension: usize,
        requested: u64,
        limit: u64,
    },
}

/// A validation failure in a job's retroactive usage adjustment
/// (`ResourceOverwriteError`'s `use_resources`, or a successful job's
/// `adjustment`).
///
/// Unlike [`AdmissionError`] this is discovered only after a job has
/// already run, so it can never be returned synchronously — it is
/// delivered through [`crate::TicketOutcome::InvalidAdjustment`], and the
/// ledger is charged the job's *original* requested usage instead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdjustmentError {
    #[error("adjustment usage vector has length {actual}, expected {expected}")]
    WrongLength { expected: usize, actual: usize },
}

/// Raised by every operation on a [`crate::MultiRateLimit`] after
/// [`crate::MultiRateLimit::term`] has completed.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("operation attempted after MultiRateLimit::term()")]
pub struct AfterTerminationError;

/// The coordinator loop detected its own arithmetic contradicting itself.
///
/// This should never happen in a correct implementation; it exists so a
/// latent bug fails loudly (every queued and in-flight ticket is resolved
/// with this error and the instance is torn down) rather than spinning or
/// silently violating a rate limit.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InternalInvariantError {
    #[error(
        "predicted admission delay was non-positive ({delay_seconds}s) although the past-margin check still blocked dimension {dimension}"
    )]
    NonPositiveDelay { dimension: usize, delay_seconds: f64 },
    #[error("current buffer reported full with no empty slot found during a linear scan")]
    BufferOverrun,
    #[error("a running job task panicked: {reason}")]
    JobPanicked { reason: String },
}

/// Failures loading or persisting the file-backed [`crate::ledger::PastLedger`].
#[cfg(feature = "persistence")]
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed ledger record at {path} line {line}: {raw:?}")]
    MalformedRecord {
        path: std::path::PathBuf,
        line: usize,
        raw: String,
    },
}

/// A job may fail in two ways: a plain domain error (`Other`), or a
/// [`ResourceOverwriteError`][overwrite]-equivalent that both fails the
/// ticket with `cause` *and* tells the ledger to charge a different
/// (time, usage) pair than what was originally reserved.
///
/// [overwrite]: https://docs.rs/ (conceptual; see spec.md §4.3)
#[derive(Debug)]
pub enum JobFailure<E> {
    /// Amend the ledger with `(at, usage)` and fail the ticket with `cause`.
    Overwrite {
        at: f64,
        usage: Vec<u64>,
        cause: E,
    },
    /// Fail the ticket with `cause`; charge the originally reserved usage.
    Other(E),
}

impl<E: fmt::Display> fmt::Display for JobFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFailure::Overwrite { cause, .. } => write!(f, "job failed with resource overwrite: {cause}"),
            JobFailure::Other(cause) => write!(f, "job failed: {cause}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for JobFailure<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JobFailure::Overwrite { cause, .. } => Some(cause),
            JobFailure::Other(cause) => Some(cause),
        }
    }
}

/// The terminal resolution of a [`crate::ReservationTicket`].
///
/// Exactly one variant is ever sent on a ticket's channel — see the
/// "at-most-one resolution" invariant in spec.md §8.
#[derive(Debug)]
pub enum TicketOutcome<T, E> {
    /// The job ran to completion and returned `T`.
    Completed(T),
    /// The job failed with the domain error `E` (possibly alongside a
    /// ledger amendment, which is invisible to the caller).
    Failed(E),
    /// The job ran, but its retroactive usage adjustment failed
    /// validation; the ledger was charged the original request instead.
    InvalidAdjustment(AdjustmentError),
    /// The reservation was cancelled before it started, or the instance
    /// was terminated while the reservation was still pending.
    Cancelled,
    /// The coordinator detected an internal contradiction; see
    /// [`InternalInvariantError`].
    Internal(InternalInvariantError),
}
