//! `MultiRateLimit` — the public coordinator tying the ledger, buffer, and
//! queue together into one admission-controlled scheduler.
//!
//! The coordinator runs its dispatch loop (`run`, below) as a single
//! background task over state guarded by a [`parking_lot::Mutex`], giving
//! the same cooperative single-writer semantics the reference design
//! assumes even though the surrounding runtime is multi-threaded. Public
//! methods that mutate state (`reserve`, `cancel`, `term`) never hold the
//! lock across an `.await`; they take it, mutate, drop it, then poke a
//! [`tokio::sync::Notify`] so the background task re-evaluates immediately
//! instead of sleeping out a now-stale timer — the "cancel a stale wait,
//! start a fresh one" idiom expressed without literally aborting a task.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

use crate::buffer::{CurrentBuffer, JobReturn};
use crate::clock::{Clock, SystemClock};
use crate::error::{
    AdmissionError, AfterTerminationError, ConstructionError, InternalInvariantError, JobFailure, ReserveError,
    TicketOutcome,
};
use crate::ledger::PastLedger;
use crate::limit::{self, RateLimit};
use crate::queue::{NextQueue, TicketId};
use crate::stats::RateLimitStats;
use crate::usage;

type Job<T, E> = BoxFuture<'static, Result<JobReturn<T>, JobFailure<E>>>;
type JobOutcome<T, E> = Result<Result<JobReturn<T>, JobFailure<E>>, tokio::task::JoinError>;

struct State<T, E> {
    buffer: CurrentBuffer<T, E>,
    queue: NextQueue<T, E>,
    ledger: PastLedger,
    terminate_requested: bool,
    terminated: bool,
}

struct Shared<T, E> {
    clock: Arc<dyn Clock>,
    limits: Vec<Vec<RateLimit>>,
    state: Mutex<State<T, E>>,
    wake: Notify,
    terminated_notify: Notify,
}

/// A multi-dimensional, multi-window admission controller for async jobs.
///
/// Cloning shares the same underlying coordinator and background task.
pub struct MultiRateLimit<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for MultiRateLimit<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, E> MultiRateLimit<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Construct a coordinator for `limits` (one `Vec<RateLimit>` per
    /// resource dimension) admitting at most `max_concurrent` jobs at once,
    /// with an in-memory (non-persisted) past ledger and the system clock.
    pub fn new(limits: Vec<Vec<RateLimit>>, max_concurrent: usize) -> Result<Self, ConstructionError> {
        Self::with_clock(limits, max_concurrent, Arc::new(SystemClock::new()))
    }

    /// As [`Self::new`], with an injectable [`Clock`] — used by tests to
    /// drive the coordinator under Tokio's paused/virtual time.
    pub fn with_clock(
        limits: Vec<Vec<RateLimit>>,
        max_concurrent: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConstructionError> {
        let (dims, w_max) = limit::validate_matrix(&limits)?;
        if max_concurrent == 0 {
            return Err(ConstructionError::ZeroConcurrency);
        }
        let ledger = PastLedger::new(dims, w_max);
        Self::build(limits, max_concurrent, clock, ledger)
    }

    /// As [`Self::new`], but the past ledger is replayed from (and
    /// subsequently appended to) a file at `path`.
    #[cfg(feature = "persistence")]
    pub fn with_persistence(
        limits: Vec<Vec<RateLimit>>,
        max_concurrent: usize,
        path: impl Into<std::path::PathBuf>,
    ) -> Result<Self, ConstructionError> {
        let (dims, w_max) = limit::validate_matrix(&limits)?;
        if max_concurrent == 0 {
            return Err(ConstructionError::ZeroConcurrency);
        }
        let ledger = PastLedger::open_file(dims, w_max, path)?;
        Self::build(limits, max_concurrent, Arc::new(SystemClock::new()), ledger)
    }

    fn build(
        limits: Vec<Vec<RateLimit>>,
        max_concurrent: usize,
        clock: Arc<dyn Clock>,
        ledger: PastLedger,
    ) -> Result<Self, ConstructionError> {
        let dims = limits.len();
        let state = State {
            buffer: CurrentBuffer::new(max_concurrent, dims),
            queue: NextQueue::new(),
            ledger,
            terminate_requested: false,
            terminated: false,
        };
        let shared = Arc::new(Shared {
            clock,
            limits,
            state: Mutex::new(state),
            wake: Notify::new(),
            terminated_notify: Notify::new(),
        });
        tokio::spawn(run(Arc::clone(&shared)));
        Ok(Self { shared })
    }

    /// Admit `usage` for a job that will be run by polling `job`.
    ///
    /// Succeeds or fails immediately: an un-runnable request (one that
    /// could never be admitted under some limit no matter how idle the
    /// system is) is rejected here, before it ever reaches the queue.
    pub fn reserve(&self, usage: Vec<u64>, job: Job<T, E>) -> Result<ReservationTicket<T, E>, ReserveError> {
        usage::check_length(&usage, self.shared.limits.len()).map_err(ReserveError::Admission)?;
        for (dimension, per_dim) in self.shared.limits.iter().enumerate() {
            let smallest = limit::smallest_limit(per_dim);
            if usage[dimension] > smallest {
                return Err(ReserveError::Admission(AdmissionError::Unrunnable {
                    dimension,
                    requested: usage[dimension],
                    limit: smallest,
                }));
            }
        }

        let (tx, rx) = oneshot::channel();
        let ticket_id = {
            let mut state = self.shared.state.lock();
            if state.terminated || state.terminate_requested {
                return Err(ReserveError::Terminated(AfterTerminationError));
            }
            state.queue.push(usage, job, tx)
        };
        self.shared.wake.notify_one();
        Ok(ReservationTicket {
            ticket_id: Some(ticket_id),
            receiver: rx,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Cancel a still-queued reservation. Returns `false` if it had already
    /// been dispatched, cancelled, or resolved.
    pub fn cancel(&self, ticket_id: TicketId) -> Result<bool, AfterTerminationError> {
        cancel_ticket(&self.shared, ticket_id)
    }

    /// A point-in-time usage snapshot across every resource dimension.
    pub async fn stats(&self) -> Result<RateLimitStats, AfterTerminationError> {
        let state = self.shared.state.lock();
        if state.terminated {
            return Err(AfterTerminationError);
        }
        let now = self.shared.clock.now();
        let dims = self.shared.limits.len();
        let queued = state.queue.sum(dims);
        let past_uses = self
            .shared
            .limits
            .iter()
            .enumerate()
            .map(|(d, per_dim)| {
                per_dim
                    .iter()
                    .map(|l| state.ledger.sum_after(now - l.period_seconds(), d))
                    .collect()
            })
            .collect();
        let current_uses = (0..dims).map(|d| state.buffer.sum(d)).collect();
        Ok(RateLimitStats {
            limits: self.shared.limits.clone(),
            past_uses,
            current_uses,
            next_uses: queued,
        })
    }

    /// Cancel every still-queued reservation, wait for every running job to
    /// retire, flush the past ledger, and mark the instance terminated.
    /// Idempotent: calling `term` more than once is a no-op after the
    /// first call completes.
    pub async fn term(&self) {
        let already_terminated = {
            let mut state = self.shared.state.lock();
            if state.terminated {
                true
            } else {
                state.terminate_requested = true;
                false
            }
        };
        if already_terminated {
            return;
        }
        self.shared.wake.notify_one();
        loop {
            // Register before checking state: `notify_waiters()` only wakes
            // waiters already polled at least once, so an unregistered
            // `Notified` created after the check but before its first poll
            // could otherwise miss a wakeup delivered in that gap.
            let notified = self.shared.terminated_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.shared.state.lock();
                if state.terminated {
                    break;
                }
            }
            notified.await;
        }
        let mut state = self.shared.state.lock();
        state.ledger.term();
    }
}

/// A handle to a reservation's eventual resolution.
pub struct ReservationTicket<T, E> {
    ticket_id: Option<TicketId>,
    receiver: oneshot::Receiver<TicketOutcome<T, E>>,
    shared: Arc<Shared<T, E>>,
}

impl<T, E> std::fmt::Debug for ReservationTicket<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationTicket").field("ticket_id", &self.ticket_id).finish()
    }
}

impl<T, E> ReservationTicket<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Wait for this reservation's terminal outcome.
    pub async fn wait(self) -> TicketOutcome<T, E> {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => TicketOutcome::Internal(InternalInvariantError::JobPanicked {
                reason: "coordinator task terminated without resolving this ticket".to_string(),
            }),
        }
    }

    /// Cancel this reservation if it is still queued.
    pub fn cancel(&mut self) -> Result<bool, AfterTerminationError> {
        let ticket_id = self.ticket_id.take().expect("cancel called twice on the same ticket");
        cancel_ticket(&self.shared, ticket_id)
    }
}

fn cancel_ticket<T, E>(shared: &Arc<Shared<T, E>>, ticket_id: TicketId) -> Result<bool, AfterTerminationError> {
    let cancelled = {
        let mut state = shared.state.lock();
        if state.terminated {
            return Err(AfterTerminationError);
        }
        state.queue.cancel(ticket_id)
    };
    match cancelled {
        Some((was_head, responder)) => {
            let _ = responder.send(TicketOutcome::Cancelled);
            if was_head {
                shared.wake.notify_one();
            }
            Ok(true)
        }
        None => Ok(false),
    }
}

enum DispatchDecision {
    Dispatch,
    WaitUntil(usize, f64),
    WaitForBufferOrEvent,
}

fn evaluate_head<T, E>(state: &State<T, E>, clock: &dyn Clock, limits: &[Vec<RateLimit>]) -> Option<DispatchDecision> {
    let (_, usage) = state.queue.peek()?;
    if state.buffer.is_full() {
        return Some(DispatchDecision::WaitForBufferOrEvent);
    }
    let now = clock.now();
    let mut buffer_blocked = false;
    let mut worst: Option<(usize, f64)> = None;
    for (dimension, per_dim) in limits.iter().enumerate() {
        let requested = usage[dimension];
        let in_flight = state.buffer.sum(dimension);
        for rate_limit in per_dim {
            let margin = rate_limit.resource_limit() as i128 - in_flight as i128 - requested as i128;
            if margin < 0 {
                buffer_blocked = true;
                continue;
            }
            let margin = margin as u64;
            let window_start = now - rate_limit.period_seconds();
            let past_usage = state.ledger.sum_after(window_start, dimension);
            if past_usage > margin {
                let wait_until = rate_limit.period_seconds() + state.ledger.time_within(dimension, margin);
                worst = Some(match worst {
                    Some((d, w)) if w >= wait_until => (d, w),
                    _ => (dimension, wait_until),
                });
            }
        }
    }
    if buffer_blocked {
        return Some(DispatchDecision::WaitForBufferOrEvent);
    }
    Some(match worst {
        Some((dimension, wait_until)) => DispatchDecision::WaitUntil(dimension, wait_until),
        None => DispatchDecision::Dispatch,
    })
}

async fn run<T, E>(shared: Arc<Shared<T, E>>)
where
    T: Send + 'static,
    E: Send + 'static,
{
    let mut running: FuturesUnordered<BoxFuture<'static, (tokio::task::Id, JobOutcome<T, E>)>> = FuturesUnordered::new();

    loop {
        let mut pending_internal_failure = None;
        let wait_branch = {
            let mut state = shared.state.lock();

            if state.terminate_requested {
                while let Some((_ticket, entry)) = state.queue.pop() {
                    let _ = entry.responder.send(TicketOutcome::Cancelled);
                }
                if state.buffer.is_empty() {
                    state.terminated = true;
                }
            }
            if state.terminated {
                drop(state);
                shared.terminated_notify.notify_waiters();
                return;
            }

            loop {
                match evaluate_head(&state, shared.clock.as_ref(), &shared.limits) {
                    None => break WaitBranch::Idle,
                    Some(DispatchDecision::WaitForBufferOrEvent) => break WaitBranch::Idle,
                    Some(DispatchDecision::WaitUntil(dimension, wait_until)) => {
                        let now = shared.clock.now();
                        let delay = wait_until - now;
                        if delay <= 0.0 {
                            pending_internal_failure = Some(InternalInvariantError::NonPositiveDelay {
                                dimension,
                                delay_seconds: delay,
                            });
                            break WaitBranch::Idle;
                        }
                        break WaitBranch::Sleep(delay);
                    }
                    Some(DispatchDecision::Dispatch) => {
                        let (_ticket_id, entry) =
                            state.queue.pop().expect("evaluate_head confirmed a dispatchable head");
                        let handle = tokio::spawn(entry.job);
                        let task_id = handle.id();
                        state
                            .buffer
                            .start(task_id, entry.usage, entry.responder)
                            .expect("evaluate_head confirmed the buffer has room");
                        running.push(Box::pin(async move { (task_id, handle.await) }));
                        // keep looping: more slots or more admissible heads may remain
                    }
                }
            }
        };

        if let Some(err) = pending_internal_failure {
            fail_everything(&shared, err);
            continue;
        }

        match wait_branch {
            WaitBranch::Idle => {
                if running.is_empty() {
                    shared.wake.notified().await;
                } else {
                    tokio::select! {
                        Some((task_id, result)) = running.next() => retire(&shared, task_id, result).await,
                        _ = shared.wake.notified() => {}
                    }
                }
            }
            WaitBranch::Sleep(delay) => {
                let sleep = shared.clock.sleep(Duration::from_secs_f64(delay));
                if running.is_empty() {
                    tokio::select! {
                        _ = sleep => {}
                        _ = shared.wake.notified() => {}
                    }
                } else {
                    tokio::select! {
                        Some((task_id, result)) = running.next() => retire(&shared, task_id, result).await,
                        _ = sleep => {}
                        _ = shared.wake.notified() => {}
                    }
                }
            }
        }
    }
}

enum WaitBranch {
    Idle,
    Sleep(f64),
}

async fn retire<T, E>(shared: &Arc<Shared<T, E>>, task_id: tokio::task::Id, result: JobOutcome<T, E>) {
    let now = shared.clock.now();
    let retirement = {
        let mut state = shared.state.lock();
        let mut retirement = match result {
            Ok(job_result) => state.buffer.end(task_id, now, job_result),
            Err(join_err) => state.buffer.end_panicked(task_id, now, panic_reason(join_err)),
        };
        state.ledger.add(retirement.charge_at, std::mem::take(&mut retirement.charge_usage));
        retirement
    };
    let _ = retirement.responder.send(retirement.outcome);
}

fn panic_reason(err: tokio::task::JoinError) -> String {
    if err.is_cancelled() {
        return "job task was cancelled before completion".to_string();
    }
    match err.try_into_panic() {
        Ok(payload) => {
            if let Some(message) = payload.downcast_ref::<&str>() {
                message.to_string()
            } else if let Some(message) = payload.downcast_ref::<String>() {
                message.clone()
            } else {
                "job panicked with a non-string payload".to_string()
            }
        }
        Err(_) => "job task failed to join for an unknown reason".to_string(),
    }
}

fn fail_everything<T, E>(shared: &Arc<Shared<T, E>>, err: InternalInvariantError) {
    tracing::warn!(error = %err, "internal invariant violated; tearing down coordinator");
    let mut state = shared.state.lock();
    while let Some((_ticket, entry)) = state.queue.pop() {
        let _ = entry.responder.send(TicketOutcome::Internal(err.clone()));
    }
    state.terminate_requested = true;
}
