//! `CurrentBuffer` — the fixed-capacity set of jobs currently running.
//!
//! Each occupied slot remembers the usage it was charged with at `start`
//! (so it can be un-charged at `end` regardless of what the job reports
//! back) and the `oneshot` sender the waiting [`crate::ReservationTicket`]
//! is listening on. Slots are found by a round-robin scan rather than a
//! free-list, mirroring the original's `task.get_name()`-keyed slot
//! recovery hack with a typed `HashMap<tokio::task::Id, usize>` instead —
//! spec.md's own redesign note for this component.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::error::{AdjustmentError, InternalInvariantError, JobFailure, TicketOutcome};

/// What a job future resolves to: either success (with an optional
/// retroactive usage adjustment) or failure (ditto).
pub struct JobReturn<T> {
    pub value: T,
    /// `Some((at, usage))` overrides the usage charged to the past ledger;
    /// `None` charges the usage originally reserved at admission time.
    pub adjustment: Option<(f64, Vec<u64>)>,
}

struct Slot<T, E> {
    usage: Vec<u64>,
    responder: oneshot::Sender<TicketOutcome<T, E>>,
}

/// The outcome of retiring one finished slot: what to send on its ticket,
/// and the `(time, usage)` pair to charge to the past ledger.
pub(crate) struct Retirement<T, E> {
    pub responder: oneshot::Sender<TicketOutcome<T, E>>,
    pub outcome: TicketOutcome<T, E>,
    pub charge_at: f64,
    pub charge_usage: Vec<u64>,
}

pub(crate) struct CurrentBuffer<T, E> {
    dims: usize,
    slots: Vec<Option<Slot<T, E>>>,
    occupied: usize,
    sum_resources: Vec<u64>,
    task_slots: HashMap<tokio::task::Id, usize>,
    round_robin_cursor: usize,
}

impl<T, E> CurrentBuffer<T, E> {
    pub fn new(capacity: usize, dims: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            dims,
            slots,
            occupied: 0,
            sum_resources: vec![0u64; dims],
            task_slots: HashMap::new(),
            round_robin_cursor: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_full(&self) -> bool {
        self.occupied == self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Current in-flight usage, by dimension — the `B` term in the
    /// admission check `B[d] + usage[d] <= limit`.
    pub fn sum(&self, dimension: usize) -> u64 {
        self.sum_resources[dimension]
    }

    /// Claim an empty slot for `task_id`, charging `usage` against the
    /// in-flight sum immediately.
    pub fn start(
        &mut self,
        task_id: tokio::task::Id,
        usage: Vec<u64>,
        responder: oneshot::Sender<TicketOutcome<T, E>>,
    ) -> Result<usize, InternalInvariantError> {
        let len = self.slots.len();
        for step in 0..len {
            let idx = (self.round_robin_cursor + step) % len;
            if self.slots[idx].is_none() {
                for (sum, u) in self.sum_resources.iter_mut().zip(usage.iter()) {
                    *sum += u;
                }
                self.slots[idx] = Some(Slot { usage, responder });
                self.task_slots.insert(task_id, idx);
                self.round_robin_cursor = (idx + 1) % len;
                self.occupied += 1;
                return Ok(idx);
            }
        }
        Err(InternalInvariantError::BufferOverrun)
    }

    /// Retire the slot owned by `task_id` given how its job resolved.
    pub fn end(
        &mut self,
        task_id: tokio::task::Id,
        now: f64,
        result: Result<JobReturn<T>, JobFailure<E>>,
    ) -> Retirement<T, E> {
        let idx = self
            .task_slots
            .remove(&task_id)
            .expect("end() called for a task id not tracked by start()");
        let Slot { usage, responder } = self.slots[idx].take().expect("slot occupied by its own task id");
        self.occupied -= 1;
        for (sum, u) in self.sum_resources.iter_mut().zip(usage.iter()) {
            *sum = sum.saturating_sub(*u);
        }

        let (outcome, charge_at, charge_usage) = match result {
            Ok(JobReturn { value, adjustment: None }) => (TicketOutcome::Completed(value), now, usage),
            Ok(JobReturn {
                value,
                adjustment: Some((at, adjusted)),
            }) => match self.validate_adjustment(&adjusted) {
                Ok(()) => (TicketOutcome::Completed(value), at, adjusted),
                Err(err) => (TicketOutcome::InvalidAdjustment(err), now, usage),
            },
            Err(JobFailure::Other(cause)) => (TicketOutcome::Failed(cause), now, usage),
            Err(JobFailure::Overwrite { at, usage: adjusted, cause }) => match self.validate_adjustment(&adjusted) {
                Ok(()) => (TicketOutcome::Failed(cause), at, adjusted),
                Err(err) => (TicketOutcome::InvalidAdjustment(err), now, usage),
            },
        };

        Retirement {
            responder,
            outcome,
            charge_at,
            charge_usage,
        }
    }

    /// A job task panicked instead of resolving its future; still frees the
    /// slot and charges the originally reserved usage.
    pub fn end_panicked(&mut self, task_id: tokio::task::Id, now: f64, reason: String) -> Retirement<T, E> {
        let idx = self
            .task_slots
            .remove(&task_id)
            .expect("end_panicked() called for a task id not tracked by start()");
        let Slot { usage, responder } = self.slots[idx].take().expect("slot occupied by its own task id");
        self.occupied -= 1;
        for (sum, u) in self.sum_resources.iter_mut().zip(usage.iter()) {
            *sum = sum.saturating_sub(*u);
        }
        Retirement {
            responder,
            outcome: TicketOutcome::Internal(InternalInvariantError::JobPanicked { reason }),
            charge_at: now,
            charge_usage: usage,
        }
    }

    fn validate_adjustment(&self, usage: &[u64]) -> Result<(), AdjustmentError> {
        if usage.len() != self.dims {
            return Err(AdjustmentError::WrongLength {
                expected: self.dims,
                actual: usage.len(),
            });
        }
        Ok(())
    }
}

impl<T, E> CurrentBuffer<T, E> {
    pub fn is_tracking(&self, task_id: &tokio::task::Id) -> bool {
        self.task_slots.contains_key(task_id)
    }
}
