//! `NextQueue` — the strict-FIFO set of admitted-but-not-yet-dispatched
//! jobs.
//!
//! Only the head is ever inspected by the coordinator's dispatch loop: an
//! eligible-but-younger entry is never allowed to jump ahead of an
//! ineligible older one, so no priority reordering by projected run time
//! is needed — a `BTreeMap` keyed on insertion sequence gives `O(log n)`
//! `peek`/`pop` of the oldest entry and `O(log n)` cancellation of an
//! arbitrary ticket, replacing the original's parallel list-plus-lookup
//! with one structure.

use std::collections::{BTreeMap, HashMap};

use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::error::{JobFailure, TicketOutcome};

use super::buffer::JobReturn;

/// Opaque handle returned by [`NextQueue::push`], used later to [`NextQueue::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TicketId(u64);

pub(crate) struct Entry<T, E> {
    pub ticket: TicketId,
    pub usage: Vec<u64>,
    pub job: BoxFuture<'static, Result<JobReturn<T>, JobFailure<E>>>,
    pub responder: oneshot::Sender<TicketOutcome<T, E>>,
}

pub(crate) struct NextQueue<T, E> {
    entries: BTreeMap<u64, Entry<T, E>>,
    seq_by_ticket: HashMap<TicketId, u64>,
    next_insertion_seq: u64,
    next_ticket: u64,
}

impl<T, E> NextQueue<T, E> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            seq_by_ticket: HashMap::new(),
            next_insertion_seq: 0,
            next_ticket: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total usage reserved by every entry still waiting in the queue, by
    /// dimension — the `next` term in [`crate::stats::RateLimitStats`].
    pub fn sum(&self, dims: usize) -> Vec<u64> {
        let mut total = vec![0u64; dims];
        for entry in self.entries.values() {
            for (t, u) in total.iter_mut().zip(entry.usage.iter()) {
                *t += u;
            }
        }
        total
    }

    /// Admit a job at the back of the queue.
    pub fn push(
        &mut self,
        usage: Vec<u64>,
        job: BoxFuture<'static, Result<JobReturn<T>, JobFailure<E>>>,
        responder: oneshot::Sender<TicketOutcome<T, E>>,
    ) -> TicketId {
        let seq = self.next_insertion_seq;
        self.next_insertion_seq += 1;
        let ticket = TicketId(self.next_ticket);
        self.next_ticket += 1;
        self.entries.insert(
            seq,
            Entry {
                ticket,
                usage,
                job,
                responder,
            },
        );
        self.seq_by_ticket.insert(ticket, seq);
        ticket
    }

    /// The head entry's `(ticket, usage)`, without removing it.
    pub fn peek(&self) -> Option<(TicketId, &[u64])> {
        let (_, entry) = self.entries.iter().next()?;
        Some((entry.ticket, entry.usage.as_slice()))
    }

    /// Remove and return the head entry.
    pub fn pop(&mut self) -> Option<(TicketId, Entry<T, E>)> {
        let (&seq, _) = self.entries.iter().next()?;
        let entry = self.entries.remove(&seq).expect("key just observed present");
        self.seq_by_ticket.remove(&entry.ticket);
        Some((entry.ticket, entry))
    }

    /// Remove `ticket` from anywhere in the queue.
    ///
    /// Returns `None` if the ticket is not (or no longer) queued. Otherwise
    /// returns the freed responder and whether this entry was the current
    /// head — the coordinator only needs to recompute its wake-up when the
    /// cancelled entry *was* the head.
    pub fn cancel(&mut self, ticket: TicketId) -> Option<(bool, oneshot::Sender<TicketOutcome<T, E>>)> {
        let seq = self.seq_by_ticket.remove(&ticket)?;
        let was_head = self.entries.keys().next() == Some(&seq);
        let entry = self.entries.remove(&seq).expect("ticket and entry tables stay in sync");
        Some((was_head, entry.responder))
    }
}

impl<T, E> Default for NextQueue<T, E> {
    fn default() -> Self {
        Self::new()
    }
}
