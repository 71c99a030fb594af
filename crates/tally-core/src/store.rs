//! Pre-sized result store shared by all in-flight exchanges.
//!
//! The store owns one slot per ticket, allocated once in [`ResultStore::reserve`]
//! before any worker starts. The slot table is never resized afterwards, so
//! concurrent workers can index into it without a map-wide lock.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ pending queue (crossbeam, unbounded): ticket ids to run  │
//! ├──────────────────────────────────────────────────────────┤
//! │ Slot[0]   (#1): state | attempts | digits | value        │
//! │ Slot[1]   (#2): state | attempts | digits | value        │
//! │ ...                                                      │
//! │ Slot[N-1] (#N)                                           │
//! ├──────────────────────────────────────────────────────────┤
//! │ done counter (atomic) + progress signal (watch)          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Ownership
//!
//! A ticket leaves the pending queue at most once per attempt, and the
//! Pending → InFlight flip is a compare-and-swap on the slot state. The
//! worker that wins the flip is the only writer of that slot's digit buffer
//! until it calls [`ResultStore::mark_done`] or [`ResultStore::mark_failed`].
//! The per-slot mutex is therefore never contended; it exists so the buffer
//! can be handed between worker threads safely.

use std::sync::{
    Mutex, MutexGuard, PoisonError,
    atomic::{AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering},
};

use crossbeam_channel::{Receiver, Sender};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::codec;
use crate::error::StoreError;
use crate::types::{ResultSet, Ticket, TicketId, TicketState};

struct Slot {
    state: AtomicU8,
    attempts: AtomicU32,
    digits: Mutex<Vec<u8>>,
    value: AtomicU64,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(TicketState::Pending as u8),
            attempts: AtomicU32::new(0),
            digits: Mutex::new(Vec::new()),
            value: AtomicU64::new(0),
        }
    }

    #[inline]
    fn state(&self) -> TicketState {
        TicketState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn digits(&self) -> MutexGuard<'_, Vec<u8>> {
        self.digits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically move `from` → `to`, reporting the observed state on failure.
    fn transition(&self, id: TicketId, from: TicketState, to: TicketState) -> Result<(), StoreError> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| StoreError::InvalidState {
                id,
                expected: from,
                actual: TicketState::from_u8(actual),
            })
    }
}

/// Per-ticket accumulators and lifecycle table for one run.
pub struct ResultStore {
    slots: Box<[Slot]>,
    pending_tx: Sender<TicketId>,
    pending_rx: Receiver<TicketId>,
    done: AtomicUsize,
    progress: watch::Sender<u64>,
}

impl ResultStore {
    /// Allocate `tickets` slots (ids `1..=tickets`), all `Pending` with empty
    /// accumulators, and queue every id for dispatch.
    pub fn reserve(tickets: u32) -> Self {
        let slots: Box<[Slot]> = (0..tickets).map(|_| Slot::new()).collect();
        let (pending_tx, pending_rx) = crossbeam_channel::unbounded();
        for id in 1..=tickets {
            // The receiver lives in `self`, so the channel cannot be disconnected.
            let _ = pending_tx.send(TicketId(id));
        }
        let (progress, _) = watch::channel(0);

        debug!("result store reserved for {tickets} ticket(s)");

        Self {
            slots,
            pending_tx,
            pending_rx,
            done: AtomicUsize::new(0),
            progress,
        }
    }

    /// Number of tickets this store was reserved for.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of tickets that reached `Done`.
    #[inline]
    pub fn done_count(&self) -> usize {
        self.done.load(Ordering::Acquire)
    }

    /// True iff every ticket is `Done`.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.done_count() == self.slots.len()
    }

    /// Current state of ticket `id`.
    pub fn state(&self, id: TicketId) -> Result<TicketState, StoreError> {
        Ok(self.slot(id)?.state())
    }

    /// Subscribe to the progress signal.
    ///
    /// The value is bumped on every `mark_done` and `mark_failed`, so a
    /// waiter wakes whenever a ticket finishes or becomes pending again.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.progress.subscribe()
    }

    /// Hand out the next `Pending` ticket and mark it `InFlight`.
    ///
    /// Returns `None` when nothing is pending (every remaining ticket is
    /// either in flight or done).
    pub fn take_next(&self) -> Option<Ticket> {
        while let Ok(id) = self.pending_rx.try_recv() {
            let Ok(slot) = self.slot(id) else {
                continue;
            };
            if slot.transition(id, TicketState::Pending, TicketState::InFlight).is_ok() {
                let attempt = slot.attempts.fetch_add(1, Ordering::Relaxed) + 1;
                trace!("ticket #{id} taken (attempt {attempt})");
                return Some(Ticket { id, attempt });
            }
        }
        None
    }

    /// Append accepted digit bytes to the accumulator of in-flight ticket `id`.
    pub fn record_bytes(&self, id: TicketId, bytes: &[u8]) -> Result<(), StoreError> {
        let slot = self.slot(id)?;
        Self::expect_in_flight(slot, id)?;
        slot.digits().extend_from_slice(bytes);
        Ok(())
    }

    /// Decode the accumulator of ticket `id`, mark it `Done` and return the value.
    ///
    /// On a decode error the ticket stays `InFlight`; the owner is expected
    /// to call [`Self::mark_failed`].
    pub fn mark_done(&self, id: TicketId) -> Result<u64, StoreError> {
        let slot = self.slot(id)?;
        Self::expect_in_flight(slot, id)?;

        let value = {
            let mut digits = slot.digits();
            let value = codec::decode_digits(&digits).map_err(|source| StoreError::Decode { id, source })?;
            *digits = Vec::new();
            value
        };

        slot.value.store(value, Ordering::Relaxed);
        slot.transition(id, TicketState::InFlight, TicketState::Done)?;
        self.done.fetch_add(1, Ordering::AcqRel);
        self.progress.send_modify(|generation| *generation += 1);
        Ok(value)
    }

    /// Discard the current attempt of ticket `id` and queue it again.
    pub fn mark_failed(&self, id: TicketId) -> Result<(), StoreError> {
        let slot = self.slot(id)?;
        slot.transition(id, TicketState::InFlight, TicketState::Failed)?;
        slot.digits().clear();
        slot.state.store(TicketState::Pending as u8, Ordering::Release);
        let _ = self.pending_tx.send(id);
        self.progress.send_modify(|generation| *generation += 1);
        Ok(())
    }

    /// Collect the decoded values. Only valid once [`Self::is_complete`] holds.
    pub fn snapshot(&self) -> Result<ResultSet, StoreError> {
        let done = self.done_count();
        if done != self.slots.len() {
            return Err(StoreError::Incomplete { done, total: self.slots.len() });
        }

        Ok(self
            .slots
            .iter()
            .enumerate()
            .map(|(idx, slot)| (TicketId(idx as u32 + 1), slot.value.load(Ordering::Relaxed)))
            .collect())
    }

    fn slot(&self, id: TicketId) -> Result<&Slot, StoreError> {
        id.index()
            .and_then(|idx| self.slots.get(idx))
            .ok_or(StoreError::UnknownTicket(id))
    }

    fn expect_in_flight(slot: &Slot, id: TicketId) -> Result<(), StoreError> {
        match slot.state() {
            TicketState::InFlight => Ok(()),
            actual => Err(StoreError::InvalidState {
                id,
                expected: TicketState::InFlight,
                actual,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;

    #[test]
    fn reserve_starts_all_pending() {
        let store = ResultStore::reserve(3);
        assert_eq!(store.len(), 3);
        assert_eq!(store.done_count(), 0);
        assert!(!store.is_complete());
        for id in 1..=3 {
            assert_eq!(store.state(TicketId(id)), Ok(TicketState::Pending));
        }
        assert_eq!(store.state(TicketId(0)), Err(StoreError::UnknownTicket(TicketId(0))));
        assert_eq!(store.state(TicketId(4)), Err(StoreError::UnknownTicket(TicketId(4))));
    }

    #[test]
    fn take_next_hands_out_each_ticket_once() {
        let store = ResultStore::reserve(3);
        let mut ids: Vec<u32> = std::iter::from_fn(|| store.take_next()).map(|t| t.id.0).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(store.take_next().is_none());
        assert_eq!(store.state(TicketId(2)), Ok(TicketState::InFlight));
    }

    #[test]
    fn done_ticket_is_terminal() {
        let store = ResultStore::reserve(1);
        let ticket = store.take_next().unwrap();
        store.record_bytes(ticket.id, b"4").unwrap();
        store.record_bytes(ticket.id, b"2").unwrap();
        assert_eq!(store.mark_done(ticket.id), Ok(42));
        assert!(store.is_complete());
        assert!(store.take_next().is_none());
        assert!(matches!(
            store.record_bytes(ticket.id, b"1"),
            Err(StoreError::InvalidState { actual: TicketState::Done, .. })
        ));
        assert!(store.mark_failed(ticket.id).is_err());
        assert_eq!(store.snapshot().unwrap().get(&TicketId(1)), Some(&42));
    }

    #[test]
    fn failed_attempt_leaves_no_residue() {
        let store = ResultStore::reserve(1);
        let first = store.take_next().unwrap();
        store.record_bytes(first.id, b"999").unwrap();
        store.mark_failed(first.id).unwrap();
        assert_eq!(store.state(first.id), Ok(TicketState::Pending));

        let retry = store.take_next().unwrap();
        assert_eq!(retry.id, first.id);
        assert_eq!(retry.attempt, 2);
        store.record_bytes(retry.id, b"7").unwrap();
        assert_eq!(store.mark_done(retry.id), Ok(7));
    }

    #[test]
    fn empty_accumulator_is_a_decode_error() {
        let store = ResultStore::reserve(1);
        let ticket = store.take_next().unwrap();
        assert_eq!(
            store.mark_done(ticket.id),
            Err(StoreError::Decode { id: ticket.id, source: DecodeError::Empty })
        );
        assert_eq!(store.state(ticket.id), Ok(TicketState::InFlight));
        store.mark_failed(ticket.id).unwrap();
        assert_eq!(store.state(ticket.id), Ok(TicketState::Pending));
    }

    #[test]
    fn pending_ticket_rejects_writes() {
        let store = ResultStore::reserve(2);
        assert!(matches!(
            store.record_bytes(TicketId(1), b"1"),
            Err(StoreError::InvalidState { expected: TicketState::InFlight, actual: TicketState::Pending, .. })
        ));
        assert!(store.mark_done(TicketId(1)).is_err());
    }

    #[test]
    fn snapshot_requires_completion() {
        let store = ResultStore::reserve(2);
        let ticket = store.take_next().unwrap();
        store.record_bytes(ticket.id, b"5").unwrap();
        store.mark_done(ticket.id).unwrap();
        assert_eq!(store.snapshot(), Err(StoreError::Incomplete { done: 1, total: 2 }));
    }

    #[test]
    fn progress_signal_bumps_on_terminal_transitions() {
        let store = ResultStore::reserve(1);
        let mut progress = store.subscribe();
        assert!(!progress.has_changed().unwrap());

        let ticket = store.take_next().unwrap();
        store.mark_failed(ticket.id).unwrap();
        assert!(progress.has_changed().unwrap());
        progress.borrow_and_update();

        let ticket = store.take_next().unwrap();
        store.record_bytes(ticket.id, b"1").unwrap();
        store.mark_done(ticket.id).unwrap();
        assert_eq!(*progress.borrow_and_update(), 2);
    }

    #[test]
    fn concurrent_workers_never_share_a_ticket() {
        use std::sync::Arc;

        let store = Arc::new(ResultStore::reserve(500));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    while let Some(ticket) = store.take_next() {
                        let digits = ticket.id.0.to_string();
                        store.record_bytes(ticket.id, digits.as_bytes()).unwrap();
                        store.mark_done(ticket.id).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.len(), 500);
        assert!(snapshot.iter().all(|(id, value)| u64::from(id.0) == *value));
    }
}
