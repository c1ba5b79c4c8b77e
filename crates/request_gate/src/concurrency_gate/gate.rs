//! The admission primitive: a counting gate with strict-FIFO waiters.
//!
//! Unlike `tokio::sync::Semaphore`, a freed slot is handed directly to the
//! longest-waiting caller under the state lock, so there is no window in which
//! two callers can both observe a free slot. Releasing without a matching
//! acquire is clamped at zero rather than underflowing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use super::instant_now;
use super::internal_event::{RequestAdmitted, RequestQueued, SlotReleased, emit};

/// A queued caller's placeholder. Resolving the ticket transfers an
/// [`AdmissionPermit`] (and with it the slot accounting) to the waiter.
type Ticket = oneshot::Sender<AdmissionPermit>;

struct GateState {
    active: usize,
    waiters: VecDeque<Ticket>,
}

/// Admits at most `limit` concurrent callers; excess callers queue FIFO.
///
/// Construct one gate per independently throttled client. The gate is not a
/// process-wide singleton: tests and multi-tenant setups may run several gates
/// with different limits side by side.
pub struct AdmissionGate {
    limit: usize,
    state: Mutex<GateState>,
}

impl AdmissionGate {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit: limit.max(1),
            state: Mutex::new(GateState {
                active: 0,
                waiters: VecDeque::new(),
            }),
        })
    }

    /// Waits for an admission slot.
    ///
    /// Returns immediately when fewer than `limit` callers are admitted;
    /// otherwise parks on the wait queue until a releasing caller hands over
    /// its slot. Grants are strictly in arrival order. This operation cannot
    /// fail.
    ///
    /// Dropping the returned future while queued abandons the ticket; a slot
    /// offered to an abandoned ticket cascades to the next waiter.
    pub async fn acquire(self: Arc<Self>) -> AdmissionPermit {
        let waiter = {
            let mut state = self.state.lock().expect("gate state lock poisoned");
            if state.active < self.limit {
                state.active += 1;
                emit(RequestAdmitted {
                    in_flight: state.active,
                    queued_for: None,
                });
                None
            } else {
                let (ticket, resolved) = oneshot::channel();
                state.waiters.push_back(ticket);
                emit(RequestQueued {
                    queue_depth: state.waiters.len(),
                });
                Some(resolved)
            }
        };

        match waiter {
            None => AdmissionPermit {
                gate: Some(self),
            },
            Some(resolved) => {
                let queued_at = instant_now();
                // The sender lives in our own wait queue and is consumed only
                // by `release`, which either resolves it or defuses it while
                // `self` is still alive; it cannot be dropped unresolved.
                let permit = resolved
                    .await
                    .expect("admission ticket dropped while caller still waiting");
                let in_flight = self.state.lock().expect("gate state lock poisoned").active;
                emit(RequestAdmitted {
                    in_flight,
                    queued_for: Some(instant_now() - queued_at),
                });
                permit
            }
        }
    }

    /// Frees one slot: hands it to the longest-waiting live ticket, or
    /// decrements the active count when the queue is empty.
    ///
    /// Handing off and releasing are a single step under the state lock, so
    /// the slot is accounted as occupied by the resuming waiter before any
    /// other admission check can run. Tickets whose caller has gone away are
    /// discarded and the slot moves on to the next waiter. A release without
    /// a matching acquire is clamped at zero.
    pub(crate) fn release(self: Arc<Self>) {
        let mut state = self.state.lock().expect("gate state lock poisoned");
        while let Some(ticket) = state.waiters.pop_front() {
            let permit = AdmissionPermit {
                gate: Some(Arc::clone(&self)),
            };
            match ticket.send(permit) {
                // Slot transferred; `active` is unchanged.
                Ok(()) => {
                    debug!(
                        message = "Admission slot handed to queued caller.",
                        queue_depth = state.waiters.len()
                    );
                    return;
                }
                // The waiter gave up; defuse the unclaimed permit so its drop
                // does not re-enter `release`, and offer the slot to the next
                // ticket.
                Err(mut unclaimed) => {
                    trace!(message = "Skipping cancelled admission ticket.");
                    unclaimed.gate = None;
                }
            }
        }
        state.active = state.active.saturating_sub(1);
        emit(SlotReleased {
            in_flight: state.active,
            queue_depth: state.waiters.len(),
        });
    }

    /// Number of currently admitted callers.
    pub fn active(&self) -> usize {
        self.state.lock().expect("gate state lock poisoned").active
    }

    /// Number of callers waiting for a slot.
    pub fn queued(&self) -> usize {
        self.state
            .lock()
            .expect("gate state lock poisoned")
            .waiters
            .len()
    }
}

impl std::fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("limit", &self.limit)
            .field("active", &self.active())
            .field("queued", &self.queued())
            .finish()
    }
}

/// One occupied admission slot. Dropping the permit releases the slot,
/// handing it to the longest waiter if the queue is non-empty.
#[derive(Debug)]
pub struct AdmissionPermit {
    gate: Option<Arc<AdmissionGate>>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_test::{assert_pending, assert_ready, task};

    use super::AdmissionGate;

    #[tokio::test]
    async fn admits_up_to_limit_then_queues() {
        let gate = AdmissionGate::new(2);

        let _first = Arc::clone(&gate).acquire().await;
        let _second = Arc::clone(&gate).acquire().await;
        assert_eq!(gate.active(), 2);

        let mut third = task::spawn(Arc::clone(&gate).acquire());
        assert_pending!(third.poll());
        assert_eq!(gate.active(), 2);
        assert_eq!(gate.queued(), 1);
    }

    #[tokio::test]
    async fn waiters_are_granted_in_arrival_order() {
        let gate = AdmissionGate::new(1);
        let first = Arc::clone(&gate).acquire().await;

        let mut second = task::spawn(Arc::clone(&gate).acquire());
        let mut third = task::spawn(Arc::clone(&gate).acquire());
        assert_pending!(second.poll());
        assert_pending!(third.poll());

        drop(first);
        let second_permit = assert_ready!(second.poll());
        assert_pending!(third.poll());
        assert_eq!(gate.active(), 1);

        drop(second_permit);
        let _third_permit = assert_ready!(third.poll());
        assert_eq!(gate.active(), 1);
        assert_eq!(gate.queued(), 0);
    }

    #[tokio::test]
    async fn handoff_never_exceeds_limit() {
        let gate = AdmissionGate::new(1);
        let first = Arc::clone(&gate).acquire().await;

        let mut second = task::spawn(Arc::clone(&gate).acquire());
        assert_pending!(second.poll());

        // The release hands the slot over without dipping to zero in between.
        drop(first);
        assert_eq!(gate.active(), 1);
        let _permit = assert_ready!(second.poll());
        assert_eq!(gate.active(), 1);
    }

    #[tokio::test]
    async fn release_without_acquire_is_clamped() {
        let gate = AdmissionGate::new(2);
        Arc::clone(&gate).release();
        assert_eq!(gate.active(), 0);

        // The gate still enforces its limit afterwards.
        let _first = Arc::clone(&gate).acquire().await;
        let _second = Arc::clone(&gate).acquire().await;
        let mut third = task::spawn(Arc::clone(&gate).acquire());
        assert_pending!(third.poll());
    }

    #[tokio::test]
    async fn cancelled_waiter_is_skipped() {
        let gate = AdmissionGate::new(1);
        let first = Arc::clone(&gate).acquire().await;

        let mut abandoned = task::spawn(Arc::clone(&gate).acquire());
        let mut patient = task::spawn(Arc::clone(&gate).acquire());
        assert_pending!(abandoned.poll());
        assert_pending!(patient.poll());

        drop(abandoned);
        drop(first);

        let _permit = assert_ready!(patient.poll());
        assert_eq!(gate.active(), 1);
        assert_eq!(gate.queued(), 0);
    }

    #[tokio::test]
    async fn slot_offered_to_dead_ticket_is_not_leaked() {
        let gate = AdmissionGate::new(1);
        let first = Arc::clone(&gate).acquire().await;

        let mut abandoned = task::spawn(Arc::clone(&gate).acquire());
        assert_pending!(abandoned.poll());
        drop(abandoned);

        // No live waiters remain: the release must fall through to a plain
        // decrement instead of parking the slot on the dead ticket.
        drop(first);
        assert_eq!(gate.active(), 0);

        let _again = Arc::clone(&gate).acquire().await;
        assert_eq!(gate.active(), 1);
    }

    #[tokio::test]
    async fn limit_is_clamped_to_one() {
        let gate = AdmissionGate::new(0);
        let _permit = Arc::clone(&gate).acquire().await;
        assert_eq!(gate.active(), 1);

        let mut blocked = task::spawn(Arc::clone(&gate).acquire());
        assert_pending!(blocked.poll());
    }
}
