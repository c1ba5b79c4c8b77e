use std::time::Duration;

use metrics::{counter, histogram};

use super::InternalEvent;

/// A caller was granted an admission slot, either immediately or after
/// waiting in the queue.
#[derive(Clone, Copy, Debug)]
pub struct RequestAdmitted {
    pub in_flight: usize,
    pub queued_for: Option<Duration>,
}

impl InternalEvent for RequestAdmitted {
    fn emit(self) {
        histogram!("concurrency_gate_in_flight").record(self.in_flight as f64);
        if let Some(waited) = self.queued_for {
            histogram!("concurrency_gate_queue_wait_seconds").record(waited.as_secs_f64());
            debug!(
                target: "concurrency_gate::stats",
                in_flight = self.in_flight,
                queued_for_ms = waited.as_millis() as u64,
                "Queued request admitted"
            );
        } else {
            trace!(
                target: "concurrency_gate::stats",
                in_flight = self.in_flight,
                "Request admitted"
            );
        }
    }
}

/// The gate was at capacity and the caller parked on the wait queue.
#[derive(Clone, Copy, Debug)]
pub struct RequestQueued {
    pub queue_depth: usize,
}

impl InternalEvent for RequestQueued {
    fn emit(self) {
        counter!("concurrency_gate_requests_queued_total").increment(1);
        histogram!("concurrency_gate_queue_depth").record(self.queue_depth as f64);
        debug!(
            target: "concurrency_gate::stats",
            queue_depth = self.queue_depth,
            "Request queued for admission"
        );
    }
}

/// A slot was freed with no waiter to hand it to.
#[derive(Clone, Copy, Debug)]
pub struct SlotReleased {
    pub in_flight: usize,
    pub queue_depth: usize,
}

impl InternalEvent for SlotReleased {
    fn emit(self) {
        histogram!("concurrency_gate_in_flight").record(self.in_flight as f64);
        trace!(
            target: "concurrency_gate::stats",
            in_flight = self.in_flight,
            queue_depth = self.queue_depth,
            "Admission slot released"
        );
    }
}
