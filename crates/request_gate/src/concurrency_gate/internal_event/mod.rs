//! Typed telemetry events emitted by the gate.

mod concurrency_gate;

pub use concurrency_gate::{RequestAdmitted, RequestQueued, SlotReleased};

/// An event worth recording: each event knows which metrics and log lines it
/// produces. Emission is a no-op unless a `metrics` recorder and a `tracing`
/// subscriber are installed.
pub trait InternalEvent {
    fn emit(self);
}

pub fn emit(event: impl InternalEvent) {
    event.emit();
}
