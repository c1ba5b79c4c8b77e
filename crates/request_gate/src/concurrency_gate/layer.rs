//! A `tower` layer that shares one admission gate across a service stack.

use std::sync::Arc;
use std::time::Duration;

use tower::Layer;

use super::ConcurrencyGateSettings;
use super::gate::AdmissionGate;
use super::service::ConcurrencyGate;

/// Applies the concurrency gate to every service it wraps.
///
/// All services produced by one layer instance (and their clones) share a
/// single [`AdmissionGate`], so the configured limit and pacing apply across
/// the whole stack. Build a second layer for an independently throttled
/// client.
#[derive(Clone, Debug)]
pub struct ConcurrencyGateLayer {
    gate: Arc<AdmissionGate>,
    pacing_delay: Duration,
}

impl ConcurrencyGateLayer {
    pub fn new(settings: ConcurrencyGateSettings) -> Self {
        Self {
            gate: AdmissionGate::new(settings.max_concurrent_requests),
            pacing_delay: settings.request_pacing_delay,
        }
    }

    /// The gate shared by all services this layer produces.
    pub fn gate(&self) -> &Arc<AdmissionGate> {
        &self.gate
    }
}

impl Default for ConcurrencyGateLayer {
    fn default() -> Self {
        Self::new(ConcurrencyGateSettings::default())
    }
}

impl<S> Layer<S> for ConcurrencyGateLayer {
    type Service = ConcurrencyGate<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ConcurrencyGate::with_gate(inner, Arc::clone(&self.gate), self.pacing_delay)
    }
}
