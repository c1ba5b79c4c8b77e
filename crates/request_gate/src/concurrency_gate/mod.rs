//! Limit the max number of requests being concurrently processed.

pub mod future;
pub mod gate;
pub mod http;
pub mod internal_event;
pub mod layer;
pub mod request;
pub mod reqwest_integration;
pub mod retries;
pub mod service;

use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};

pub use gate::{AdmissionGate, AdmissionPermit};
pub use layer::ConcurrencyGateLayer;
pub use service::ConcurrencyGate;

fn instant_now() -> std::time::Instant {
    tokio::time::Instant::now().into()
}

/// Configuration of the request concurrency gate.
///
/// The gate admits at most `max_concurrent_requests` requests at a time and
/// waits `request_pacing_delay` after each completed request before handing
/// the freed slot to the next caller.
///
/// # Configuration Parameters
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `max_concurrent_requests` | 5 | Upper bound on in-flight requests through one gate. Excess callers queue FIFO. |
/// | `request_pacing_delay` | 150 ms | Delay between a request completing and its slot being reused. Throttles aggregate request rate even when the upstream responds quickly. |
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use request_gate::concurrency_gate::ConcurrencyGateSettings;
///
/// let settings = ConcurrencyGateSettings::builder()
///     .max_concurrent_requests(2)
///     .request_pacing_delay(Duration::from_millis(50))
///     .build();
/// ```
#[derive(Clone, Copy, Debug, Builder, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConcurrencyGateSettings {
    /// The maximum number of requests allowed in flight at once.
    ///
    /// Callers beyond this limit suspend on a FIFO wait queue until a slot
    /// frees up. Clamped to at least 1.
    ///
    /// **Default**: 5
    #[builder(default = default_max_concurrent_requests())]
    #[serde(default = "default_max_concurrent_requests")]
    pub(super) max_concurrent_requests: usize,

    /// Pacing delay inserted after each completed request, before its
    /// concurrency slot is freed for reuse.
    ///
    /// **Default**: 150 ms
    #[builder(default = default_request_pacing_delay())]
    #[serde(default = "default_request_pacing_delay", with = "humantime_serde")]
    pub(super) request_pacing_delay: Duration,
}

const fn default_max_concurrent_requests() -> usize {
    5
}

const fn default_request_pacing_delay() -> Duration {
    Duration::from_millis(150)
}

impl Default for ConcurrencyGateSettings {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_max_concurrent_requests(),
            request_pacing_delay: default_request_pacing_delay(),
        }
    }
}

impl ConcurrencyGateSettings {
    pub fn get_max_concurrent_requests(&self) -> usize {
        self.max_concurrent_requests
    }

    pub fn get_request_pacing_delay(&self) -> Duration {
        self.request_pacing_delay
    }
}
