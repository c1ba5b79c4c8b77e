//! Bounded-concurrency admission gate and retry middleware for reqwest-based HTTP clients.
//!
//! This crate provides `tower` middleware that limits the number of in-flight
//! requests going through a shared HTTP client, queues excess callers in strict
//! FIFO order, paces slot reuse, and retries transient server failures with
//! exponential backoff.
//!
//! # Mechanism
//!
//! 1. **Admission**: at most `max_concurrent_requests` requests are in flight at
//!    once. Excess callers park on a wait queue and are granted slots in arrival
//!    order as capacity frees up.
//! 2. **Pacing**: after each request completes, a fixed delay elapses before its
//!    slot is handed out again, throttling aggregate request rate even when the
//!    upstream is fast.
//! 3. **Retry**: failures carrying a retryable HTTP status (429, 503, 504 by
//!    default) are resubmitted with exponentially growing backoff. Every retry
//!    re-enters admission and pacing.
//!
//! # Safety & Concurrency
//! - Thread-safe: shared state is guarded by a single mutex, never held across
//!   an await point.
//! - No unsafe code.
//!
//! # Basic Usage
//! ```no_run
//! use request_gate::concurrency_gate::ConcurrencyGateSettings;
//! use request_gate::concurrency_gate::layer::ConcurrencyGateLayer;
//! use request_gate::concurrency_gate::reqwest_integration::ReqwestService;
//! use tower::ServiceBuilder;
//!
//! let settings = ConcurrencyGateSettings::default();
//! let service = ServiceBuilder::new()
//!     .layer(ConcurrencyGateLayer::new(settings))
//!     .service(ReqwestService::new());
//! // Drive `service` through `tower::Service` as usual.
//! ```
//!
//! # Configuration
//! See [`concurrency_gate::ConcurrencyGateSettings`] for tuning parameters.
//!
//! # Metrics
//! Emits metrics via the `InternalEvent` trait in
//! [`concurrency_gate::internal_event`].
pub mod concurrency_gate;

#[macro_use]
extern crate tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
