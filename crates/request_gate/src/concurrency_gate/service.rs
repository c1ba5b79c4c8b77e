//! A `tower` service that gates its inner service behind admission and pacing.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use futures::future::BoxFuture;
use tower::Service;

use super::ConcurrencyGateSettings;
use super::future::ResponseFuture;
use super::gate::{AdmissionGate, AdmissionPermit};

/// Enforces the admission gate around each call to the inner service.
///
/// Admission happens in `poll_ready`: the service reports ready only once it
/// holds a slot, so tower's backpressure contract doubles as the wait queue.
/// The slot is carried through the call and released after the response and
/// the pacing delay. Clones share the same gate, so the limit applies across
/// every clone of one gated stack.
pub struct ConcurrencyGate<S> {
    inner: S,
    gate: Arc<AdmissionGate>,
    pacing_delay: Duration,
    state: State,
}

enum State {
    Waiting(BoxFuture<'static, AdmissionPermit>),
    Ready(AdmissionPermit),
    Empty,
}

impl<S> ConcurrencyGate<S> {
    pub fn new(inner: S, settings: ConcurrencyGateSettings) -> Self {
        Self::with_gate(
            inner,
            AdmissionGate::new(settings.max_concurrent_requests),
            settings.request_pacing_delay,
        )
    }

    pub(super) fn with_gate(
        inner: S,
        gate: Arc<AdmissionGate>,
        pacing_delay: Duration,
    ) -> Self {
        Self {
            inner,
            gate,
            pacing_delay,
            state: State::Empty,
        }
    }

    /// The shared gate driving this service's admissions.
    pub fn gate(&self) -> &Arc<AdmissionGate> {
        &self.gate
    }
}

impl<S, Request> Service<Request> for ConcurrencyGate<S>
where
    S: Service<Request>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future, S::Response, S::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        loop {
            match self.state {
                State::Ready(_) => return self.inner.poll_ready(cx),
                State::Waiting(ref mut admitting) => {
                    let permit = ready!(admitting.as_mut().poll(cx));
                    self.state = State::Ready(permit);
                }
                State::Empty => {
                    self.state = State::Waiting(Box::pin(Arc::clone(&self.gate).acquire()));
                }
            }
        }
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let permit = match std::mem::replace(&mut self.state, State::Empty) {
            State::Ready(permit) => permit,
            // The tower contract requires `poll_ready` to return `Ready`
            // before `call`.
            _ => panic!("called ConcurrencyGate::call without prior poll_ready"),
        };
        ResponseFuture::new(self.inner.call(request), permit, self.pacing_delay)
    }
}

impl<S: Clone> Clone for ConcurrencyGate<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            gate: Arc::clone(&self.gate),
            pacing_delay: self.pacing_delay,
            state: State::Empty,
        }
    }
}

impl<S: fmt::Debug> fmt::Debug for ConcurrencyGate<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyGate")
            .field("inner", &self.inner)
            .field("gate", &self.gate)
            .field("pacing_delay", &self.pacing_delay)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::time::{self, Instant, sleep};
    use tokio_test::{assert_pending, assert_ready_ok, task};
    use tower::{Service, ServiceExt};
    use tower_test::{assert_request_eq, mock};

    use super::super::ConcurrencyGateSettings;
    use super::super::layer::ConcurrencyGateLayer;
    use super::ConcurrencyGate;

    /// Records when each call starts and finishes, completing after a fixed
    /// simulated latency.
    #[derive(Clone)]
    struct RecordingService {
        latency: Duration,
        spans: Arc<Mutex<Vec<(Instant, Instant)>>>,
    }

    impl RecordingService {
        fn new(latency: Duration) -> Self {
            Self {
                latency,
                spans: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Service<&'static str> for RecordingService {
        type Response = &'static str;
        type Error = std::convert::Infallible;
        type Future = futures::future::BoxFuture<'static, Result<&'static str, Self::Error>>;

        fn poll_ready(
            &mut self,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn call(&mut self, request: &'static str) -> Self::Future {
            let latency = self.latency;
            let spans = Arc::clone(&self.spans);
            Box::pin(async move {
                let started = Instant::now();
                sleep(latency).await;
                spans.lock().unwrap().push((started, Instant::now()));
                Ok(request)
            })
        }
    }

    fn gated(
        latency: Duration,
        max_concurrent_requests: usize,
        pacing_ms: u64,
    ) -> (ConcurrencyGate<RecordingService>, RecordingService) {
        let inner = RecordingService::new(latency);
        let settings = ConcurrencyGateSettings::builder()
            .max_concurrent_requests(max_concurrent_requests)
            .request_pacing_delay(Duration::from_millis(pacing_ms))
            .build();
        (ConcurrencyGate::new(inner.clone(), settings), inner)
    }

    #[tokio::test]
    async fn slot_is_freed_only_after_pacing() {
        time::pause();

        let settings = ConcurrencyGateSettings::builder()
            .max_concurrent_requests(1)
            .request_pacing_delay(Duration::from_millis(150))
            .build();
        let (mut svc, mut handle) = mock::spawn_layer(ConcurrencyGateLayer::new(settings));

        assert_ready_ok!(svc.poll_ready());
        let mut first = task::spawn(svc.call("first"));
        assert_request_eq!(handle, "first").send_response("done");

        // The response is withheld and the slot stays occupied until the
        // pacing delay elapses.
        assert_pending!(first.poll());
        assert_pending!(svc.poll_ready());

        time::advance(Duration::from_millis(150)).await;
        assert_eq!(assert_ready_ok!(first.poll()), "done");
        assert_ready_ok!(svc.poll_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn queued_request_starts_after_completion_plus_pacing() {
        let (service, inner) = gated(Duration::from_millis(100), 2, 150);

        let a = tokio::spawn(service.clone().oneshot("a"));
        let b = tokio::spawn(service.clone().oneshot("b"));
        let c = tokio::spawn(service.clone().oneshot("c"));
        for handle in [a, b, c] {
            handle.await.unwrap().unwrap();
        }

        let spans = inner.spans.lock().unwrap();
        assert_eq!(spans.len(), 3);
        let first_finish = spans.iter().map(|(_, end)| *end).min().unwrap();
        let last_start = spans.iter().map(|(start, _)| *start).max().unwrap();
        // The third request waits for a slot: one of the first two must
        // finish and its pacing delay elapse first.
        assert!(last_start >= first_finish + Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_throttles_slot_reuse() {
        let (service, inner) = gated(Duration::from_millis(100), 1, 150);

        let a = tokio::spawn(service.clone().oneshot("a"));
        let b = tokio::spawn(service.clone().oneshot("b"));
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let spans = inner.spans.lock().unwrap();
        assert_eq!(spans.len(), 2);
        assert!(spans[1].0 >= spans[0].1 + Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_limit_requests_in_flight() {
        let (service, inner) = gated(Duration::from_millis(100), 2, 0);

        let calls: Vec<_> = (0..6)
            .map(|_| tokio::spawn(service.clone().oneshot("req")))
            .collect();
        for handle in calls {
            handle.await.unwrap().unwrap();
        }

        let spans = inner.spans.lock().unwrap().clone();
        assert_eq!(spans.len(), 6);
        for (start, _) in &spans {
            let overlapping = spans
                .iter()
                .filter(|(other_start, other_end)| other_start <= start && start < other_end)
                .count();
            assert!(overlapping <= 2, "found {overlapping} overlapping requests");
        }
    }
}
