//! Future types for the gated service.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use pin_project::pin_project;
use tokio::time::{Sleep, sleep};

use super::gate::AdmissionPermit;

/// Future for [`ConcurrencyGate`](super::service::ConcurrencyGate).
///
/// Drives the inner call to completion, then holds the admission slot through
/// the pacing delay before releasing it and yielding the stored result
/// unchanged. Dropping the future mid-flight releases the slot immediately;
/// cancelled requests are not paced.
#[pin_project]
pub struct ResponseFuture<F, T, E>
where
    F: Future<Output = Result<T, E>>,
{
    #[pin]
    inner: F,
    #[pin]
    pacing: Option<Sleep>,
    pacing_delay: Duration,
    output: Option<Result<T, E>>,
    permit: Option<AdmissionPermit>,
}

impl<F, T, E> ResponseFuture<F, T, E>
where
    F: Future<Output = Result<T, E>>,
{
    pub(super) fn new(inner: F, permit: AdmissionPermit, pacing_delay: Duration) -> Self {
        Self {
            inner,
            pacing: None,
            pacing_delay,
            output: None,
            permit: Some(permit),
        }
    }
}

impl<F, T, E> Future for ResponseFuture<F, T, E>
where
    F: Future<Output = Result<T, E>>,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        if this.output.is_none() {
            let output = ready!(this.inner.poll(cx));
            *this.output = Some(output);
            if this.pacing_delay.is_zero() {
                this.permit.take();
                return Poll::Ready(this.output.take().expect("output stored above"));
            }
            this.pacing.set(Some(sleep(*this.pacing_delay)));
        }

        match this.pacing.as_pin_mut() {
            Some(delay) => ready!(delay.poll(cx)),
            // Zero pacing completed inline above; a stored output implies a
            // live pacing timer here.
            None => unreachable!("response future polled after completion"),
        }

        this.permit.take();
        Poll::Ready(
            this.output
                .take()
                .expect("response future polled after completion"),
        )
    }
}
