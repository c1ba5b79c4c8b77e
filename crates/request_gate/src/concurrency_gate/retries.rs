//! Retry policies for transient upstream failures.

use std::{
    borrow::Cow,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures::FutureExt;
use http::StatusCode;
use tokio::time::{Sleep, sleep};
use tower::retry::Policy;

use super::http::HttpError;
use super::request::Resubmittable;

pub enum RetryAction {
    /// Indicate that this request should be retried with a reason
    Retry(Cow<'static, str>),
    /// Indicate that this request should not be retried with a reason
    DontRetry(Cow<'static, str>),
    /// Indicate that this request should not be retried but the request was successful
    Successful,
}

impl RetryAction {
    pub const fn is_retryable(&self) -> bool {
        matches!(self, RetryAction::Retry(_))
    }

    pub const fn is_not_retryable(&self) -> bool {
        matches!(self, RetryAction::DontRetry(_))
    }

    pub const fn is_successful(&self) -> bool {
        matches!(self, RetryAction::Successful)
    }
}

/// Defines the contract for determining which requests should be retried.
///
/// Implementers specify which error values are transient and whether a
/// delivered response still calls for a retry.
pub trait RetryLogic: Clone + Send + Sync + 'static {
    /// The type of errors produced by the service
    type Error: std::error::Error + Send + Sync + 'static;

    /// The type of successful responses from the service
    type Response;

    /// Determines if an error should trigger a retry.
    fn is_retriable_error(&self, error: &Self::Error) -> bool;

    /// Determines if a successful response should trigger a retry.
    ///
    /// Defaults to `RetryAction::Successful`; override only when success
    /// responses can indicate retry needs.
    fn should_retry_response(&self, _response: &Self::Response) -> RetryAction {
        RetryAction::Successful
    }
}

/// The jitter mode to use for retry backoff behavior.
#[derive(Clone, Copy, Debug, Default)]
pub enum JitterMode {
    /// No jitter: delays follow the configured doubling sequence exactly.
    #[default]
    None,

    /// Full jitter.
    ///
    /// The random delay is anywhere from 0 up to the maximum current delay
    /// calculated by the backoff strategy. Incorporating full jitter can
    /// greatly reduce the likelihood of accidental denial of service
    /// conditions against your own systems when many clients recover from a
    /// failure state at once.
    Full,
}

// Derived from the `tokio-retry` crate's backoff strategy.
// MIT License, Copyright (c) 2017 Sam Rijs
//
/// A retry strategy driven by exponential back-off: the delay starts at an
/// initial value and is multiplied by `base` (default 2) after every attempt.
///
/// Uncapped unless [`max_delay`](ExponentialBackoff::max_delay) is set.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: u64,
    base: u64,
    max_delay: Option<Duration>,
}

impl ExponentialBackoff {
    /// Constructs a new exponential back-off strategy, given an initial
    /// delay in milliseconds.
    pub const fn from_millis(initial: u64) -> ExponentialBackoff {
        ExponentialBackoff {
            current: initial,
            base: 2,
            max_delay: None,
        }
    }

    /// The multiplier applied to the delay after each attempt.
    ///
    /// Default base is `2` (doubling).
    pub const fn base(mut self, base: u64) -> ExponentialBackoff {
        self.base = base;
        self
    }

    /// Apply a maximum delay. No retry delay will be longer than this `Duration`.
    pub const fn max_delay(mut self, duration: Duration) -> ExponentialBackoff {
        self.max_delay = Some(duration);
        self
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let duration = Duration::from_millis(self.current);
        self.current = self.current.saturating_mul(self.base);

        match self.max_delay {
            Some(max_delay) if duration > max_delay => Some(max_delay),
            _ => Some(duration),
        }
    }
}

/// A `tower` retry policy that resubmits failed requests with exponentially
/// growing delays, up to a bounded number of retries.
///
/// The policy marks every request it resubmits. A request arriving at the
/// layer already marked (resubmitted by an outer retry layer) is attempted
/// once and never retried again, so stacked retry layers cannot compound
/// retries of one logical request.
#[derive(Clone, Debug)]
pub struct ExponentialBackoffPolicy<L: RetryLogic> {
    attempts_remaining: usize,
    backoff: ExponentialBackoff,
    first_attempt_made: bool,
    jitter_mode: JitterMode,
    logic: L,
}

pub struct RetryPolicyFuture<L: RetryLogic> {
    delay: Pin<Box<Sleep>>,
    policy: ExponentialBackoffPolicy<L>,
}

impl<L: RetryLogic> ExponentialBackoffPolicy<L> {
    pub fn new(
        max_retries: usize,
        backoff: ExponentialBackoff,
        logic: L,
        jitter_mode: JitterMode,
    ) -> Self {
        Self {
            attempts_remaining: max_retries,
            backoff,
            first_attempt_made: false,
            jitter_mode,
            logic,
        }
    }

    fn build_retry(&self, reason: &Cow<'static, str>) -> RetryPolicyFuture<L> {
        let mut policy = self.clone();
        policy.attempts_remaining -= 1;
        policy.first_attempt_made = true;
        // The iterator is infinite; `next` always yields.
        let base_delay = policy
            .backoff
            .next()
            .expect("exponential backoff iterator ended");
        let delay = self.apply_jitter(base_delay);

        warn!(
            message = "Retrying request.",
            reason = %reason,
            delay_ms = %delay.as_millis(),
            attempts_remaining = policy.attempts_remaining
        );
        RetryPolicyFuture {
            delay: Box::pin(sleep(delay)),
            policy,
        }
    }

    fn apply_jitter(&self, base_duration: Duration) -> Duration {
        match self.jitter_mode {
            JitterMode::None => base_duration,
            JitterMode::Full => {
                if base_duration.as_millis() == 0 {
                    return Duration::from_millis(0);
                }
                let random_millis =
                    (rand::random::<f64>() * base_duration.as_millis() as f64) as u64;
                Duration::from_millis(random_millis)
            }
        }
    }
}

impl<Req, Res, L> Policy<Req, Res, L::Error> for ExponentialBackoffPolicy<L>
where
    Req: Clone + Resubmittable,
    L: RetryLogic<Response = Res>,
{
    type Future = RetryPolicyFuture<L>;

    fn retry(&self, _request: &Req, result: Result<&Res, &L::Error>) -> Option<Self::Future> {
        let action = match result {
            Ok(response) => self.logic.should_retry_response(response),
            Err(error) => {
                if self.logic.is_retriable_error(error) {
                    RetryAction::Retry(Cow::Borrowed("transient service error"))
                } else {
                    RetryAction::DontRetry(Cow::Borrowed("service error deemed not retriable"))
                }
            }
        };

        match action {
            RetryAction::Retry(reason) => {
                if self.attempts_remaining == 0 {
                    error!(
                        message = "Retries exhausted; propagating the last error.",
                        reason = %reason
                    );
                    return None;
                }
                Some(self.build_retry(&reason))
            }
            RetryAction::DontRetry(reason) => {
                debug!(message = "Not retriable; propagating the error.", reason = %reason);
                None
            }
            RetryAction::Successful => None,
        }
    }

    fn clone_request(&self, request: &Req) -> Option<Req> {
        // A request that reaches this layer already marked was resubmitted by
        // an outer retry layer; withholding the clone limits it to a single
        // attempt here. `first_attempt_made` distinguishes that case from our
        // own resubmissions, which must keep their retry budget.
        if request.is_resubmitted() && !self.first_attempt_made {
            debug!(message = "Request already resubmitted upstream; allowing one attempt only.");
            return None;
        }

        let mut resubmission = request.clone();
        resubmission.mark_resubmitted();
        Some(resubmission)
    }
}

// Safety: `L` is never pinned and we use no unsafe pin projections
// therefore this safe.
impl<L: RetryLogic> Unpin for RetryPolicyFuture<L> {}

impl<L: RetryLogic> Future for RetryPolicyFuture<L> {
    type Output = ExponentialBackoffPolicy<L>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        std::task::ready!(self.delay.poll_unpin(cx));
        Poll::Ready(self.policy.clone())
    }
}

/// Status codes treated as transient when nothing else is configured:
/// rate limiting, unavailability and gateway timeouts.
pub const DEFAULT_RETRYABLE_STATUS_CODES: [StatusCode; 3] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// `RetryLogic` over [`HttpError`] driven by a configurable set of retryable
/// status codes.
///
/// Everything that is not a status in the set (network failures, timeouts,
/// request build errors, other statuses) is terminal and propagates
/// immediately.
#[derive(Clone, Debug)]
pub struct HttpRetryLogic {
    retryable_statuses: Arc<[StatusCode]>,
}

impl Default for HttpRetryLogic {
    fn default() -> Self {
        Self::new(DEFAULT_RETRYABLE_STATUS_CODES)
    }
}

impl HttpRetryLogic {
    pub fn new(statuses: impl IntoIterator<Item = StatusCode>) -> Self {
        Self {
            retryable_statuses: statuses.into_iter().collect(),
        }
    }

    fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.retryable_statuses.contains(&status)
    }
}

impl RetryLogic for HttpRetryLogic {
    type Error = HttpError;
    type Response = reqwest::Response;

    fn is_retriable_error(&self, error: &Self::Error) -> bool {
        match error {
            HttpError::Status { status, .. } => self.is_retryable_status(*status),
            HttpError::Transport { .. } | HttpError::Timeout | HttpError::BuildRequest { .. } => {
                false
            }
        }
    }

    fn should_retry_response(&self, response: &Self::Response) -> RetryAction {
        let status = response.status();
        if self.is_retryable_status(status) {
            RetryAction::Retry(Cow::Owned(format!(
                "server responded with status {status}"
            )))
        } else {
            RetryAction::Successful
        }
    }
}
