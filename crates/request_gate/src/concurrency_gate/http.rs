//! Error taxonomy for outbound HTTP calls made through the gate.

use http::StatusCode;
use snafu::Snafu;

/// Failures surfaced by [`ReqwestService`](super::reqwest_integration::ReqwestService).
///
/// Only [`HttpError::Status`] values carrying a configured retryable status
/// code are resubmitted by the retry layer; everything else is terminal and
/// propagates to the caller unchanged.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HttpError {
    /// The connection could not be established or broke mid-transfer.
    #[snafu(display("request transport failed: {source}"))]
    Transport { source: reqwest::Error },

    /// The per-request timeout elapsed before a response arrived.
    #[snafu(display("request timed out"))]
    Timeout,

    /// The server answered with a non-success status. The response body is
    /// preserved so callers lose no information after retries exhaust.
    #[snafu(display("server responded with status {status}: {body}"))]
    Status { status: StatusCode, body: String },

    /// The request could not be constructed (bad URL, malformed header).
    /// Never retried.
    #[snafu(display("failed to build request: {details}"))]
    BuildRequest { details: String },
}

impl HttpError {
    /// The HTTP status carried by this error, when there is one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}
