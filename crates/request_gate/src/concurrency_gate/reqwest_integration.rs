//! A `tower::Service` wrapper for `reqwest::Client` over [`ApiRequest`].

use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tower::Service;

use super::http::HttpError;
use super::request::ApiRequest;

/// Sends [`ApiRequest`] descriptors through a shared `reqwest::Client`.
///
/// Non-success statuses are mapped to [`HttpError::Status`] with the response
/// body preserved, so the retry layer can inspect the carried status code and
/// callers keep the server's error text after retries exhaust.
#[derive(Clone, Debug)]
pub struct ReqwestService {
    client: reqwest::Client,
}

impl ReqwestService {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn new_with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestService {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<ApiRequest> for ReqwestService {
    type Response = reqwest::Response;
    type Error = HttpError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: ApiRequest) -> Self::Future {
        let client = self.client.clone();
        let (method, url, headers, body) = request.into_parts();

        Box::pin(async move {
            let url = reqwest::Url::parse(&url).map_err(|parse_err| HttpError::BuildRequest {
                details: format!("invalid URL '{url}': {parse_err}"),
            })?;

            let mut builder = client.request(method, url).headers(headers);
            if let Some(body) = body {
                builder = builder.body(body);
            }

            match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        Ok(response)
                    } else {
                        let body = response
                            .text()
                            .await
                            .unwrap_or_else(|_| "could not read error body".to_string());

                        if status.is_server_error()
                            || status == http::StatusCode::TOO_MANY_REQUESTS
                        {
                            warn!(status = %status, error_body = %body, "Server error response");
                        } else {
                            debug!(status = %status, error_body = %body, "Client error response");
                        }

                        Err(HttpError::Status { status, body })
                    }
                }
                Err(error) if error.is_timeout() => {
                    warn!(error = %error, "Request timed out");
                    Err(HttpError::Timeout)
                }
                Err(error) => {
                    warn!(error = %error, "Request transport failed");
                    Err(HttpError::Transport { source: error })
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use tower::{Service, ServiceExt};

    use super::super::http::HttpError;
    use super::super::request::ApiRequest;
    use super::ReqwestService;

    #[tokio::test]
    async fn invalid_url_is_a_build_error() {
        let mut service = ReqwestService::new();
        let error = service
            .ready()
            .await
            .unwrap()
            .call(ApiRequest::get("not a url"))
            .await
            .unwrap_err();

        assert!(matches!(error, HttpError::BuildRequest { .. }));
    }
}
