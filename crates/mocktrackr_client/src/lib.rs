//! HTTP client for the MockTrackr exam-record API.
//!
//! Every call goes through a shared `request_gate` stack: a retry layer for
//! transient server failures wrapped around the concurrency gate, wrapped
//! around a `reqwest` client. Callers cannot bypass the gate; they observe
//! only the eventual success or failure of their call, with throttling and
//! retries applied transparently.
//!
//! The retry layer assumes calls are idempotent. Reads are; for writes the
//! backend is expected to tolerate a resubmitted request.

use std::sync::Arc;
use std::time::Duration;

use http::header::{AUTHORIZATION, USER_AGENT};
use http::{HeaderValue, StatusCode};
use request_gate::concurrency_gate::ConcurrencyGateSettings;
use request_gate::concurrency_gate::http::HttpError;
use request_gate::concurrency_gate::layer::ConcurrencyGateLayer;
use request_gate::concurrency_gate::request::ApiRequest;
use request_gate::concurrency_gate::reqwest_integration::ReqwestService;
use request_gate::concurrency_gate::retries::{
    DEFAULT_RETRYABLE_STATUS_CODES, ExponentialBackoff, ExponentialBackoffPolicy, HttpRetryLogic,
    JitterMode,
};
use request_gate::concurrency_gate::service::ConcurrencyGate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tower::retry::{Retry, RetryLayer};
use tower::{Service, ServiceBuilder, ServiceExt};
use tracing::{debug, info};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ClientError {
    #[snafu(display("failed to initialize client: {details}"))]
    Initialization { details: String },

    #[snafu(display("failed to serialize request payload: {source}"))]
    Serialization { source: serde_json::Error },

    #[snafu(display("invalid request: {details}"))]
    InvalidRequest { details: String },

    /// Terminal HTTP error, surfaced after any retries exhausted. The status
    /// and body are exactly what the server last answered.
    #[snafu(display("API error (status {status}): {body}"))]
    Api { status: StatusCode, body: String },

    #[snafu(display("failed to decode API response (status {status}): {source}"))]
    Decode {
        status: StatusCode,
        source: reqwest::Error,
    },

    #[snafu(display("request transport failed: {source}"))]
    Transport { source: reqwest::Error },

    #[snafu(display("request timed out"))]
    Timeout,
}

impl From<HttpError> for ClientError {
    fn from(error: HttpError) -> Self {
        match error {
            HttpError::Status { status, body } => ClientError::Api { status, body },
            HttpError::Transport { source } => ClientError::Transport { source },
            HttpError::Timeout => ClientError::Timeout,
            HttpError::BuildRequest { details } => ClientError::InvalidRequest { details },
        }
    }
}

/// Configuration for [`RecordsClient`].
#[derive(Debug, Clone)]
pub struct RecordsClientConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub user_agent: Option<String>,
    /// Injected client, e.g. one with custom TLS settings. When absent a
    /// client is built from `request_timeout` and `connect_timeout`.
    pub reqwest_client: Option<reqwest::Client>,
    pub gate: ConcurrencyGateSettings,
    pub retry_count: usize,
    pub initial_backoff: Duration,
    /// Cap on a single backoff delay. `None` leaves the doubling unbounded.
    pub max_backoff: Option<Duration>,
    pub retryable_status_codes: Vec<StatusCode>,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for RecordsClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            auth_token: None,
            user_agent: Some(format!(
                "mocktrackr-client/{}",
                option_env!("CARGO_PKG_VERSION").unwrap_or("0.1.0")
            )),
            reqwest_client: None,
            gate: ConcurrencyGateSettings::default(),
            retry_count: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Some(Duration::from_secs(30)),
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES.to_vec(),
            request_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl RecordsClientConfig {
    /// Builds a configuration from `MOCKTRACKR_*` environment variables,
    /// falling back to the defaults for anything unset.
    ///
    /// Recognized variables: `MOCKTRACKR_API_BASE_URL`,
    /// `MOCKTRACKR_API_TOKEN`, `MOCKTRACKR_MAX_CONCURRENT_REQUESTS`,
    /// `MOCKTRACKR_REQUEST_PACING_MS`, `MOCKTRACKR_RETRY_COUNT`,
    /// `MOCKTRACKR_INITIAL_BACKOFF_MS`, `MOCKTRACKR_REQUEST_TIMEOUT_MS`,
    /// `MOCKTRACKR_RETRYABLE_STATUS_CODES` (comma-separated).
    pub fn from_env() -> Result<Self, ClientError> {
        let mut config = Self::default();

        if let Ok(base_url) = std::env::var("MOCKTRACKR_API_BASE_URL") {
            config.base_url = base_url;
        }
        if let Ok(token) = std::env::var("MOCKTRACKR_API_TOKEN") {
            config.auth_token = Some(token);
        }

        let max_concurrent = parse_env("MOCKTRACKR_MAX_CONCURRENT_REQUESTS")?
            .unwrap_or_else(|| config.gate.get_max_concurrent_requests());
        let pacing_ms = parse_env("MOCKTRACKR_REQUEST_PACING_MS")?
            .map(Duration::from_millis)
            .unwrap_or_else(|| config.gate.get_request_pacing_delay());
        config.gate = ConcurrencyGateSettings::builder()
            .max_concurrent_requests(max_concurrent)
            .request_pacing_delay(pacing_ms)
            .build();

        if let Some(retry_count) = parse_env("MOCKTRACKR_RETRY_COUNT")? {
            config.retry_count = retry_count;
        }
        if let Some(backoff_ms) = parse_env::<u64>("MOCKTRACKR_INITIAL_BACKOFF_MS")? {
            config.initial_backoff = Duration::from_millis(backoff_ms);
        }
        if let Some(timeout_ms) = parse_env::<u64>("MOCKTRACKR_REQUEST_TIMEOUT_MS")? {
            config.request_timeout = Duration::from_millis(timeout_ms);
        }
        if let Ok(raw) = std::env::var("MOCKTRACKR_RETRYABLE_STATUS_CODES") {
            config.retryable_status_codes = raw
                .split(',')
                .map(|code| {
                    code.trim()
                        .parse::<u16>()
                        .ok()
                        .and_then(|code| StatusCode::from_u16(code).ok())
                        .ok_or_else(|| ClientError::Initialization {
                            details: format!(
                                "could not parse MOCKTRACKR_RETRYABLE_STATUS_CODES entry '{code}'"
                            ),
                        })
                })
                .collect::<Result<_, _>>()?;
        }

        Ok(config)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ClientError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map(Some).map_err(|_| ClientError::Initialization {
            details: format!("could not parse {name}={raw}"),
        }),
        Err(_) => Ok(None),
    }
}

/// One logged mock-exam session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamRecord {
    pub id: String,
    pub user_id: String,
    pub exam_name: String,
    /// ISO-8601 date; the backend owns the format.
    pub exam_date: String,
    pub duration_minutes: u32,
    pub total_score: f64,
    pub full_score: f64,
    pub sections: Vec<SectionScore>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Per-section score within a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionScore {
    pub title: String,
    pub score: f64,
    pub full_score: f64,
}

/// Payload for creating a record; the backend assigns the id.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewExamRecord {
    pub user_id: String,
    pub exam_name: String,
    pub exam_date: String,
    pub duration_minutes: u32,
    pub total_score: f64,
    pub full_score: f64,
    pub sections: Vec<SectionScore>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Partial update for an existing record; unset fields are left untouched.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exam_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exam_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sections: Option<Vec<SectionScore>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

type RecordsService =
    Retry<ExponentialBackoffPolicy<HttpRetryLogic>, ConcurrencyGate<ReqwestService>>;

/// Client for the exam-record CRUD API.
///
/// Cheap to clone; clones share the same admission gate, so the configured
/// concurrency limit applies across all of them.
#[derive(Clone)]
pub struct RecordsClient {
    service: RecordsService,
    config: Arc<RecordsClientConfig>,
    records_url: String,
    auth_header: Option<HeaderValue>,
    user_agent: Option<HeaderValue>,
}

impl RecordsClient {
    pub fn new(config: RecordsClientConfig) -> Result<Self, ClientError> {
        if config.base_url.is_empty() {
            return Err(ClientError::Initialization {
                details: "base URL cannot be empty".to_string(),
            });
        }

        let auth_header = config
            .auth_token
            .as_deref()
            .map(|token| {
                HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
                    ClientError::Initialization {
                        details: "auth token contains invalid header characters".to_string(),
                    }
                })
            })
            .transpose()?;
        let user_agent = config
            .user_agent
            .as_deref()
            .map(|agent| {
                HeaderValue::from_str(agent).map_err(|_| ClientError::Initialization {
                    details: format!("invalid user agent '{agent}'"),
                })
            })
            .transpose()?;

        let client = match config.reqwest_client.clone() {
            Some(client) => client,
            None => reqwest::Client::builder()
                .timeout(config.request_timeout)
                .connect_timeout(config.connect_timeout)
                .build()
                .map_err(|source| ClientError::Initialization {
                    details: format!("failed to build reqwest client: {source}"),
                })?,
        };

        let mut backoff = ExponentialBackoff::from_millis(config.initial_backoff.as_millis() as u64);
        if let Some(max_backoff) = config.max_backoff {
            backoff = backoff.max_delay(max_backoff);
        }
        let retry_policy = ExponentialBackoffPolicy::new(
            config.retry_count,
            backoff,
            HttpRetryLogic::new(config.retryable_status_codes.iter().copied()),
            JitterMode::None,
        );

        let service = ServiceBuilder::new()
            .layer(RetryLayer::new(retry_policy))
            .layer(ConcurrencyGateLayer::new(config.gate))
            .service(ReqwestService::new_with_client(client));

        let records_url = format!("{}/api/records", config.base_url.trim_end_matches('/'));

        info!(
            base_url = %config.base_url,
            max_concurrent_requests = config.gate.get_max_concurrent_requests(),
            retry_count = config.retry_count,
            "RecordsClient initialized"
        );

        Ok(Self {
            service,
            config: Arc::new(config),
            records_url,
            auth_header,
            user_agent,
        })
    }

    pub fn config(&self) -> &RecordsClientConfig {
        &self.config
    }

    /// All records logged by one user, newest first.
    pub async fn list_records(&mut self, user_id: &str) -> Result<Vec<ExamRecord>, ClientError> {
        let url = format!("{}?userId={user_id}", self.records_url);
        let response = self.send(ApiRequest::get(url)).await?;
        Self::decode(response).await
    }

    /// Records one user logged on a given ISO date.
    pub async fn records_for_date(
        &mut self,
        user_id: &str,
        date: &str,
    ) -> Result<Vec<ExamRecord>, ClientError> {
        let url = format!("{}?userId={user_id}&date={date}", self.records_url);
        let response = self.send(ApiRequest::get(url)).await?;
        Self::decode(response).await
    }

    pub async fn get_record(&mut self, id: &str) -> Result<ExamRecord, ClientError> {
        let url = format!("{}/{id}", self.records_url);
        let response = self.send(ApiRequest::get(url)).await?;
        Self::decode(response).await
    }

    pub async fn create_record(
        &mut self,
        record: &NewExamRecord,
    ) -> Result<ExamRecord, ClientError> {
        let request = ApiRequest::post(self.records_url.clone())
            .json(record)
            .context(SerializationSnafu)?;
        let response = self.send(request).await?;
        Self::decode(response).await
    }

    pub async fn update_record(
        &mut self,
        id: &str,
        patch: &RecordPatch,
    ) -> Result<ExamRecord, ClientError> {
        let url = format!("{}/{id}", self.records_url);
        let request = ApiRequest::patch(url)
            .json(patch)
            .context(SerializationSnafu)?;
        let response = self.send(request).await?;
        Self::decode(response).await
    }

    pub async fn delete_record(&mut self, id: &str) -> Result<(), ClientError> {
        let url = format!("{}/{id}", self.records_url);
        self.send(ApiRequest::delete(url)).await?;
        Ok(())
    }

    async fn send(&mut self, request: ApiRequest) -> Result<reqwest::Response, ClientError> {
        let mut request = request;
        if let Some(auth) = &self.auth_header {
            request = request.header(AUTHORIZATION, auth.clone());
        }
        if let Some(agent) = &self.user_agent {
            request = request.header(USER_AGENT, agent.clone());
        }

        debug!(method = %request.method(), url = %request.url(), "Dispatching API request");
        self.service.ready().await.map_err(ClientError::from)?;
        self.service.call(request).await.map_err(ClientError::from)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
        let status = response.status();
        response
            .json::<T>()
            .await
            .map_err(|source| ClientError::Decode { status, source })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::StatusCode;
    use request_gate::concurrency_gate::ConcurrencyGateSettings;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{ClientError, ExamRecord, NewExamRecord, RecordsClient, RecordsClientConfig};

    fn sample_record() -> ExamRecord {
        ExamRecord {
            id: "rec-1".to_string(),
            user_id: "user-1".to_string(),
            exam_name: "Practice Test 4".to_string(),
            exam_date: "2024-05-11".to_string(),
            duration_minutes: 170,
            total_score: 1420.0,
            full_score: 1600.0,
            sections: vec![
                super::SectionScore {
                    title: "Reading".to_string(),
                    score: 690.0,
                    full_score: 800.0,
                },
                super::SectionScore {
                    title: "Math".to_string(),
                    score: 730.0,
                    full_score: 800.0,
                },
            ],
            note: Some("ran out of time on the last module".to_string()),
        }
    }

    fn test_client(server: &MockServer) -> RecordsClient {
        test_client_with_token(server, None)
    }

    fn test_client_with_token(server: &MockServer, token: Option<&str>) -> RecordsClient {
        let config = RecordsClientConfig {
            base_url: server.uri(),
            auth_token: token.map(str::to_string),
            gate: ConcurrencyGateSettings::builder()
                .max_concurrent_requests(2)
                .request_pacing_delay(Duration::from_millis(10))
                .build(),
            initial_backoff: Duration::from_millis(10),
            ..RecordsClientConfig::default()
        };
        RecordsClient::new(config).expect("client config is valid")
    }

    #[tokio::test]
    async fn creates_and_fetches_a_record() {
        let server = MockServer::start().await;
        let record = sample_record();

        Mock::given(method("POST"))
            .and(path("/api/records"))
            .respond_with(ResponseTemplate::new(201).set_body_json(&record))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/records/rec-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&record))
            .expect(1)
            .mount(&server)
            .await;

        let mut client = test_client(&server);
        let created = client
            .create_record(&NewExamRecord {
                user_id: record.user_id.clone(),
                exam_name: record.exam_name.clone(),
                exam_date: record.exam_date.clone(),
                duration_minutes: record.duration_minutes,
                total_score: record.total_score,
                full_score: record.full_score,
                sections: record.sections.clone(),
                note: record.note.clone(),
            })
            .await
            .unwrap();
        assert_eq!(created, record);

        let fetched = client.get_record("rec-1").await.unwrap();
        assert_eq!(fetched, record);
    }

    #[tokio::test]
    async fn retries_a_503_then_succeeds() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/records"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/records"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec![sample_record()]))
            .expect(1)
            .mount(&server)
            .await;

        let mut client = test_client(&server);
        let records = client.list_records("user-1").await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn does_not_retry_a_404() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/records/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such record"))
            .expect(1)
            .mount(&server)
            .await;

        let mut client = test_client(&server);
        let error = client.get_record("missing").await.unwrap_err();

        match error {
            ClientError::Api { status, body } => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert_eq!(body, "no such record");
            }
            other => panic!("expected an API error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_last_error() {
        let server = MockServer::start().await;

        // 1 initial attempt + 3 retries, all rate limited.
        Mock::given(method("GET"))
            .and(path("/api/records"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .expect(4)
            .mount(&server)
            .await;

        let mut client = test_client(&server);
        let error = client.list_records("user-1").await.unwrap_err();

        match error {
            ClientError::Api { status, body } => {
                assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
                assert_eq!(body, "slow down");
            }
            other => panic!("expected an API error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sends_the_configured_auth_token() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/records"))
            .and(query_param("userId", "user-1"))
            .and(header("authorization", "Bearer sekrit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<ExamRecord>::new()))
            .expect(1)
            .mount(&server)
            .await;

        let mut client = test_client_with_token(&server, Some("sekrit"));
        let records = client.list_records("user-1").await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn delete_returns_unit_on_no_content() {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/api/records/rec-1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let mut client = test_client(&server);
        client.delete_record("rec-1").await.unwrap();
    }

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = RecordsClientConfig::default();
        assert_eq!(config.gate.get_max_concurrent_requests(), 5);
        assert_eq!(
            config.gate.get_request_pacing_delay(),
            Duration::from_millis(150)
        );
        assert_eq!(config.retry_count, 3);
        assert_eq!(config.initial_backoff, Duration::from_millis(500));
        assert_eq!(config.request_timeout, Duration::from_secs(20));
        assert_eq!(
            config.retryable_status_codes,
            vec![
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::SERVICE_UNAVAILABLE,
                StatusCode::GATEWAY_TIMEOUT
            ]
        );
    }
}
