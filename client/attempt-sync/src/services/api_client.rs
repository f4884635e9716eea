use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use url::Url;

use crate::error::ApiError;
use crate::metrics::track_api_call;
use crate::models::answer::SaveAnswerRequest;
use crate::models::telemetry::{AuditEventsRequest, TelemetryEvent};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Server endpoints consumed by the attempt client. All of them are expected
/// to be idempotent on the server side.
#[async_trait]
pub trait AttemptApi: Send + Sync {
    /// `PUT /attempts/{attemptId}/answer`
    async fn save_answer(
        &self,
        attempt_id: &str,
        request: &SaveAnswerRequest,
        timeout: Duration,
    ) -> Result<(), ApiError>;

    /// `POST /attempts/{attemptId}/audit-events`
    async fn post_audit_events(
        &self,
        attempt_id: &str,
        events: &[TelemetryEvent],
    ) -> Result<(), ApiError>;

    /// Last-chance variant used on shutdown: token travels in the query string
    /// and the call is bounded by `deadline`.
    async fn beacon_audit_events(
        &self,
        attempt_id: &str,
        events: &[TelemetryEvent],
        deadline: Duration,
    ) -> Result<(), ApiError>;

    /// `GET /health`
    async fn health_check(&self) -> Result<(), ApiError>;
}

#[derive(Clone, Debug)]
pub struct HttpAttemptApi {
    client: Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl HttpAttemptApi {
    pub fn new(base_url: &str, auth_token: Option<String>) -> Result<Self, ApiError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ApiError::Request(format!("invalid API base URL: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::Request(format!(
                "API base URL cannot carry paths: {}",
                base_url
            )));
        }

        let client = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url,
            auth_token,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::Request(format!("invalid API base URL: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(builder: RequestBuilder) -> Result<(), ApiError> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            tracing::debug!("Attempt API rejected request: status={}", status);
            return Err(ApiError::Status(status.as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl AttemptApi for HttpAttemptApi {
    async fn save_answer(
        &self,
        attempt_id: &str,
        request: &SaveAnswerRequest,
        timeout: Duration,
    ) -> Result<(), ApiError> {
        let url = self.endpoint(&["attempts", attempt_id, "answer"])?;
        let builder = self
            .authorized(self.client.put(url))
            .json(request)
            .timeout(timeout);

        track_api_call("save_answer", Self::send(builder)).await
    }

    async fn post_audit_events(
        &self,
        attempt_id: &str,
        events: &[TelemetryEvent],
    ) -> Result<(), ApiError> {
        let url = self.endpoint(&["attempts", attempt_id, "audit-events"])?;
        let builder = self
            .authorized(self.client.post(url))
            .json(&AuditEventsRequest { events });

        track_api_call("audit_events", Self::send(builder)).await
    }

    async fn beacon_audit_events(
        &self,
        attempt_id: &str,
        events: &[TelemetryEvent],
        deadline: Duration,
    ) -> Result<(), ApiError> {
        let mut url = self.endpoint(&["attempts", attempt_id, "audit-events"])?;
        if let Some(token) = &self.auth_token {
            url.query_pairs_mut().append_pair("token", token);
        }
        let builder = self
            .client
            .post(url)
            .json(&AuditEventsRequest { events })
            .timeout(deadline);

        track_api_call("audit_events_beacon", Self::send(builder)).await
    }

    async fn health_check(&self) -> Result<(), ApiError> {
        let url = self.endpoint(&["health"])?;
        let builder = self.client.get(url).timeout(HEALTH_TIMEOUT);

        track_api_call("health", Self::send(builder)).await
    }
}
