//! Remote face analysis: submit a captured still, then poll for the result.

use chrono::{DateTime, FixedOffset};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

const SUBMIT_PATH: &str = "/api/v1/ai/analyze-face";
const POLL_INTERVAL: Duration = Duration::from_millis(1000);
const MAX_POLLS: u32 = 30;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("analysis request rejected: {0}")]
    Rejected(String),
    #[error("analysis failed: {0}")]
    Failed(String),
    #[error("analysis did not finish after {attempts} polls")]
    Timeout { attempts: u32 },
}

/// Reply to a submission.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub success: bool,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Attributes the recommendation query is keyed on. Everything else the
/// service returns is carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceAnalysis {
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub skin_color: Option<String>,
    #[serde(default)]
    pub face_shape: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisData {
    pub status: AnalysisStatus,
    #[serde(default)]
    pub analysis: FaceAnalysis,
    #[serde(default)]
    pub s3_url: Option<String>,
    #[serde(default)]
    pub analyzed_at: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Reply to one poll.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Option<AnalysisData>,
    #[serde(default)]
    pub message: Option<String>,
}

/// A completed analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisOutcome {
    pub session_id: String,
    pub analysis: FaceAnalysis,
    pub s3_url: Option<String>,
    pub analyzed_at: Option<DateTime<FixedOffset>>,
}

/// Transport to the analysis service.
pub trait AnalysisApi: Send + Sync + 'static {
    fn submit(
        &self,
        jpeg: Vec<u8>,
    ) -> impl Future<Output = Result<SubmitResponse, AnalysisError>> + Send;

    fn fetch_result(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<ResultResponse, AnalysisError>> + Send;
}

/// [`AnalysisApi`] over HTTP.
pub struct HttpAnalysisApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAnalysisApi {
    pub fn new(base_url: &str) -> Result<Self, AnalysisError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn submit_url(&self) -> String {
        format!("{}{SUBMIT_PATH}", self.base_url)
    }

    fn result_url(&self, session_id: &str) -> String {
        format!("{}/api/v1/ai/analysis/{session_id}/result/", self.base_url)
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, AnalysisError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AnalysisError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.json().await?)
}

impl AnalysisApi for HttpAnalysisApi {
    async fn submit(&self, jpeg: Vec<u8>) -> Result<SubmitResponse, AnalysisError> {
        let part = Part::bytes(jpeg)
            .file_name("capture.jpg")
            .mime_str("image/jpeg")?;
        let form = Form::new().part("image", part);
        let response = self
            .client
            .post(self.submit_url())
            .multipart(form)
            .send()
            .await?;
        read_json(response).await
    }

    async fn fetch_result(&self, session_id: &str) -> Result<ResultResponse, AnalysisError> {
        let response = self.client.get(self.result_url(session_id)).send().await?;
        read_json(response).await
    }
}

/// Submits a still once and polls at a fixed interval until the job
/// settles. Every error is terminal for the submission.
pub struct AnalysisClient<A> {
    api: A,
    poll_interval: Duration,
    max_polls: u32,
}

impl<A: AnalysisApi> AnalysisClient<A> {
    pub fn new(api: A) -> Self {
        Self {
            api,
            poll_interval: POLL_INTERVAL,
            max_polls: MAX_POLLS,
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub async fn analyze(&self, jpeg: Vec<u8>) -> Result<AnalysisOutcome, AnalysisError> {
        tracing::info!(bytes = jpeg.len(), "submitting photo for analysis");
        let submitted = self.api.submit(jpeg).await.map_err(|e| {
            tracing::warn!(error = %e, "analysis submission failed");
            e
        })?;

        let session_id = match submitted.session_id {
            Some(id) if submitted.success && !id.is_empty() => id,
            _ => {
                let reason = submitted
                    .message
                    .unwrap_or_else(|| "no session issued".to_string());
                tracing::warn!(%reason, "analysis submission rejected");
                return Err(AnalysisError::Rejected(reason));
            }
        };
        tracing::info!(%session_id, "analysis queued");

        for attempt in 1..=self.max_polls {
            let reply = self.api.fetch_result(&session_id).await.map_err(|e| {
                tracing::warn!(%session_id, attempt, error = %e, "analysis poll failed");
                e
            })?;

            if !reply.success {
                let reason = reply
                    .message
                    .unwrap_or_else(|| "service reported failure".to_string());
                tracing::warn!(%session_id, %reason, "analysis failed");
                return Err(AnalysisError::Failed(reason));
            }

            match reply.data {
                Some(data) if data.status == AnalysisStatus::Completed => {
                    tracing::info!(%session_id, attempt, "analysis completed");
                    return Ok(AnalysisOutcome {
                        analyzed_at: data
                            .analyzed_at
                            .as_deref()
                            .and_then(|at| DateTime::parse_from_rfc3339(at).ok()),
                        session_id,
                        analysis: data.analysis,
                        s3_url: data.s3_url,
                    });
                }
                Some(data) if data.status == AnalysisStatus::Failed => {
                    let reason = data
                        .message
                        .or(reply.message)
                        .unwrap_or_else(|| "analysis job failed".to_string());
                    tracing::warn!(%session_id, %reason, "analysis failed");
                    return Err(AnalysisError::Failed(reason));
                }
                other => {
                    tracing::debug!(
                        %session_id,
                        attempt,
                        status = ?other.map(|d| d.status),
                        "analysis still running"
                    );
                }
            }

            if attempt < self.max_polls {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        tracing::warn!(%session_id, attempts = self.max_polls, "analysis timed out");
        Err(AnalysisError::Timeout {
            attempts: self.max_polls,
        })
    }
}
