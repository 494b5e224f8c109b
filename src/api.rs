//! HTTP client for the report backend. One request per operation, no
//! automatic retries: retry is always an explicit user action upstream.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STD;
use base64::Engine as _;
use tracing::debug;

use crate::config::Config;
use crate::models::{
    DetectOutcome, DetectRequest, Detection, GeoPosition, StatusUpdate, SubmitRequest,
    SubmittedReport,
};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("failed to build http client: {0}")]
    Client(String),

    #[error("analysis failed: {0}")]
    AnalysisFailed(String),

    #[error("submission rejected ({status}): {reason}")]
    SubmitRejected { status: u16, reason: String },

    #[error("submission failed: {0}")]
    SubmitFailed(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("unexpected response ({status}): {body}")]
    UnexpectedResponse { status: u16, body: String },
}

#[async_trait]
pub trait ReportApi: Send + Sync {
    /// POST /vision/detect. Failure is non-fatal to the flow; the caller
    /// downgrades it to "manual submission allowed".
    async fn detect(
        &self,
        image: &[u8],
        position: &GeoPosition,
    ) -> Result<DetectOutcome, ApiError>;

    /// POST /report/submit.
    async fn submit(
        &self,
        image: &[u8],
        position: &GeoPosition,
        detections: &[Detection],
    ) -> Result<SubmittedReport, ApiError>;

    /// GET /reports/user/{user_id}.
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<SubmittedReport>, ApiError>;

    /// GET /admin/reports, newest first.
    async fn list_all(&self) -> Result<Vec<SubmittedReport>, ApiError>;

    /// PATCH /admin/report/{report_id}.
    async fn update_status(
        &self,
        report_id: &str,
        status: &str,
    ) -> Result<SubmittedReport, ApiError>;
}

#[async_trait]
impl<T: ReportApi + ?Sized> ReportApi for std::sync::Arc<T> {
    async fn detect(
        &self,
        image: &[u8],
        position: &GeoPosition,
    ) -> Result<DetectOutcome, ApiError> {
        (**self).detect(image, position).await
    }

    async fn submit(
        &self,
        image: &[u8],
        position: &GeoPosition,
        detections: &[Detection],
    ) -> Result<SubmittedReport, ApiError> {
        (**self).submit(image, position, detections).await
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<SubmittedReport>, ApiError> {
        (**self).list_by_user(user_id).await
    }

    async fn list_all(&self) -> Result<Vec<SubmittedReport>, ApiError> {
        (**self).list_all().await
    }

    async fn update_status(
        &self,
        report_id: &str,
        status: &str,
    ) -> Result<SubmittedReport, ApiError> {
        (**self).update_status(report_id, status).await
    }
}

pub struct HttpReportApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpReportApi {
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| ApiError::Client(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_reports(&self, path: &str) -> Result<Vec<SubmittedReport>, ApiError> {
        let res = self
            .client
            .get(self.endpoint(path))
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ApiError::UnexpectedResponse {
                status: status.as_u16(),
                body: truncate(&body),
            });
        }
        serde_json::from_str(&body).map_err(|e| ApiError::Request(e.to_string()))
    }
}

#[async_trait]
impl ReportApi for HttpReportApi {
    async fn detect(
        &self,
        image: &[u8],
        position: &GeoPosition,
    ) -> Result<DetectOutcome, ApiError> {
        let encoded = BASE64_STD.encode(image);
        let payload = DetectRequest {
            image: &encoded,
            latitude: position.latitude,
            longitude: position.longitude,
        };

        let res = self
            .client
            .post(self.endpoint("/vision/detect"))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ApiError::AnalysisFailed(e.to_string()))?;

        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ApiError::AnalysisFailed(format!(
                "status={} body={}",
                status,
                truncate(&body)
            )));
        }

        let outcome: DetectOutcome =
            serde_json::from_str(&body).map_err(|e| ApiError::AnalysisFailed(e.to_string()))?;
        debug!(
            detections = outcome.detections.len(),
            problems_detected = outcome.problems_detected,
            "detection response received"
        );
        Ok(outcome)
    }

    async fn submit(
        &self,
        image: &[u8],
        position: &GeoPosition,
        detections: &[Detection],
    ) -> Result<SubmittedReport, ApiError> {
        let encoded = BASE64_STD.encode(image);
        let payload = SubmitRequest {
            image: &encoded,
            location: position.lat_lng(),
            detections,
        };

        let res = self
            .client
            .post(self.endpoint("/report/submit"))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ApiError::SubmitFailed(e.to_string()))?;

        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        map_submit_response(status.as_u16(), &body)
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<SubmittedReport>, ApiError> {
        self.get_reports(&format!("/reports/user/{}", user_id)).await
    }

    async fn list_all(&self) -> Result<Vec<SubmittedReport>, ApiError> {
        self.get_reports("/admin/reports").await
    }

    async fn update_status(
        &self,
        report_id: &str,
        status: &str,
    ) -> Result<SubmittedReport, ApiError> {
        let res = self
            .client
            .patch(self.endpoint(&format!("/admin/report/{}", report_id)))
            .json(&StatusUpdate { status })
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;

        let http_status = res.status();
        let body = res.text().await.unwrap_or_default();
        if !http_status.is_success() {
            return Err(ApiError::UnexpectedResponse {
                status: http_status.as_u16(),
                body: truncate(&body),
            });
        }
        serde_json::from_str(&body).map_err(|e| ApiError::Request(e.to_string()))
    }
}

/// Maps a submit response to the error taxonomy: 4xx carries a
/// server-supplied reason, everything else non-2xx is a plain failure.
fn map_submit_response(status: u16, body: &str) -> Result<SubmittedReport, ApiError> {
    if (200..300).contains(&status) {
        return serde_json::from_str(body).map_err(|e| ApiError::SubmitFailed(e.to_string()));
    }
    if (400..500).contains(&status) {
        return Err(ApiError::SubmitRejected {
            status,
            reason: extract_reason(body),
        });
    }
    Err(ApiError::SubmitFailed(format!(
        "status={} body={}",
        status,
        truncate(body)
    )))
}

/// Pulls the human-readable reason out of an error body. The backend uses
/// `detail` (FastAPI convention); `message` is accepted as well.
fn extract_reason(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["detail", "message"] {
            if let Some(reason) = value.get(key).and_then(|v| v.as_str()) {
                return reason.to_string();
            }
        }
    }
    truncate(body)
}

fn truncate(s: &str) -> String {
    const MAX: usize = 512;
    if s.len() <= MAX {
        return s.to_string();
    }
    // Cut on a char boundary; a fixed byte index would panic on
    // multibyte text.
    let mut end = MAX;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
