//! HTTP collaborators: face detector, remote matcher, attendance recorder.

use async_trait::async_trait;
use facecheck_core::capture::{DetectorError, DetectorOptions, FaceDetector, StillFrame};
use facecheck_core::matcher::{
    AttendanceRecord, AttendanceRecorder, EnrollRequest, EnrollResponse, TransportError,
    VerificationClient, VerifyRequest, VerifyResponse,
};
use facecheck_core::{Embedding, PoseRecord};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

pub fn http_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("facecheckd/", env!("CARGO_PKG_VERSION")))
        .build()
}

fn transport_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if let Some(status) = e.status() {
        TransportError::Status(status.as_u16())
    } else if e.is_decode() {
        TransportError::Decode(e.to_string())
    } else {
        TransportError::Request(e.to_string())
    }
}

/// Posts the JPEG still to a detector service and returns its raw JSON.
pub struct HttpDetector {
    client: reqwest::Client,
    url: String,
}

impl HttpDetector {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl FaceDetector for HttpDetector {
    async fn detect(
        &self,
        still: &StillFrame,
        options: &DetectorOptions,
    ) -> Result<serde_json::Value, DetectorError> {
        let body = tokio::fs::read(still.path())
            .await
            .map_err(|e| DetectorError::Failed(format!("reading still: {e}")))?;

        let response = self
            .client
            .post(&self.url)
            .query(options)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(body)
            .send()
            .await
            .map_err(|e| DetectorError::Failed(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::BAD_REQUEST
            || status == reqwest::StatusCode::UNPROCESSABLE_ENTITY
        {
            let reason = response.text().await.unwrap_or_default();
            return Err(DetectorError::Options(format!("HTTP {status}: {reason}")));
        }
        if !status.is_success() {
            return Err(DetectorError::Failed(format!("HTTP {status}")));
        }
        response
            .json()
            .await
            .map_err(|e| DetectorError::Failed(format!("malformed payload: {e}")))
    }
}

/// JSON-over-HTTP client for the matcher and attendance API.
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(client: reqwest::Client, base_url: &str, token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, TransportError> {
        let mut request = self.client.post(self.endpoint(path)).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(transport_error)?;
        response.error_for_status().map_err(transport_error)
    }

    async fn post_json<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, TransportError> {
        self.post(path, body).await?.json().await.map_err(transport_error)
    }
}

#[async_trait]
impl VerificationClient for ApiClient {
    async fn verify(
        &self,
        identity: &str,
        embedding: &Embedding,
    ) -> Result<VerifyResponse, TransportError> {
        let body = VerifyRequest {
            identity,
            embedding,
            notes: None,
        };
        self.post_json("face/verify", &body).await
    }

    async fn enroll(
        &self,
        identity: &str,
        record: &PoseRecord,
    ) -> Result<EnrollResponse, TransportError> {
        let body = EnrollRequest::from_record(identity, record);
        self.post_json("face/enroll", &body).await
    }
}

#[async_trait]
impl AttendanceRecorder for ApiClient {
    async fn record(&self, record: &AttendanceRecord) -> Result<(), TransportError> {
        self.post("attendance/check-in", record).await?;
        Ok(())
    }
}
