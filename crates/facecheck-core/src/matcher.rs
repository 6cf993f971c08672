//! Remote matcher protocol and the collaborator traits the session calls.

use crate::types::{Embedding, PoseLabel, PoseRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Network-level failure talking to a remote collaborator.
///
/// The session treats every variant like a business "no match".
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("request timed out")]
    Timeout,
    #[error("server returned HTTP {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Decode(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest<'a> {
    pub identity: &'a str,
    pub embedding: &'a Embedding,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollRequest<'a> {
    pub identity: &'a str,
    pub embedding: &'a Embedding,
    pub pose: PoseLabel,
    pub quality_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<&'a str>,
}

impl<'a> EnrollRequest<'a> {
    pub fn from_record(identity: &'a str, record: &'a PoseRecord) -> Self {
        Self {
            identity,
            embedding: &record.embedding,
            pose: record.pose,
            quality_score: record.quality_score.value(),
            notes: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VerifyResponse {
    pub success: bool,
    pub is_match: bool,
    pub confidence: f32,
    pub matched_id: Option<String>,
    pub display_name: Option<String>,
    pub message: Option<String>,
}

impl VerifyResponse {
    /// A confirmed match: the call succeeded and the matcher said yes.
    pub fn is_confirmed(&self) -> bool {
        self.success && self.is_match
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrollResponse {
    pub success: bool,
    pub message: Option<String>,
}

#[async_trait]
pub trait VerificationClient: Send + Sync {
    async fn verify(
        &self,
        identity: &str,
        embedding: &Embedding,
    ) -> Result<VerifyResponse, TransportError>;

    async fn enroll(
        &self,
        identity: &str,
        record: &PoseRecord,
    ) -> Result<EnrollResponse, TransportError>;
}

/// Check-in written after a confirmed verification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub identity: String,
    pub timestamp: DateTime<Utc>,
    pub matched_id: Option<String>,
    pub confidence: f32,
}

#[async_trait]
pub trait AttendanceRecorder: Send + Sync {
    async fn record(&self, record: &AttendanceRecord) -> Result<(), TransportError>;
}
