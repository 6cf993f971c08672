//! Camera and detector ports used by the capture session.

use crate::adapter;
use crate::types::{DetectionResult, FrameSize};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("no camera device: {0}")]
    NoDevice(String),
    #[error("capture failed: {0}")]
    Failed(String),
}

impl CaptureError {
    /// Conditions a retry on the next tick cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::PermissionDenied(_) | Self::NoDevice(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectorError {
    #[error("detector rejected options: {0}")]
    Options(String),
    #[error("detector failed: {0}")]
    Failed(String),
}

enum StillFile {
    Temporary(TempPath),
    Persistent(PathBuf),
}

/// A captured still on disk. Temporary stills are deleted on drop.
pub struct StillFrame {
    file: StillFile,
    size: FrameSize,
}

impl StillFrame {
    pub fn temporary(path: TempPath, width: u32, height: u32) -> Self {
        Self {
            file: StillFile::Temporary(path),
            size: FrameSize { width, height },
        }
    }

    /// A still owned by someone else; left in place on drop.
    pub fn persistent(path: impl Into<PathBuf>, width: u32, height: u32) -> Self {
        Self {
            file: StillFile::Persistent(path.into()),
            size: FrameSize { width, height },
        }
    }

    pub fn path(&self) -> &Path {
        match &self.file {
            StillFile::Temporary(p) => &**p,
            StillFile::Persistent(p) => p.as_path(),
        }
    }

    pub fn size(&self) -> FrameSize {
        self.size
    }
}

#[async_trait]
pub trait FrameSource: Send + Sync {
    fn is_ready(&self) -> bool;

    async fn capture_still(&self) -> Result<StillFrame, CaptureError>;
}

/// Feature switches forwarded to the detector.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorOptions {
    pub landmarks: bool,
    pub contours: bool,
    pub classification: bool,
    pub accurate: bool,
    pub min_face_size: f32,
    pub tracking: bool,
}

impl DetectorOptions {
    pub fn full() -> Self {
        Self {
            landmarks: true,
            contours: true,
            classification: true,
            accurate: true,
            min_face_size: 0.1,
            tracking: true,
        }
    }

    /// Minimal option set for detectors that reject the full one.
    pub fn reduced() -> Self {
        Self {
            landmarks: false,
            contours: false,
            classification: true,
            accurate: false,
            min_face_size: 0.1,
            tracking: false,
        }
    }
}

#[async_trait]
pub trait FaceDetector: Send + Sync {
    /// Raw vendor payload for one still.
    async fn detect(
        &self,
        still: &StillFrame,
        options: &DetectorOptions,
    ) -> Result<serde_json::Value, DetectorError>;
}

/// Run the detector and normalize its payload.
///
/// A failing call is retried once with [`DetectorOptions::reduced`]; if that
/// fails too the tick sees no faces.
pub async fn detect_faces(detector: &dyn FaceDetector, still: &StillFrame) -> Vec<DetectionResult> {
    let payload = match detector.detect(still, &DetectorOptions::full()).await {
        Ok(payload) => payload,
        Err(first) => {
            tracing::debug!(error = %first, "detector failed with full options; retrying reduced");
            match detector.detect(still, &DetectorOptions::reduced()).await {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(error = %e, "detector failed; treating frame as faceless");
                    return Vec::new();
                }
            }
        }
    };
    adapter::normalize_payload(&payload)
}

/// Largest face by bounds area; faces without bounds rank last.
pub fn primary_face(faces: Vec<DetectionResult>) -> Option<DetectionResult> {
    faces.into_iter().max_by(|a, b| {
        let area = |d: &DetectionResult| d.bounds.map(|b| b.area()).unwrap_or(f32::NEG_INFINITY);
        area(a)
            .partial_cmp(&area(b))
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}
