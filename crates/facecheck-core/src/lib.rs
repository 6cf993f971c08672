//! facecheck-core: face capture, quality gating and verification pipeline.
//!
//! Normalizes detector payloads, gates faces on size, rotation and framing,
//! computes ArcFace embeddings via ONNX Runtime and drives the capture
//! session that talks to the remote matcher.

pub mod adapter;
pub mod capture;
pub mod matcher;
pub mod preprocess;
pub mod quality;
pub mod runtime;
pub mod session;
pub mod types;

#[cfg(test)]
mod testing;

pub use capture::{CaptureError, DetectorOptions, FaceDetector, FrameSource, StillFrame};
pub use matcher::{AttendanceRecorder, TransportError, VerificationClient};
pub use runtime::{EmbeddingRuntime, SharedRuntime};
pub use session::{
    CaptureSession, SessionConfig, SessionDeps, SessionState, SessionStatus, TickOutcome,
};
pub use types::{CaptureMode, DetectionResult, Embedding, PoseLabel, PoseRecord};
