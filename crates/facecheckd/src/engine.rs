use crate::config::Config;
use crate::remote::{self, ApiClient, HttpDetector};
use async_trait::async_trait;
use facecheck_core::capture::{CaptureError, FrameSource, StillFrame};
use facecheck_core::preprocess::Preprocessor;
use facecheck_core::runtime::{EmbeddingRuntime, InputSpec, OnnxLoader, RuntimeError};
use facecheck_core::types::AcceptedPose;
use facecheck_core::{CaptureMode, CaptureSession, SessionDeps, SessionState, SharedRuntime};
use facecheck_hw::{Camera, CameraError};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("embedding runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),
    #[error("scratch directory: {0}")]
    Scratch(#[from] std::io::Error),
    #[error("another capture session is already running")]
    Busy,
}

/// Camera behind the session's `FrameSource` port.
pub struct CameraSource {
    camera: Arc<Mutex<Camera>>,
    scratch_dir: PathBuf,
    max_dark_attempts: usize,
}

impl CameraSource {
    pub fn new(camera: Camera, scratch_dir: PathBuf, max_dark_attempts: usize) -> Self {
        Self {
            camera: Arc::new(Mutex::new(camera)),
            scratch_dir,
            max_dark_attempts,
        }
    }
}

fn capture_error(e: CameraError) -> CaptureError {
    match e {
        CameraError::PermissionDenied(device) => CaptureError::PermissionDenied(device),
        CameraError::DeviceNotFound(device) => CaptureError::NoDevice(device),
        other if other.is_unrecoverable() => CaptureError::NoDevice(other.to_string()),
        other => CaptureError::Failed(other.to_string()),
    }
}

#[async_trait]
impl FrameSource for CameraSource {
    fn is_ready(&self) -> bool {
        true
    }

    async fn capture_still(&self) -> Result<StillFrame, CaptureError> {
        let camera = Arc::clone(&self.camera);
        let dir = self.scratch_dir.clone();
        let attempts = self.max_dark_attempts;
        let (path, width, height) = tokio::task::spawn_blocking(move || {
            let camera = camera.lock().unwrap_or_else(PoisonError::into_inner);
            camera.capture_still(&dir, attempts)
        })
        .await
        .map_err(|e| CaptureError::Failed(format!("capture task: {e}")))?
        .map_err(capture_error)?;
        Ok(StillFrame::temporary(path, width, height))
    }
}

/// Outcome of one verify or enroll call, returned as JSON over D-Bus.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub session_id: Uuid,
    pub mode: CaptureMode,
    pub identity: String,
    pub state: SessionState,
    pub success: bool,
    pub timed_out: bool,
    pub matched_id: Option<String>,
    pub display_name: Option<String>,
    pub confidence: Option<f32>,
    pub accepted_poses: Vec<AcceptedPose>,
    pub error: Option<String>,
    pub message: Option<String>,
}

/// Runs capture sessions one at a time against shared collaborators.
pub struct Engine {
    config: Config,
    deps: SessionDeps,
    gate: tokio::sync::Mutex<()>,
    active: Mutex<Option<CaptureSession>>,
}

impl Engine {
    /// Open the camera, load the model and build the HTTP collaborators.
    ///
    /// Fails fast if any of them is unavailable.
    pub async fn start(config: Config) -> Result<Self, EngineError> {
        std::fs::create_dir_all(&config.scratch_dir)?;

        let camera = Camera::open(&config.camera_device)?;
        tracing::info!(
            device = %config.camera_device,
            width = camera.width,
            height = camera.height,
            fourcc = ?camera.fourcc,
            "camera opened"
        );
        if config.warmup_frames > 0 {
            tracing::info!(count = config.warmup_frames, "discarding warmup frames");
            for _ in 0..config.warmup_frames {
                let _ = camera.capture_frame();
            }
        }

        let loader =
            OnnxLoader::new(config.model_path.clone()).with_intra_threads(config.intra_threads);
        let runtime: SharedRuntime = Arc::new(EmbeddingRuntime::new(loader, InputSpec::ARCFACE));
        runtime.ensure_loaded().await?;
        tracing::info!(path = %config.model_path.display(), "embedding runtime loaded");

        let http = remote::http_client(config.request_timeout())?;
        let api = Arc::new(ApiClient::new(
            http.clone(),
            &config.api_base_url,
            config.api_token.clone(),
        ));
        let deps = SessionDeps {
            frames: Arc::new(CameraSource::new(
                camera,
                config.scratch_dir.clone(),
                config.max_dark_attempts,
            )),
            detector: Arc::new(HttpDetector::new(http, config.detector_url.clone())),
            runtime,
            preprocessor: Arc::new(Preprocessor::new(
                InputSpec::ARCFACE,
                config.scratch_dir.clone(),
            )),
            client: api.clone(),
            recorder: api,
        };
        Ok(Self::with_deps(config, deps))
    }

    pub fn with_deps(config: Config, deps: SessionDeps) -> Self {
        Self {
            config,
            deps,
            gate: tokio::sync::Mutex::new(()),
            active: Mutex::new(None),
        }
    }

    fn active(&self) -> std::sync::MutexGuard<'_, Option<CaptureSession>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a session to completion, cancellation, a blocking error or the timeout.
    pub async fn run_session(
        &self,
        mode: CaptureMode,
        identity: &str,
    ) -> Result<SessionReport, EngineError> {
        let Ok(_gate) = self.gate.try_lock() else {
            return Err(EngineError::Busy);
        };

        let session = CaptureSession::new(self.config.session(mode, identity), self.deps.clone());
        *self.active() = Some(session.clone());
        tracing::info!(session = %session.id(), ?mode, identity, "session begin");

        let timeout = self.config.session_timeout();
        let (status, timed_out) = match tokio::time::timeout(timeout, session.run()).await {
            Ok(status) => (status, false),
            Err(_) => {
                tracing::warn!(
                    session = %session.id(),
                    secs = timeout.as_secs(),
                    "session timed out"
                );
                (session.status(), true)
            }
        };
        session.close();
        *self.active() = None;

        let verified = session.verified();
        let report = SessionReport {
            session_id: session.id(),
            mode,
            identity: identity.to_string(),
            state: status.state,
            success: status.state == SessionState::Success,
            timed_out,
            matched_id: verified.as_ref().and_then(|v| v.matched_id.clone()),
            display_name: verified.as_ref().and_then(|v| v.display_name.clone()),
            confidence: verified.as_ref().map(|v| v.confidence),
            accepted_poses: session.accepted_poses(),
            error: status.blocking,
            message: status.last_reason,
        };
        tracing::info!(
            session = %report.session_id,
            state = ?report.state,
            success = report.success,
            timed_out,
            "session end"
        );
        Ok(report)
    }

    /// Close the running session, if any.
    pub fn cancel(&self) -> bool {
        match self.active().as_ref() {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    pub fn status_json(&self) -> serde_json::Value {
        let active = self.active().as_ref().map(|s| {
            serde_json::json!({
                "id": s.id(),
                "mode": s.mode(),
                "status": s.status(),
            })
        });
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": self.config.camera_device,
            "model_loaded": self.deps.runtime.is_loaded(),
            "camera_ready": self.deps.frames.is_ready(),
            "session": active,
        })
    }
}
