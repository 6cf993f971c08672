use crate::engine::{Engine, EngineError};
use facecheck_core::CaptureMode;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.facecheck.Daemon1";
pub const OBJECT_PATH: &str = "/org/facecheck/Daemon1";

/// D-Bus interface for the facecheck daemon.
///
/// Bus name: org.facecheck.Daemon1
/// Object path: /org/facecheck/Daemon1
pub struct FacecheckService {
    engine: Arc<Engine>,
}

impl FacecheckService {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    async fn run(&self, mode: CaptureMode, identity: &str) -> zbus::fdo::Result<String> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("identity must not be empty".into()));
        }
        let report = self
            .engine
            .run_session(mode, identity)
            .await
            .map_err(|e| match e {
                EngineError::Busy => zbus::fdo::Error::LimitsExceeded(e.to_string()),
                other => zbus::fdo::Error::Failed(other.to_string()),
            })?;
        serde_json::to_string(&report).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }
}

#[interface(name = "org.facecheck.Daemon1")]
impl FacecheckService {
    /// Capture and verify a face for `identity`, recording attendance on a match.
    async fn verify(&self, identity: &str) -> zbus::fdo::Result<String> {
        tracing::info!(identity, "verify requested");
        self.run(CaptureMode::Verification, identity).await
    }

    /// Collect the four enrollment poses for `identity`.
    async fn enroll(&self, identity: &str) -> zbus::fdo::Result<String> {
        tracing::info!(identity, "enroll requested");
        self.run(CaptureMode::Enrollment, identity).await
    }

    /// Close the running session. Returns false when nothing was running.
    async fn cancel(&self) -> bool {
        let cancelled = self.engine.cancel();
        tracing::info!(cancelled, "cancel requested");
        cancelled
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.engine.status_json().to_string())
    }
}
