//! Capture session: the tick-driven state machine behind verify and enroll.
//!
//! Each tick acquires one still, detects and gates the primary face, and, for
//! an admitted face, preprocesses it, computes an embedding and calls the
//! remote matcher. At most one tick pipeline runs at a time per session and
//! every state change goes through [`SessionStatus::apply`].

use crate::capture::{self, FaceDetector, FrameSource, StillFrame};
use crate::matcher::{AttendanceRecord, AttendanceRecorder, VerificationClient, VerifyResponse};
use crate::preprocess::Preprocessor;
use crate::quality::{self, QualityConfig, Rejection, ScoringMode};
use crate::runtime::{RuntimeError, SharedRuntime};
use crate::types::{AcceptedPose, CaptureMode, DetectionResult, Embedding, PoseLabel, PoseRecord};
use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Detecting,
    Verifying,
    Success,
    Error,
    Closed,
}

impl SessionState {
    /// No event except `Close` (for `Success`) changes these.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Closed)
    }
}

/// Index of the next enrollment pose to collect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PoseCursor(u8);

impl PoseCursor {
    pub fn index(&self) -> usize {
        self.0 as usize
    }

    /// The pose being collected, or `None` once all are in.
    pub fn target(&self) -> Option<PoseLabel> {
        PoseLabel::SEQUENCE.get(self.index()).copied()
    }

    pub fn is_complete(&self) -> bool {
        self.index() >= PoseLabel::SEQUENCE.len()
    }

    pub fn has_accepted(&self, pose: PoseLabel) -> bool {
        PoseLabel::SEQUENCE
            .iter()
            .position(|p| *p == pose)
            .is_some_and(|i| i < self.index())
    }

    fn advance(self) -> Self {
        Self((self.0 + 1).min(PoseLabel::SEQUENCE.len() as u8))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event {
    Start,
    Admit,
    Matched,
    Rejected,
    PoseAccepted(PoseLabel),
    AttemptAborted,
    CooldownElapsed,
    Fatal(String),
    Retry,
    Close,
}

/// Observable session status, published on a watch channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: SessionState,
    pub cursor: PoseCursor,
    /// Set by unrecoverable failures; cleared only by [`CaptureSession::retry`].
    pub blocking: Option<String>,
    /// Latest user-facing hint (rejection reason, pose prompt, matcher message).
    pub last_reason: Option<String>,
}

impl SessionStatus {
    fn new() -> Self {
        Self {
            state: SessionState::Idle,
            cursor: PoseCursor::default(),
            blocking: None,
            last_reason: None,
        }
    }

    /// Apply one event. Returns false (and changes nothing) when the event
    /// is not valid in the current state.
    pub(crate) fn apply(&mut self, event: Event) -> bool {
        use SessionState::*;
        match (self.state, event) {
            (Closed, _) => false,
            (_, Event::Close) => {
                self.state = Closed;
                true
            }
            (Success, _) => false,
            (Idle, Event::Start) => {
                self.state = Detecting;
                true
            }
            (Detecting, Event::Admit) => {
                self.state = Verifying;
                true
            }
            (Verifying, Event::Matched) => {
                self.state = Success;
                true
            }
            (Verifying, Event::Rejected) => {
                self.state = Error;
                true
            }
            (Verifying, Event::PoseAccepted(pose)) => {
                // Only the pose under the cursor can advance it.
                if self.cursor.target() == Some(pose) {
                    self.cursor = self.cursor.advance();
                }
                self.state = if self.cursor.is_complete() { Success } else { Detecting };
                true
            }
            (Verifying, Event::AttemptAborted) => {
                self.state = Detecting;
                true
            }
            (Error, Event::CooldownElapsed) if self.blocking.is_none() => {
                self.state = Detecting;
                true
            }
            (_, Event::Fatal(reason)) => {
                self.state = Error;
                self.blocking = Some(reason);
                true
            }
            (Error, Event::Retry) if self.blocking.is_some() => {
                self.blocking = None;
                self.state = Detecting;
                true
            }
            _ => false,
        }
    }
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Not detecting, another tick in flight, or a dependency not ready.
    Skipped,
    AcquisitionFailed,
    NoFace,
    Rejected(Rejection),
    PoseMismatch {
        wanted: PoseLabel,
        observed: Option<PoseLabel>,
    },
    Verified(VerifyResponse),
    NotMatched,
    PoseEnrolled(PoseLabel),
    EnrollmentComplete,
    EnrollFailed(PoseLabel),
    Aborted(String),
    /// The session was closed while the attempt was in flight.
    Discarded,
    Blocked(String),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: CaptureMode,
    pub identity: String,
    pub tick_interval: Duration,
    pub cooldown: Duration,
    pub quality: QualityConfig,
    /// Points taken off the enrollment score when the face crop fell back to the full frame.
    pub fallback_penalty: f32,
}

impl SessionConfig {
    pub fn new(mode: CaptureMode, identity: impl Into<String>) -> Self {
        Self {
            mode,
            identity: identity.into(),
            tick_interval: Duration::from_millis(750),
            cooldown: Duration::from_secs(3),
            quality: QualityConfig::default(),
            fallback_penalty: 15.0,
        }
    }

    pub fn verification(identity: impl Into<String>) -> Self {
        Self::new(CaptureMode::Verification, identity)
    }

    pub fn enrollment(identity: impl Into<String>) -> Self {
        Self::new(CaptureMode::Enrollment, identity)
    }
}

/// Collaborators a session drives.
#[derive(Clone)]
pub struct SessionDeps {
    pub frames: Arc<dyn FrameSource>,
    pub detector: Arc<dyn FaceDetector>,
    pub runtime: SharedRuntime,
    pub preprocessor: Arc<Preprocessor>,
    pub client: Arc<dyn VerificationClient>,
    pub recorder: Arc<dyn AttendanceRecorder>,
}

struct Inner {
    id: Uuid,
    config: SessionConfig,
    deps: SessionDeps,
    status: watch::Sender<SessionStatus>,
    pipeline: tokio::sync::Mutex<()>,
    current_face: Mutex<Option<DetectionResult>>,
    accepted: Mutex<Vec<AcceptedPose>>,
    verified: Mutex<Option<VerifyResponse>>,
    span: tracing::Span,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one capture session. Clones share the same session.
#[derive(Clone)]
pub struct CaptureSession {
    inner: Arc<Inner>,
}

impl CaptureSession {
    pub fn new(config: SessionConfig, deps: SessionDeps) -> Self {
        let id = Uuid::new_v4();
        let span = tracing::info_span!("capture_session", %id, mode = ?config.mode);
        let (status, _) = watch::channel(SessionStatus::new());
        Self {
            inner: Arc::new(Inner {
                id,
                config,
                deps,
                status,
                pipeline: tokio::sync::Mutex::new(()),
                current_face: Mutex::new(None),
                accepted: Mutex::new(Vec::new()),
                verified: Mutex::new(None),
                span,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn mode(&self) -> CaptureMode {
        self.inner.config.mode
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    /// Primary face of the latest detection, for overlays.
    pub fn current_face(&self) -> Option<DetectionResult> {
        lock(&self.inner.current_face).clone()
    }

    /// Poses enrolled so far, in order. Embeddings are not retained.
    pub fn accepted_poses(&self) -> Vec<AcceptedPose> {
        lock(&self.inner.accepted).clone()
    }

    /// The matcher's answer once verification has succeeded.
    pub fn verified(&self) -> Option<VerifyResponse> {
        lock(&self.inner.verified).clone()
    }

    fn transition(&self, event: Event) -> bool {
        let label = format!("{event:?}");
        let applied = self.inner.status.send_if_modified(|s| s.apply(event));
        if applied {
            let status = self.inner.status.borrow();
            debug!(
                event = %label,
                state = ?status.state,
                cursor = status.cursor.index(),
                "session transition"
            );
        }
        applied
    }

    fn note(&self, reason: impl Into<String>) {
        let reason = Some(reason.into());
        self.inner.status.send_if_modified(|s| {
            if s.state == SessionState::Closed || s.last_reason == reason {
                return false;
            }
            s.last_reason = reason;
            true
        });
    }

    /// Move `Idle → Detecting` and load the embedding runtime.
    ///
    /// A load failure leaves the session blocked until [`Self::retry`].
    pub async fn start(&self) -> SessionStatus {
        async {
            if self.transition(Event::Start) {
                info!(identity = %self.inner.config.identity, "capture session started");
                if let Some(reason) = self.load_runtime().await {
                    warn!(reason, "capture session blocked at start");
                }
                if let Some(target) = self.enrollment_target() {
                    self.note(format!("look {target}"));
                }
            }
        }
        .instrument(self.inner.span.clone())
        .await;
        self.status()
    }

    /// Clear a blocking error, reloading the runtime first if it is not loaded.
    pub async fn retry(&self) -> bool {
        async {
            if self.status().blocking.is_none() {
                return false;
            }
            if !self.inner.deps.runtime.is_loaded() {
                if let Err(e) = self.inner.deps.runtime.ensure_loaded().await {
                    let reason = format!("embedding model unavailable: {e}");
                    self.inner.status.send_if_modified(|s| {
                        if s.state == SessionState::Error && s.blocking.is_some() {
                            s.blocking = Some(reason);
                            return true;
                        }
                        false
                    });
                    return false;
                }
            }
            let retried = self.transition(Event::Retry);
            if retried {
                info!("capture session resumed after retry");
            }
            retried
        }
        .instrument(self.inner.span.clone())
        .await
    }

    /// Close the session. Results still in flight are discarded.
    pub fn close(&self) {
        if self.transition(Event::Close) {
            let _enter = self.inner.span.enter();
            info!("capture session closed");
        }
    }

    /// Tick at the configured interval until the session reaches a terminal
    /// state or a blocking error.
    pub async fn run(&self) -> SessionStatus {
        self.start().await;
        let mut ticker = tokio::time::interval(self.inner.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rx = self.subscribe();
        loop {
            {
                let status = rx.borrow_and_update();
                if status.state.is_terminal() || status.blocking.is_some() {
                    return status.clone();
                }
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return self.status();
                    }
                }
            }
        }
    }

    /// Run one acquisition → detection → gating → embedding → matcher pass.
    ///
    /// Returns [`TickOutcome::Skipped`] without side effects when another
    /// tick is in flight or the session is not detecting.
    pub async fn tick(&self) -> TickOutcome {
        let Ok(_pipeline) = self.inner.pipeline.try_lock() else {
            return TickOutcome::Skipped;
        };
        self.tick_locked().instrument(self.inner.span.clone()).await
    }

    async fn tick_locked(&self) -> TickOutcome {
        {
            let status = self.inner.status.borrow();
            if status.state != SessionState::Detecting || status.blocking.is_some() {
                return TickOutcome::Skipped;
            }
        }
        if !self.inner.deps.frames.is_ready() {
            return TickOutcome::Skipped;
        }
        if !self.inner.deps.runtime.is_loaded() {
            return match self.load_runtime().await {
                Some(reason) => TickOutcome::Blocked(reason),
                None => TickOutcome::Skipped,
            };
        }

        let still = match self.inner.deps.frames.capture_still().await {
            Ok(still) => still,
            Err(e) if e.is_fatal() => {
                let reason = e.to_string();
                warn!(error = %e, "camera unavailable");
                self.transition(Event::Fatal(reason.clone()));
                return TickOutcome::Blocked(reason);
            }
            Err(e) => {
                debug!(error = %e, "still capture failed; next tick retries");
                return TickOutcome::AcquisitionFailed;
            }
        };

        let faces = capture::detect_faces(self.inner.deps.detector.as_ref(), &still).await;
        let face = capture::primary_face(faces);
        *lock(&self.inner.current_face) = face.clone();
        let Some(face) = face else {
            return TickOutcome::NoFace;
        };

        match self.inner.config.mode {
            CaptureMode::Verification => self.verify_attempt(&still, face).await,
            CaptureMode::Enrollment => self.enroll_attempt(&still, face).await,
        }
    }

    async fn verify_attempt(&self, still: &StillFrame, face: DetectionResult) -> TickOutcome {
        let config = &self.inner.config;
        let thresholds = &config.quality.verification;
        if let Err(rejection) = quality::check_admissible(&face, still.size(), thresholds) {
            debug!(%rejection, "face not admitted");
            self.note(rejection.to_string());
            return TickOutcome::Rejected(rejection);
        }
        if !self.transition(Event::Admit) {
            return TickOutcome::Discarded;
        }

        let embedding = match self.extract(still, &face).await {
            Ok((embedding, _)) => embedding,
            Err(outcome) => return outcome,
        };
        let response = self.inner.deps.client.verify(&config.identity, &embedding).await;
        drop(embedding);

        match response {
            Ok(r) if r.is_confirmed() => {
                if !self.transition(Event::Matched) {
                    debug!("verification result arrived after close; discarded");
                    return TickOutcome::Discarded;
                }
                info!(
                    matched_id = r.matched_id.as_deref().unwrap_or("-"),
                    confidence = r.confidence,
                    "face verified"
                );
                if let Some(name) = &r.display_name {
                    self.note(format!("welcome, {name}"));
                }
                *lock(&self.inner.verified) = Some(r.clone());
                self.record_attendance(&r).await;
                TickOutcome::Verified(r)
            }
            Ok(r) => {
                let reason = r.message.unwrap_or_else(|| "face not recognized".to_string());
                self.fail_verification(reason).await
            }
            Err(e) => {
                warn!(error = %e, "verification request failed");
                self.fail_verification(e.to_string()).await
            }
        }
    }

    async fn fail_verification(&self, reason: String) -> TickOutcome {
        if !self.transition(Event::Rejected) {
            return TickOutcome::Discarded;
        }
        info!(reason, "verification not matched; cooling down");
        self.note(reason);
        self.sleep_unless_closed(self.inner.config.cooldown).await;
        self.transition(Event::CooldownElapsed);
        TickOutcome::NotMatched
    }

    async fn enroll_attempt(&self, still: &StillFrame, face: DetectionResult) -> TickOutcome {
        let Some(wanted) = self.enrollment_target() else {
            return TickOutcome::Skipped;
        };
        let config = &self.inner.config;
        let assessment = quality::assess(
            &face,
            still.size(),
            &config.quality.enrollment,
            ScoringMode::Enrollment,
        );
        if let Err(rejection) = assessment.admission {
            debug!(
                %rejection,
                pose = %wanted,
                score = assessment.score.value(),
                "face not admitted"
            );
            self.note(rejection.to_string());
            return TickOutcome::Rejected(rejection);
        }
        if !quality::matches_pose(&face.head_angles, wanted) {
            let observed = assessment.pose;
            debug!(wanted = %wanted, observed = ?observed, "pose mismatch");
            self.note(format!("look {wanted}"));
            return TickOutcome::PoseMismatch { wanted, observed };
        }
        if !self.transition(Event::Admit) {
            return TickOutcome::Discarded;
        }

        let (embedding, cropped) = match self.extract(still, &face).await {
            Ok(v) => v,
            Err(outcome) => return outcome,
        };
        let mut score = assessment.score;
        if !cropped {
            score = score.penalized(config.fallback_penalty);
        }
        let record = PoseRecord::new(wanted, embedding, score);
        let result = self.inner.deps.client.enroll(&config.identity, &record).await;

        match result {
            Ok(r) if r.success => {
                let summary = record.summary();
                drop(record);
                let mut accepted = lock(&self.inner.accepted);
                if !self.transition(Event::PoseAccepted(wanted)) {
                    debug!(pose = %wanted, "enrollment result arrived after close; discarded");
                    return TickOutcome::Discarded;
                }
                accepted.push(summary);
                drop(accepted);
                info!(pose = %wanted, score = score.value(), cropped, "pose enrolled");

                match self.enrollment_target() {
                    Some(next) => {
                        self.note(format!("look {next}"));
                        TickOutcome::PoseEnrolled(wanted)
                    }
                    None => {
                        info!("enrollment complete");
                        TickOutcome::EnrollmentComplete
                    }
                }
            }
            Ok(r) => {
                let reason = r.message.unwrap_or_else(|| format!("{wanted} pose not accepted"));
                self.enroll_failed(wanted, reason)
            }
            Err(e) => {
                warn!(error = %e, pose = %wanted, "enroll request failed");
                self.enroll_failed(wanted, e.to_string())
            }
        }
    }

    fn enroll_failed(&self, pose: PoseLabel, reason: String) -> TickOutcome {
        if !self.transition(Event::AttemptAborted) {
            return TickOutcome::Discarded;
        }
        info!(pose = %pose, reason, "pose not enrolled; retrying");
        self.note(reason);
        TickOutcome::EnrollFailed(pose)
    }

    fn enrollment_target(&self) -> Option<PoseLabel> {
        match self.inner.config.mode {
            CaptureMode::Enrollment => self.inner.status.borrow().cursor.target(),
            CaptureMode::Verification => None,
        }
    }

    /// Preprocess the face and compute its embedding off the async threads.
    ///
    /// On failure the attempt is already aborted (or blocked) and the
    /// returned outcome is final.
    async fn extract(
        &self,
        still: &StillFrame,
        face: &DetectionResult,
    ) -> Result<(Embedding, bool), TickOutcome> {
        let preprocessor = Arc::clone(&self.inner.deps.preprocessor);
        let path = still.path().to_path_buf();
        let bounds = face.bounds;
        let task =
            tokio::task::spawn_blocking(move || preprocessor.preprocess(&path, bounds.as_ref()));
        let prepared = match task.await {
            Ok(Ok(prepared)) => prepared,
            Ok(Err(e)) => return Err(self.abort(format!("preprocessing failed: {e}"))),
            Err(e) => return Err(self.abort(format!("preprocessing task failed: {e}"))),
        };

        let cropped = prepared.cropped;
        let runtime = Arc::clone(&self.inner.deps.runtime);
        let buffer = prepared.buffer;
        let embedding = tokio::task::spawn_blocking(move || runtime.infer(&buffer))
            .await
            .map_err(|e| RuntimeError::Inference(e.to_string()))
            .and_then(|r| r);

        embedding
            .map(|embedding| (embedding, cropped))
            .map_err(|e| self.abort(format!("embedding failed: {e}")))
    }

    fn abort(&self, reason: String) -> TickOutcome {
        if !self.transition(Event::AttemptAborted) {
            return TickOutcome::Discarded;
        }
        warn!(reason, "capture attempt aborted");
        TickOutcome::Aborted(reason)
    }

    /// Make sure the runtime is loaded; on failure block the session and return the reason.
    async fn load_runtime(&self) -> Option<String> {
        match self.inner.deps.runtime.ensure_loaded().await {
            Ok(()) => None,
            Err(e) => {
                let reason = format!("embedding model unavailable: {e}");
                warn!(error = %e, "embedding model failed to load");
                self.transition(Event::Fatal(reason.clone()));
                Some(reason)
            }
        }
    }

    async fn record_attendance(&self, response: &VerifyResponse) {
        let record = AttendanceRecord {
            identity: self.inner.config.identity.clone(),
            timestamp: Utc::now(),
            matched_id: response.matched_id.clone(),
            confidence: response.confidence,
        };
        if let Err(e) = self.inner.deps.recorder.record(&record).await {
            warn!(error = %e, "attendance not recorded; verification stands");
        }
    }

    async fn sleep_unless_closed(&self, duration: Duration) {
        let mut rx = self.subscribe();
        let closed = async {
            loop {
                let state = rx.borrow_and_update().state;
                if state == SessionState::Closed || rx.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = closed => {}
        }
    }
}
