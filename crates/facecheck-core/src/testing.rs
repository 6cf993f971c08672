//! Fakes for the collaborator traits, shared by the unit tests.

use crate::capture::{
    CaptureError, DetectorError, DetectorOptions, FaceDetector, FrameSource, StillFrame,
};
use crate::matcher::{
    AttendanceRecord, AttendanceRecorder, EnrollResponse, TransportError, VerificationClient,
    VerifyResponse,
};
use crate::preprocess::Preprocessor;
use crate::runtime::{BackendLoader, EmbeddingBackend, EmbeddingRuntime, InputSpec, RuntimeError};
use crate::session::SessionDeps;
use crate::types::{Embedding, PoseLabel, PoseRecord, EMBEDDING_DIM};
use async_trait::async_trait;
use image::{DynamicImage, Rgb, RgbImage};
use ndarray::Array4;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// --- Embedding backends ---

type RunFn = dyn Fn(&Array4<f32>) -> Vec<f32> + Send + Sync;

/// Backend (and its own loader) driven by a closure.
#[derive(Clone)]
pub struct FnBackend {
    f: Arc<RunFn>,
}

impl FnBackend {
    pub fn new(f: impl Fn(&Array4<f32>) -> Vec<f32> + Send + Sync + 'static) -> Self {
        Self { f: Arc::new(f) }
    }

    /// Deterministic, input-dependent, never-zero output.
    pub fn pattern() -> Self {
        Self::new(|input| {
            let mean = input.mean().unwrap_or(0.0);
            (0..EMBEDDING_DIM)
                .map(|i| 1.0 + (i % 7) as f32 * 0.1 + mean * ((i % 3) as f32 - 1.0))
                .collect()
        })
    }

    pub fn constant(v: f32) -> Self {
        Self::new(move |_| vec![v; EMBEDDING_DIM])
    }
}

impl EmbeddingBackend for FnBackend {
    fn run(&self, input: Array4<f32>) -> Result<Vec<f32>, RuntimeError> {
        Ok((self.f)(&input))
    }
}

impl BackendLoader for FnBackend {
    fn load(&self) -> Result<Box<dyn EmbeddingBackend>, RuntimeError> {
        Ok(Box::new(self.clone()))
    }
}

/// Loader that blocks for a while before succeeding.
pub struct SlowLoader {
    delay: Duration,
}

impl SlowLoader {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl BackendLoader for SlowLoader {
    fn load(&self) -> Result<Box<dyn EmbeddingBackend>, RuntimeError> {
        std::thread::sleep(self.delay);
        Ok(Box::new(FnBackend::pattern()))
    }
}

/// Loader that fails its first `n` calls.
pub struct FailingLoader {
    remaining_failures: AtomicUsize,
}

impl FailingLoader {
    pub fn failing_first(n: usize) -> Self {
        Self {
            remaining_failures: AtomicUsize::new(n),
        }
    }

    pub fn always() -> Self {
        Self::failing_first(usize::MAX)
    }
}

impl BackendLoader for FailingLoader {
    fn load(&self) -> Result<Box<dyn EmbeddingBackend>, RuntimeError> {
        let left = self.remaining_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.remaining_failures.store(left - 1, Ordering::SeqCst);
            return Err(RuntimeError::ModelNotFound("/models/w600k_r50.onnx".into()));
        }
        Ok(Box::new(FnBackend::pattern()))
    }
}

// --- Camera ---

/// Serves the same on-disk still every tick, optionally failing first.
pub struct FakeFrames {
    still: PathBuf,
    width: u32,
    height: u32,
    ready: AtomicBool,
    errors: Mutex<VecDeque<CaptureError>>,
    captures: AtomicUsize,
}

impl FakeFrames {
    pub fn new(dir: &std::path::Path) -> Self {
        let (width, height) = (640, 480);
        let still = dir.join("still.png");
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([180, 150, 120])))
            .save(&still)
            .unwrap();
        Self {
            still,
            width,
            height,
            ready: AtomicBool::new(true),
            errors: Mutex::new(VecDeque::new()),
            captures: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, error: CaptureError) {
        lock(&self.errors).push_back(error);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSource for FakeFrames {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn capture_still(&self) -> Result<StillFrame, CaptureError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = lock(&self.errors).pop_front() {
            return Err(e);
        }
        Ok(StillFrame::persistent(&self.still, self.width, self.height))
    }
}

// --- Detector ---

/// Returns scripted payloads in order, then the fallback payload forever.
pub struct ScriptedDetector {
    script: Mutex<VecDeque<Result<Value, DetectorError>>>,
    fallback: Mutex<Value>,
    seen: Mutex<Vec<DetectorOptions>>,
}

impl ScriptedDetector {
    pub fn new(script: Vec<Result<Value, DetectorError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: Mutex::new(json!([])),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn faces(payloads: Vec<Value>) -> Self {
        Self::new(payloads.into_iter().map(Ok).collect())
    }

    /// Payload served once the script runs out.
    pub fn always(payload: Value) -> Self {
        let d = Self::new(Vec::new());
        *lock(&d.fallback) = payload;
        d
    }

    pub fn push(&self, payload: Value) {
        lock(&self.script).push_back(Ok(payload));
    }

    pub fn options_seen(&self) -> Vec<DetectorOptions> {
        lock(&self.seen).clone()
    }
}

#[async_trait]
impl FaceDetector for ScriptedDetector {
    async fn detect(
        &self,
        _still: &StillFrame,
        options: &DetectorOptions,
    ) -> Result<Value, DetectorError> {
        lock(&self.seen).push(options.clone());
        match lock(&self.script).pop_front() {
            Some(step) => step,
            None => Ok(lock(&self.fallback).clone()),
        }
    }
}

/// A well-lit, centered 200×200 face in a 640×480 frame.
pub fn face_json(yaw: f32, pitch: f32) -> Value {
    json!({
        "bounds": { "x": 220, "y": 140, "width": 200, "height": 200 },
        "headEulerAngleX": pitch,
        "headEulerAngleY": yaw,
        "headEulerAngleZ": 0,
        "leftEyeOpenProbability": 0.9,
        "rightEyeOpenProbability": 0.9,
        "trackingId": 1
    })
}

pub fn pose_json(pose: PoseLabel) -> Value {
    match pose {
        PoseLabel::Front => face_json(0.0, 0.0),
        PoseLabel::Left => face_json(-20.0, 0.0),
        PoseLabel::Right => face_json(20.0, 0.0),
        PoseLabel::Up => face_json(0.0, 20.0),
    }
}

// --- Remote matcher ---

#[derive(Debug, Clone)]
pub struct EnrollCall {
    pub identity: String,
    pub pose: PoseLabel,
    pub quality: f32,
    pub norm: f32,
}

/// Records calls and answers from scripted queues (match / success by default).
pub struct FakeClient {
    verify_script: Mutex<VecDeque<Result<VerifyResponse, TransportError>>>,
    enroll_script: Mutex<VecDeque<Result<EnrollResponse, TransportError>>>,
    verify_calls: Mutex<Vec<(String, usize, f32)>>,
    enroll_calls: Mutex<Vec<EnrollCall>>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    pub started: Notify,
}

impl FakeClient {
    pub fn new() -> Self {
        Self {
            verify_script: Mutex::new(VecDeque::new()),
            enroll_script: Mutex::new(VecDeque::new()),
            verify_calls: Mutex::new(Vec::new()),
            enroll_calls: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            started: Notify::new(),
        }
    }

    pub fn matched() -> VerifyResponse {
        VerifyResponse {
            success: true,
            is_match: true,
            confidence: 0.91,
            matched_id: Some("emp-7".into()),
            display_name: Some("Test Person".into()),
            message: None,
        }
    }

    pub fn not_matched() -> VerifyResponse {
        VerifyResponse {
            success: true,
            is_match: false,
            confidence: 0.12,
            message: Some("face does not match".into()),
            ..Default::default()
        }
    }

    pub fn push_verify(&self, r: Result<VerifyResponse, TransportError>) {
        lock(&self.verify_script).push_back(r);
    }

    pub fn push_enroll(&self, r: Result<EnrollResponse, TransportError>) {
        lock(&self.enroll_script).push_back(r);
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    pub fn verify_calls(&self) -> Vec<(String, usize, f32)> {
        lock(&self.verify_calls).clone()
    }

    pub fn enroll_calls(&self) -> Vec<EnrollCall> {
        lock(&self.enroll_calls).clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.started.notify_waiters();
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl VerificationClient for FakeClient {
    async fn verify(
        &self,
        identity: &str,
        embedding: &Embedding,
    ) -> Result<VerifyResponse, TransportError> {
        self.enter().await;
        lock(&self.verify_calls).push((identity.to_string(), embedding.len(), embedding.norm()));
        let r = lock(&self.verify_script)
            .pop_front()
            .unwrap_or_else(|| Ok(Self::matched()));
        self.leave();
        r
    }

    async fn enroll(
        &self,
        identity: &str,
        record: &PoseRecord,
    ) -> Result<EnrollResponse, TransportError> {
        self.enter().await;
        lock(&self.enroll_calls).push(EnrollCall {
            identity: identity.to_string(),
            pose: record.pose,
            quality: record.quality_score.value(),
            norm: record.embedding.norm(),
        });
        let r = lock(&self.enroll_script).pop_front().unwrap_or_else(|| {
            Ok(EnrollResponse {
                success: true,
                message: None,
            })
        });
        self.leave();
        r
    }
}

#[derive(Default)]
pub struct FakeRecorder {
    records: Mutex<Vec<AttendanceRecord>>,
    fail: AtomicBool,
}

impl FakeRecorder {
    pub fn failing() -> Self {
        let r = Self::default();
        r.fail.store(true, Ordering::SeqCst);
        r
    }

    pub fn records(&self) -> Vec<AttendanceRecord> {
        lock(&self.records).clone()
    }
}

#[async_trait]
impl AttendanceRecorder for FakeRecorder {
    async fn record(&self, record: &AttendanceRecord) -> Result<(), TransportError> {
        lock(&self.records).push(record.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Status(503));
        }
        Ok(())
    }
}

// --- Wiring ---

/// All fakes for one session, plus the temp directory backing the still and scratch files.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub frames: Arc<FakeFrames>,
    pub detector: Arc<ScriptedDetector>,
    pub runtime: Arc<EmbeddingRuntime>,
    pub client: Arc<FakeClient>,
    pub recorder: Arc<FakeRecorder>,
    pub preprocessor: Arc<Preprocessor>,
}

impl Harness {
    pub fn new(detector: ScriptedDetector) -> Self {
        Self::with_runtime(
            detector,
            EmbeddingRuntime::new(FnBackend::pattern(), InputSpec::ARCFACE),
        )
    }

    pub fn with_runtime(detector: ScriptedDetector, runtime: EmbeddingRuntime) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        std::fs::create_dir(&scratch).unwrap();
        Self {
            frames: Arc::new(FakeFrames::new(dir.path())),
            detector: Arc::new(detector),
            runtime: Arc::new(runtime),
            client: Arc::new(FakeClient::new()),
            recorder: Arc::new(FakeRecorder::default()),
            preprocessor: Arc::new(Preprocessor::new(InputSpec::ARCFACE, scratch)),
            dir,
        }
    }

    pub fn with_recorder(mut self, recorder: FakeRecorder) -> Self {
        self.recorder = Arc::new(recorder);
        self
    }

    pub fn deps(&self) -> SessionDeps {
        SessionDeps {
            frames: self.frames.clone(),
            detector: self.detector.clone(),
            runtime: self.runtime.clone(),
            preprocessor: self.preprocessor.clone(),
            client: self.client.clone(),
            recorder: self.recorder.clone(),
        }
    }

    pub fn scratch_is_empty(&self) -> bool {
        std::fs::read_dir(self.preprocessor.scratch_dir())
            .unwrap()
            .next()
            .is_none()
    }
}
