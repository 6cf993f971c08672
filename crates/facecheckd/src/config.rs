use facecheck_core::quality::{AdmissionThresholds, QualityConfig};
use facecheck_core::{CaptureMode, SessionConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONFIG_PATH: &str = "/etc/facecheck/facecheck.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Daemon configuration: defaults, then the TOML file, then `FACECHECK_*` variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    /// Dequeues tried per still before giving up on dark frames.
    pub max_dark_attempts: usize,
    /// Frames discarded after opening the camera (AGC/AE settling).
    pub warmup_frames: usize,
    /// ArcFace ONNX model file.
    pub model_path: PathBuf,
    pub intra_threads: usize,
    /// Where stills and crop scratch files are written.
    pub scratch_dir: PathBuf,
    /// Face detector endpoint; receives the JPEG still.
    pub detector_url: String,
    /// Base URL of the matcher and attendance API.
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub request_timeout_secs: u64,
    /// Upper bound on one verify/enroll call.
    pub session_timeout_secs: u64,
    pub tick_interval_ms: u64,
    pub cooldown_ms: u64,
    pub fallback_penalty: f32,
    pub verify_min_face_area: f32,
    pub verify_max_rotation: f32,
    pub enroll_min_face_area: f32,
    pub enroll_max_rotation: f32,
    pub center_min: f32,
    pub center_max: f32,
}

impl Default for Config {
    fn default() -> Self {
        let verify = AdmissionThresholds::VERIFICATION;
        let enroll = AdmissionThresholds::ENROLLMENT;
        Self {
            camera_device: "/dev/video0".to_string(),
            max_dark_attempts: 5,
            warmup_frames: 4,
            model_path: PathBuf::from("/usr/share/facecheck/models/w600k_r50.onnx"),
            intra_threads: 2,
            scratch_dir: std::env::temp_dir().join("facecheck"),
            detector_url: "http://127.0.0.1:8090/detect".to_string(),
            api_base_url: "http://127.0.0.1:8080/api".to_string(),
            api_token: None,
            request_timeout_secs: 10,
            session_timeout_secs: 60,
            tick_interval_ms: 750,
            cooldown_ms: 3000,
            fallback_penalty: 15.0,
            verify_min_face_area: verify.min_face_area,
            verify_max_rotation: verify.max_rotation,
            enroll_min_face_area: enroll.min_face_area,
            enroll_max_rotation: enroll.max_rotation,
            center_min: verify.center_min,
            center_max: verify.center_max,
        }
    }
}

impl Config {
    /// Load from `FACECHECK_CONFIG` (or the default path) and the environment.
    ///
    /// A missing file at the default path is not an error; a missing file
    /// named explicitly is.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var("FACECHECK_CONFIG").ok();
        let path = explicit.as_deref().unwrap_or(DEFAULT_CONFIG_PATH);
        let mut config = if explicit.is_some() || Path::new(path).exists() {
            Self::from_file(Path::new(path))?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Override fields from `FACECHECK_*` variables. Unparseable values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(&format!("FACECHECK_{key}"));

        if let Some(v) = var("CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = var("MODEL_PATH") {
            self.model_path = PathBuf::from(v);
        }
        if let Some(v) = var("SCRATCH_DIR") {
            self.scratch_dir = PathBuf::from(v);
        }
        if let Some(v) = var("DETECTOR_URL") {
            self.detector_url = v;
        }
        if let Some(v) = var("API_BASE_URL") {
            self.api_base_url = v;
        }
        if let Some(v) = var("API_TOKEN") {
            self.api_token = Some(v).filter(|t| !t.is_empty());
        }

        parse_into(&var, "MAX_DARK_ATTEMPTS", &mut self.max_dark_attempts);
        parse_into(&var, "WARMUP_FRAMES", &mut self.warmup_frames);
        parse_into(&var, "INTRA_THREADS", &mut self.intra_threads);
        parse_into(&var, "REQUEST_TIMEOUT_SECS", &mut self.request_timeout_secs);
        parse_into(&var, "SESSION_TIMEOUT_SECS", &mut self.session_timeout_secs);
        parse_into(&var, "TICK_INTERVAL_MS", &mut self.tick_interval_ms);
        parse_into(&var, "COOLDOWN_MS", &mut self.cooldown_ms);
        parse_into(&var, "FALLBACK_PENALTY", &mut self.fallback_penalty);
        parse_into(&var, "VERIFY_MIN_FACE_AREA", &mut self.verify_min_face_area);
        parse_into(&var, "VERIFY_MAX_ROTATION", &mut self.verify_max_rotation);
        parse_into(&var, "ENROLL_MIN_FACE_AREA", &mut self.enroll_min_face_area);
        parse_into(&var, "ENROLL_MAX_ROTATION", &mut self.enroll_max_rotation);
        parse_into(&var, "CENTER_MIN", &mut self.center_min);
        parse_into(&var, "CENTER_MAX", &mut self.center_max);
    }

    pub fn quality(&self) -> QualityConfig {
        QualityConfig {
            verification: AdmissionThresholds {
                min_face_area: self.verify_min_face_area,
                max_rotation: self.verify_max_rotation,
                center_min: self.center_min,
                center_max: self.center_max,
            },
            enrollment: AdmissionThresholds {
                min_face_area: self.enroll_min_face_area,
                max_rotation: self.enroll_max_rotation,
                center_min: self.center_min,
                center_max: self.center_max,
            },
        }
    }

    pub fn session(&self, mode: CaptureMode, identity: &str) -> SessionConfig {
        SessionConfig {
            mode,
            identity: identity.to_string(),
            tick_interval: Duration::from_millis(self.tick_interval_ms.max(1)),
            cooldown: Duration::from_millis(self.cooldown_ms),
            quality: self.quality(),
            fallback_penalty: self.fallback_penalty,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

fn parse_into<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = var(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable FACECHECK_ setting"),
    }
}
