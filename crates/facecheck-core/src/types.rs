use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Output dimension of the ArcFace embedding network.
pub const EMBEDDING_DIM: usize = 512;

/// Face bounding box in still-frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Bounds {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// Facial landmark kinds, using ML Kit's numbering where a detector reports codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LandmarkKind {
    MouthBottom,
    LeftCheek,
    LeftEar,
    LeftEye,
    MouthLeft,
    NoseBase,
    RightCheek,
    RightEar,
    RightEye,
    MouthRight,
    Other(String),
}

impl LandmarkKind {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::MouthBottom,
            1 => Self::LeftCheek,
            3 => Self::LeftEar,
            4 => Self::LeftEye,
            5 => Self::MouthLeft,
            6 => Self::NoseBase,
            7 => Self::RightCheek,
            9 => Self::RightEar,
            10 => Self::RightEye,
            11 => Self::MouthRight,
            other => Self::Other(other.to_string()),
        }
    }

    /// Parse a label in any of the spellings detectors use
    /// (`leftEye`, `LEFT_EYE`, `left_eye`, `left-eye`).
    pub fn from_label(label: &str) -> Self {
        let key: String = label
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match key.as_str() {
            "mouthbottom" | "bottommouth" => Self::MouthBottom,
            "leftcheek" => Self::LeftCheek,
            "leftear" => Self::LeftEar,
            "lefteye" => Self::LeftEye,
            "mouthleft" | "leftmouth" => Self::MouthLeft,
            "nosebase" | "nose" => Self::NoseBase,
            "rightcheek" => Self::RightCheek,
            "rightear" => Self::RightEar,
            "righteye" => Self::RightEye,
            "mouthright" | "rightmouth" => Self::MouthRight,
            _ => Self::Other(label.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub kind: LandmarkKind,
    pub position: Point,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contour {
    /// Normalized contour name, e.g. `face`, `left_eye`, `upper_lip_top`.
    pub kind: String,
    pub points: Vec<Point>,
}

/// Head Euler angles in degrees: `x` = pitch, `y` = yaw, `z` = roll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HeadAngles {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl HeadAngles {
    pub fn yaw(&self) -> f32 {
        self.y
    }

    pub fn pitch(&self) -> f32 {
        self.x
    }

    /// Largest absolute rotation across the three axes.
    pub fn magnitude(&self) -> f32 {
        [self.x, self.y, self.z]
            .iter()
            .filter(|a| a.is_finite())
            .fold(0.0f32, |m, a| m.max(a.abs()))
    }
}

/// Canonical face record, produced from a detector payload by
/// [`crate::adapter::normalize_face`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// `None` when the detector omitted bounds or any bound field was non-numeric.
    pub bounds: Option<Bounds>,
    pub landmarks: Vec<Landmark>,
    pub contours: Vec<Contour>,
    pub head_angles: HeadAngles,
    pub left_eye_open: Option<f32>,
    pub right_eye_open: Option<f32>,
    pub smiling: Option<f32>,
    pub tracking_id: Option<i64>,
    pub confidence: Option<f32>,
}

impl DetectionResult {
    /// Mean of the available eye-open probabilities.
    pub fn eye_open(&self) -> Option<f32> {
        match (self.left_eye_open, self.right_eye_open) {
            (Some(l), Some(r)) => Some((l + r) / 2.0),
            (Some(p), None) | (None, Some(p)) => Some(p),
            (None, None) => None,
        }
    }
}

/// Pixel dimensions of the still a detection refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn area(&self) -> f32 {
        self.width as f32 * self.height as f32
    }
}

/// Unit-norm face embedding.
///
/// Only obtainable through [`crate::runtime::l2_normalize`], so every value
/// in circulation satisfies the unit-norm invariant. `Debug` never prints
/// the vector.
#[derive(Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    pub(crate) fn from_normalized(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }
}

impl fmt::Debug for Embedding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Embedding")
            .field("dim", &self.values.len())
            .finish_non_exhaustive()
    }
}

/// Advisory capture quality in [0, 100].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct QualityScore(f32);

impl QualityScore {
    pub const MAX: f32 = 100.0;

    pub fn new(value: f32) -> Self {
        if value.is_nan() {
            return Self(0.0);
        }
        Self(value.clamp(0.0, Self::MAX))
    }

    pub fn value(&self) -> f32 {
        self.0
    }

    /// Subtract a penalty, staying within range.
    pub fn penalized(self, points: f32) -> Self {
        Self::new(self.0 - points)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoseLabel {
    Front,
    Left,
    Right,
    Up,
}

impl PoseLabel {
    /// Collection order for enrollment.
    pub const SEQUENCE: [PoseLabel; 4] = [Self::Front, Self::Left, Self::Right, Self::Up];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Front => "front",
            Self::Left => "left",
            Self::Right => "right",
            Self::Up => "up",
        }
    }
}

impl fmt::Display for PoseLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    Verification,
    Enrollment,
}

/// One enrollment sample, built for a single `enroll` call and then dropped.
#[derive(Debug, Clone)]
pub struct PoseRecord {
    pub pose: PoseLabel,
    pub embedding: Embedding,
    pub quality_score: QualityScore,
    pub captured_at: DateTime<Utc>,
}

impl PoseRecord {
    pub fn new(pose: PoseLabel, embedding: Embedding, quality_score: QualityScore) -> Self {
        Self {
            pose,
            embedding,
            quality_score,
            captured_at: Utc::now(),
        }
    }

    /// Embedding-free summary kept by the session after a successful enroll.
    pub fn summary(&self) -> AcceptedPose {
        AcceptedPose {
            pose: self.pose,
            quality_score: self.quality_score,
            captured_at: self.captured_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcceptedPose {
    pub pose: PoseLabel,
    pub quality_score: QualityScore,
    pub captured_at: DateTime<Utc>,
}
