//! Face quality gating: admissibility, pose buckets and the advisory score.
//!
//! Everything here is a pure function of a [`DetectionResult`] and the
//! [`FrameSize`] of the still it came from.

use crate::types::{DetectionResult, FrameSize, HeadAngles, PoseLabel, QualityScore};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Gate thresholds for one capture mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdmissionThresholds {
    /// Minimum face area as a fraction of the frame area (exclusive).
    pub min_face_area: f32,
    /// Maximum absolute rotation on any single axis, in degrees.
    pub max_rotation: f32,
    /// Allowed range for the normalized box center on both axes.
    pub center_min: f32,
    pub center_max: f32,
}

impl AdmissionThresholds {
    pub const VERIFICATION: Self = Self {
        min_face_area: 0.001,
        max_rotation: 45.0,
        center_min: -0.5,
        center_max: 1.5,
    };

    pub const ENROLLMENT: Self = Self {
        min_face_area: 0.05,
        max_rotation: 40.0,
        center_min: -0.5,
        center_max: 1.5,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityConfig {
    pub verification: AdmissionThresholds,
    pub enrollment: AdmissionThresholds,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            verification: AdmissionThresholds::VERIFICATION,
            enrollment: AdmissionThresholds::ENROLLMENT,
        }
    }
}

/// Why a detected face was not admitted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Rejection {
    #[error("face has no usable bounds")]
    NoBounds,
    #[error("frame has zero area")]
    EmptyFrame,
    #[error("face too small: {area:.4} of frame (need > {min})")]
    TooSmall { area: f32, min: f32 },
    #[error("head rotated {degrees:.1}° on {axis} axis (max {max}°)")]
    Rotated { axis: char, degrees: f32, max: f32 },
    #[error("face center ({cx:.2}, {cy:.2}) outside frame margin")]
    OffFrame { cx: f32, cy: f32 },
}

/// Score allowance mode. Enrollment expects rotation, so it gets a larger free allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoringMode {
    Verification,
    Enrollment,
}

impl ScoringMode {
    pub fn rotation_allowance(&self) -> f32 {
        match self {
            Self::Verification => 30.0,
            Self::Enrollment => 45.0,
        }
    }
}

/// Face area divided by frame area, or `None` without bounds or with an empty frame.
pub fn normalized_area(face: &DetectionResult, frame: FrameSize) -> Option<f32> {
    let bounds = face.bounds?;
    let frame_area = frame.area();
    (frame_area > 0.0).then(|| bounds.area() / frame_area)
}

/// Check a face against the gate, returning the first failed criterion.
pub fn check_admissible(
    face: &DetectionResult,
    frame: FrameSize,
    thresholds: &AdmissionThresholds,
) -> Result<(), Rejection> {
    let bounds = face
        .bounds
        .filter(|b| b.width > 0.0 && b.height > 0.0)
        .ok_or(Rejection::NoBounds)?;
    if frame.width == 0 || frame.height == 0 {
        return Err(Rejection::EmptyFrame);
    }

    let area = bounds.area() / frame.area();
    if !(area > thresholds.min_face_area) {
        return Err(Rejection::TooSmall {
            area,
            min: thresholds.min_face_area,
        });
    }

    let angles = face.head_angles;
    for (axis, degrees) in [('x', angles.x), ('y', angles.y), ('z', angles.z)] {
        if !(degrees.abs() <= thresholds.max_rotation) {
            return Err(Rejection::Rotated {
                axis,
                degrees,
                max: thresholds.max_rotation,
            });
        }
    }

    let (cx, cy) = bounds.center();
    let cx = cx / frame.width as f32;
    let cy = cy / frame.height as f32;
    let range = thresholds.center_min..=thresholds.center_max;
    if !range.contains(&cx) || !range.contains(&cy) {
        return Err(Rejection::OffFrame { cx, cy });
    }

    Ok(())
}

pub fn is_admissible(
    face: &DetectionResult,
    frame: FrameSize,
    thresholds: &AdmissionThresholds,
) -> bool {
    check_admissible(face, frame, thresholds).is_ok()
}

/// Test the single predicate for `pose`.
pub fn matches_pose(angles: &HeadAngles, pose: PoseLabel) -> bool {
    let yaw = angles.yaw();
    let pitch = angles.pitch();
    match pose {
        PoseLabel::Front => yaw.abs() < 10.0 && pitch.abs() < 12.0,
        PoseLabel::Left => yaw < -6.0 && pitch.abs() < 18.0,
        PoseLabel::Right => yaw > 6.0 && pitch.abs() < 18.0,
        PoseLabel::Up => pitch > 10.0,
    }
}

/// First bucket (front, left, right, up order) whose predicate holds.
///
/// Diagnostic only: enrollment tests just the pose it is collecting.
pub fn classify_pose(angles: &HeadAngles) -> Option<PoseLabel> {
    PoseLabel::SEQUENCE
        .into_iter()
        .find(|pose| matches_pose(angles, *pose))
}

/// Advisory quality score in [0, 100].
pub fn quality_score(face: &DetectionResult, frame: FrameSize, mode: ScoringMode) -> QualityScore {
    let mut score = QualityScore::MAX;

    let excess = face.head_angles.magnitude() - mode.rotation_allowance();
    if excess > 0.0 {
        score -= excess * 2.0;
    }

    if let Some(area) = normalized_area(face, frame).filter(|a| a.is_finite()) {
        if area < 0.2 {
            score -= 20.0;
        } else if area < 0.3 {
            score -= 10.0;
        }
    }

    if let Some(eyes) = face.eye_open().filter(|p| p.is_finite()) {
        if eyes > 0.8 {
            score += 10.0;
        } else if eyes < 0.5 {
            score -= 15.0;
        }
    }

    if face.smiling.is_some_and(|p| p > 0.7) {
        score += 5.0;
    }

    QualityScore::new(score)
}

/// Everything the classifier can say about one face.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub admission: Result<(), Rejection>,
    pub pose: Option<PoseLabel>,
    pub score: QualityScore,
}

pub fn assess(
    face: &DetectionResult,
    frame: FrameSize,
    thresholds: &AdmissionThresholds,
    mode: ScoringMode,
) -> Assessment {
    Assessment {
        admission: check_admissible(face, frame, thresholds),
        pose: classify_pose(&face.head_angles),
        score: quality_score(face, frame, mode),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Bounds;

    const FRAME: FrameSize = FrameSize { width: 640, height: 480 };

    fn face(x: f32, y: f32, w: f32, h: f32) -> DetectionResult {
        DetectionResult {
            bounds: Some(Bounds { x, y, width: w, height: h }),
            ..Default::default()
        }
    }

    fn angles(yaw: f32, pitch: f32) -> HeadAngles {
        HeadAngles { x: pitch, y: yaw, z: 0.0 }
    }

    #[test]
    fn test_missing_bounds_not_admissible() {
        let f = DetectionResult::default();
        assert_eq!(
            check_admissible(&f, FRAME, &AdmissionThresholds::VERIFICATION),
            Err(Rejection::NoBounds)
        );
        assert!(!is_admissible(&f, FRAME, &AdmissionThresholds::ENROLLMENT));
    }

    #[test]
    fn test_non_numeric_bounds_not_admissible() {
        let raw =
            serde_json::json!({ "bounds": { "x": "a", "y": 0, "width": 100, "height": 100 } });
        let f = crate::adapter::normalize_face(&raw).unwrap();
        assert!(!is_admissible(&f, FRAME, &AdmissionThresholds::VERIFICATION));
    }

    #[test]
    fn test_negative_size_not_admissible() {
        let f = face(420.0, 340.0, -200.0, -200.0);
        for thresholds in [AdmissionThresholds::VERIFICATION, AdmissionThresholds::ENROLLMENT] {
            assert_eq!(check_admissible(&f, FRAME, &thresholds), Err(Rejection::NoBounds));
        }

        let raw = serde_json::json!({
            "frame": { "left": 420, "top": 340, "right": 220, "bottom": 140 }
        });
        let f = crate::adapter::normalize_face(&raw).unwrap();
        assert!(!is_admissible(&f, FRAME, &AdmissionThresholds::VERIFICATION));
    }

    #[test]
    fn test_verification_accepts_tiny_face() {
        let f = face(300.0, 200.0, 20.0, 20.0);
        assert!(is_admissible(&f, FRAME, &AdmissionThresholds::VERIFICATION));
        assert!(matches!(
            check_admissible(&f, FRAME, &AdmissionThresholds::ENROLLMENT),
            Err(Rejection::TooSmall { .. })
        ));
    }

    #[test]
    fn test_rotation_limit_per_axis() {
        let mut f = face(200.0, 100.0, 200.0, 200.0);
        f.head_angles = HeadAngles { x: 0.0, y: 0.0, z: 41.0 };
        assert!(is_admissible(&f, FRAME, &AdmissionThresholds::VERIFICATION));
        assert!(matches!(
            check_admissible(&f, FRAME, &AdmissionThresholds::ENROLLMENT),
            Err(Rejection::Rotated { axis: 'z', .. })
        ));
    }

    #[test]
    fn test_nan_rotation_rejected() {
        let mut f = face(200.0, 100.0, 200.0, 200.0);
        f.head_angles.y = f32::NAN;
        assert!(!is_admissible(&f, FRAME, &AdmissionThresholds::VERIFICATION));
    }

    #[test]
    fn test_center_margin() {
        // Center at x = 1.4 * width: inside the extended margin.
        let f = face(640.0 * 1.4 - 50.0, 200.0, 100.0, 100.0);
        assert!(is_admissible(&f, FRAME, &AdmissionThresholds::VERIFICATION));
        // Center at x = 1.6 * width: rejected.
        let f = face(640.0 * 1.6 - 50.0, 200.0, 100.0, 100.0);
        assert!(matches!(
            check_admissible(&f, FRAME, &AdmissionThresholds::VERIFICATION),
            Err(Rejection::OffFrame { .. })
        ));
    }

    #[test]
    fn test_empty_frame_rejected() {
        let f = face(0.0, 0.0, 10.0, 10.0);
        let frame = FrameSize { width: 0, height: 480 };
        assert_eq!(
            check_admissible(&f, frame, &AdmissionThresholds::VERIFICATION),
            Err(Rejection::EmptyFrame)
        );
    }

    #[test]
    fn test_pose_buckets() {
        assert_eq!(classify_pose(&angles(0.0, 0.0)), Some(PoseLabel::Front));
        assert_eq!(classify_pose(&angles(-20.0, 0.0)), Some(PoseLabel::Left));
        assert_eq!(classify_pose(&angles(20.0, 0.0)), Some(PoseLabel::Right));
        assert_eq!(classify_pose(&angles(0.0, 20.0)), Some(PoseLabel::Up));
        assert_eq!(classify_pose(&angles(0.0, -30.0)), None);
    }

    #[test]
    fn test_overlapping_buckets_tested_individually() {
        // yaw 8 satisfies both front and right.
        let a = angles(8.0, 0.0);
        assert!(matches_pose(&a, PoseLabel::Front));
        assert!(matches_pose(&a, PoseLabel::Right));
        assert!(!matches_pose(&a, PoseLabel::Left));
        assert!(!matches_pose(&a, PoseLabel::Up));
    }

    #[test]
    fn test_score_rotation_allowance_differs_by_mode() {
        let mut f = face(0.0, 0.0, 400.0, 400.0);
        f.head_angles = HeadAngles { x: 0.0, y: 40.0, z: 0.0 };
        // 10° beyond the 30° verification allowance.
        assert_eq!(quality_score(&f, FRAME, ScoringMode::Verification).value(), 80.0);
        assert_eq!(quality_score(&f, FRAME, ScoringMode::Enrollment).value(), 100.0);
    }

    #[test]
    fn test_score_area_penalties() {
        // 0.1 of frame
        let small = face(0.0, 0.0, 192.0, 160.0);
        assert_eq!(quality_score(&small, FRAME, ScoringMode::Verification).value(), 80.0);
        // 0.25 of frame
        let medium = face(0.0, 0.0, 320.0, 240.0);
        assert_eq!(quality_score(&medium, FRAME, ScoringMode::Verification).value(), 90.0);
    }

    #[test]
    fn test_score_eyes_and_smile() {
        let mut f = face(0.0, 0.0, 400.0, 400.0);
        f.left_eye_open = Some(0.3);
        f.right_eye_open = Some(0.4);
        f.smiling = Some(0.9);
        assert_eq!(quality_score(&f, FRAME, ScoringMode::Verification).value(), 90.0);
    }

    #[test]
    fn test_score_clamped_for_extreme_inputs() {
        let extremes = [
            HeadAngles { x: 1e9, y: -1e9, z: 1e9 },
            HeadAngles { x: f32::INFINITY, y: f32::NAN, z: 0.0 },
            HeadAngles { x: 180.0, y: 180.0, z: 180.0 },
        ];
        for a in extremes {
            for eyes in [Some(-5.0), Some(5.0), Some(f32::NAN), None] {
                let mut f = face(0.0, 0.0, 1.0, 1.0);
                f.head_angles = a;
                f.left_eye_open = eyes;
                f.smiling = Some(99.0);
                for mode in [ScoringMode::Verification, ScoringMode::Enrollment] {
                    let s = quality_score(&f, FRAME, mode).value();
                    assert!((0.0..=100.0).contains(&s), "score {s} out of range");
                }
            }
        }
        let mut perfect = face(0.0, 0.0, 640.0, 480.0);
        perfect.left_eye_open = Some(1.0);
        perfect.smiling = Some(1.0);
        assert_eq!(quality_score(&perfect, FRAME, ScoringMode::Verification).value(), 100.0);
    }

    #[test]
    fn test_assess_combines() {
        let mut f = face(200.0, 100.0, 200.0, 200.0);
        f.head_angles = angles(-15.0, 0.0);
        let a = assess(&f, FRAME, &AdmissionThresholds::ENROLLMENT, ScoringMode::Enrollment);
        assert!(a.admission.is_ok());
        assert_eq!(a.pose, Some(PoseLabel::Left));
    }
}
