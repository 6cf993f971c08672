//! Detector payload normalization.
//!
//! Detector backends disagree on field names (`bounds` / `frame` /
//! `boundingBox`), on whether landmarks and contours arrive as arrays or
//! keyed maps, and on numeric vs. string type tags. Everything downstream
//! reads the single [`DetectionResult`] shape produced here.

use crate::types::{Bounds, Contour, DetectionResult, HeadAngles, Landmark, LandmarkKind, Point};
use serde_json::{Map, Value};

const BOUNDS_KEYS: &[&str] = &["bounds", "frame", "boundingBox", "bounding_box", "rect"];
const LANDMARKS_KEYS: &[&str] = &["landmarks", "faceLandmarks"];
const CONTOURS_KEYS: &[&str] = &["contours", "faceContours"];
const ANGLES_KEYS: &[&str] = &["headAngles", "headEulerAngles", "head_angles", "rotation"];

/// ML Kit `FaceContour` type codes.
const CONTOUR_CODES: [&str; 15] = [
    "face",
    "left_eyebrow_top",
    "left_eyebrow_bottom",
    "right_eyebrow_top",
    "right_eyebrow_bottom",
    "left_eye",
    "right_eye",
    "upper_lip_top",
    "upper_lip_bottom",
    "lower_lip_top",
    "lower_lip_bottom",
    "nose_bridge",
    "nose_bottom",
    "left_cheek",
    "right_cheek",
];

/// Normalize a full detector response: either an array of faces, an object
/// with a `faces` array, or a single face object.
pub fn normalize_payload(payload: &Value) -> Vec<DetectionResult> {
    match payload {
        Value::Array(items) => items.iter().filter_map(normalize_face).collect(),
        Value::Object(obj) => match obj.get("faces") {
            Some(Value::Array(items)) => items.iter().filter_map(normalize_face).collect(),
            Some(_) => Vec::new(),
            None => normalize_face(payload).into_iter().collect(),
        },
        _ => Vec::new(),
    }
}

/// Normalize one vendor face object. Returns `None` if `raw` is not an object.
pub fn normalize_face(raw: &Value) -> Option<DetectionResult> {
    let obj = raw.as_object()?;

    Some(DetectionResult {
        bounds: field(obj, BOUNDS_KEYS).and_then(parse_bounds),
        landmarks: field(obj, LANDMARKS_KEYS)
            .map(parse_landmarks)
            .unwrap_or_default(),
        contours: field(obj, CONTOURS_KEYS)
            .map(parse_contours)
            .unwrap_or_default(),
        head_angles: parse_head_angles(obj),
        left_eye_open: field(
            obj,
            &["leftEyeOpenProbability", "leftEyeOpenProb", "left_eye_open_probability"],
        )
        .and_then(number),
        right_eye_open: field(
            obj,
            &["rightEyeOpenProbability", "rightEyeOpenProb", "right_eye_open_probability"],
        )
        .and_then(number),
        smiling: field(obj, &["smilingProbability", "smilingProb", "smiling_probability"])
            .and_then(number),
        tracking_id: field(obj, &["trackingId", "trackingID", "tracking_id"])
            .and_then(Value::as_i64),
        confidence: field(obj, &["confidence", "score"]).and_then(number),
    })
}

/// First non-null value under any of `names`.
fn field<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|n| obj.get(*n))
        .find(|v| !v.is_null())
}

/// Finite JSON number. Strings, even numeric-looking ones, are rejected.
fn number(v: &Value) -> Option<f32> {
    v.as_f64().map(|f| f as f32).filter(|f| f.is_finite())
}

fn parse_bounds(v: &Value) -> Option<Bounds> {
    if let Value::Array(items) = v {
        let [x, y, w, h] = items.as_slice() else {
            return None;
        };
        return checked_bounds(number(x)?, number(y)?, number(w)?, number(h)?);
    }

    let b = v.as_object()?;
    let x = number(field(b, &["x", "left", "originX"])?)?;
    let y = number(field(b, &["y", "top", "originY"])?)?;

    // A present-but-non-numeric width is invalid; only a missing one falls
    // back to the right/bottom edge.
    let width = match field(b, &["width", "w"]) {
        Some(w) => number(w)?,
        None => number(field(b, &["right"])?)? - x,
    };
    let height = match field(b, &["height", "h"]) {
        Some(h) => number(h)?,
        None => number(field(b, &["bottom"])?)? - y,
    };

    checked_bounds(x, y, width, height)
}

/// Finite origin and strictly positive size; inverted edge boxes are dropped.
fn checked_bounds(x: f32, y: f32, width: f32, height: f32) -> Option<Bounds> {
    let finite = [x, y, width, height].iter().all(|f| f.is_finite());
    (finite && width > 0.0 && height > 0.0).then_some(Bounds { x, y, width, height })
}

fn parse_point(v: &Value) -> Option<Point> {
    match v {
        Value::Array(items) => match items.as_slice() {
            [x, y, ..] => Some(Point {
                x: number(x)?,
                y: number(y)?,
            }),
            _ => None,
        },
        Value::Object(obj) => Some(Point {
            x: number(obj.get("x")?)?,
            y: number(obj.get("y")?)?,
        }),
        _ => None,
    }
}

fn parse_points(v: &Value) -> Vec<Point> {
    v.as_array()
        .map(|items| items.iter().filter_map(parse_point).collect())
        .unwrap_or_default()
}

fn landmark_kind(tag: &Value) -> Option<LandmarkKind> {
    match tag {
        Value::String(s) => Some(LandmarkKind::from_label(s)),
        Value::Number(n) => n.as_i64().map(LandmarkKind::from_code),
        _ => None,
    }
}

fn parse_landmarks(v: &Value) -> Vec<Landmark> {
    match v {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let obj = item.as_object()?;
                let kind = landmark_kind(field(obj, &["type", "kind", "name"])?)?;
                let position = match field(obj, &["position", "point"]) {
                    Some(p) => parse_point(p)?,
                    None => parse_point(item)?,
                };
                Some(Landmark { kind, position })
            })
            .collect(),
        Value::Object(map) => map
            .iter()
            .filter_map(|(name, p)| {
                Some(Landmark {
                    kind: LandmarkKind::from_label(name),
                    position: parse_point(p)?,
                })
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn contour_name(tag: &Value) -> Option<String> {
    match tag {
        Value::String(s) => Some(snake_case(s)),
        Value::Number(n) => {
            let code = n.as_u64()? as usize;
            Some(
                CONTOUR_CODES
                    .get(code.checked_sub(1)?)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| code.to_string()),
            )
        }
        _ => None,
    }
}

fn parse_contours(v: &Value) -> Vec<Contour> {
    match v {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let obj = item.as_object()?;
                Some(Contour {
                    kind: contour_name(field(obj, &["type", "kind", "name"])?)?,
                    points: parse_points(field(obj, &["points", "positions"])?),
                })
            })
            .collect(),
        Value::Object(map) => map
            .iter()
            .map(|(name, points)| Contour {
                kind: snake_case(name),
                points: parse_points(points),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_head_angles(obj: &Map<String, Value>) -> HeadAngles {
    let angle = |o: &Map<String, Value>, names: &[&str]| -> f32 {
        field(o, names).and_then(number).unwrap_or(0.0)
    };

    if let Some(nested) = field(obj, ANGLES_KEYS).and_then(Value::as_object) {
        return HeadAngles {
            x: angle(nested, &["x", "pitch"]),
            y: angle(nested, &["y", "yaw"]),
            z: angle(nested, &["z", "roll"]),
        };
    }

    HeadAngles {
        x: angle(obj, &["headEulerAngleX", "pitchAngle", "pitch"]),
        y: angle(obj, &["headEulerAngleY", "yawAngle", "yaw"]),
        z: angle(obj, &["headEulerAngleZ", "rollAngle", "roll"]),
    }
}

/// `upperLipTop` / `UPPER_LIP_TOP` / `upper-lip-top` → `upper_lip_top`.
fn snake_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    let mut prev_lower = false;
    for c in s.chars() {
        if c == '-' || c == ' ' || c == '_' {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            prev_lower = false;
        } else if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else {
            out.push(c);
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bounds_field_name_variants() {
        for key in ["bounds", "frame", "boundingBox", "bounding_box", "rect"] {
            let mut raw = json!({});
            raw[key] = json!({ "x": 10, "y": 20, "width": 30, "height": 40 });
            let face = normalize_face(&raw).unwrap();
            assert_eq!(
                face.bounds,
                Some(Bounds { x: 10.0, y: 20.0, width: 30.0, height: 40.0 }),
                "key {key}"
            );
        }
    }

    #[test]
    fn test_bounds_from_edges() {
        let raw = json!({ "frame": { "left": 10, "top": 20, "right": 110, "bottom": 70 } });
        let b = normalize_face(&raw).unwrap().bounds.unwrap();
        assert_eq!((b.width, b.height), (100.0, 50.0));
    }

    #[test]
    fn test_inverted_edges_dropped() {
        let raw = json!({ "frame": { "left": 420, "top": 340, "right": 220, "bottom": 140 } });
        assert!(normalize_face(&raw).unwrap().bounds.is_none());

        let raw = json!({ "bounds": { "x": 10, "y": 20, "width": 0, "height": 40 } });
        assert!(normalize_face(&raw).unwrap().bounds.is_none());
    }

    #[test]
    fn test_bounds_array_form() {
        let raw = json!({ "bounds": [1, 2, 3, 4] });
        assert_eq!(
            normalize_face(&raw).unwrap().bounds,
            Some(Bounds { x: 1.0, y: 2.0, width: 3.0, height: 4.0 })
        );
    }

    #[test]
    fn test_non_numeric_bounds_dropped() {
        let raw = json!({ "bounds": { "x": "10", "y": 20, "width": 30, "height": 40 } });
        assert!(normalize_face(&raw).unwrap().bounds.is_none());

        let raw = json!({ "bounds": { "x": 10, "y": 20, "width": null, "height": 40 } });
        assert!(normalize_face(&raw).unwrap().bounds.is_none());
    }

    #[test]
    fn test_landmarks_array_with_codes_and_labels() {
        let raw = json!({
            "landmarks": [
                { "type": 4, "position": { "x": 1, "y": 2 } },
                { "type": "RIGHT_EYE", "x": 3, "y": 4 },
                { "type": "noseBase", "position": [5, 6] },
            ]
        });
        let face = normalize_face(&raw).unwrap();
        assert_eq!(face.landmarks.len(), 3);
        assert_eq!(face.landmarks[0].kind, LandmarkKind::LeftEye);
        assert_eq!(face.landmarks[1].kind, LandmarkKind::RightEye);
        assert_eq!(face.landmarks[1].position, Point { x: 3.0, y: 4.0 });
        assert_eq!(face.landmarks[2].kind, LandmarkKind::NoseBase);
    }

    #[test]
    fn test_landmarks_keyed_map() {
        let raw = json!({ "landmarks": { "leftEye": { "x": 1, "y": 2 }, "mouthLeft": [3, 4] } });
        let face = normalize_face(&raw).unwrap();
        assert_eq!(face.landmarks.len(), 2);
        assert!(face
            .landmarks
            .iter()
            .any(|l| l.kind == LandmarkKind::MouthLeft && l.position == Point { x: 3.0, y: 4.0 }));
    }

    #[test]
    fn test_contours_array_and_map() {
        let raw = json!({
            "contours": [ { "type": 1, "points": [[0, 0], [1, 1]] },
                          { "type": "UPPER_LIP_TOP", "points": [{ "x": 2, "y": 2 }] } ]
        });
        let face = normalize_face(&raw).unwrap();
        assert_eq!(face.contours[0].kind, "face");
        assert_eq!(face.contours[0].points.len(), 2);
        assert_eq!(face.contours[1].kind, "upper_lip_top");

        let raw = json!({ "contours": { "leftEyebrowTop": [[0, 0]] } });
        let face = normalize_face(&raw).unwrap();
        assert_eq!(face.contours[0].kind, "left_eyebrow_top");
    }

    #[test]
    fn test_head_angle_variants() {
        let flat = json!({ "headEulerAngleX": 5, "headEulerAngleY": -20, "headEulerAngleZ": 1 });
        let nested = json!({ "headAngles": { "x": 5, "y": -20, "z": 1 } });
        let named = json!({ "rotation": { "pitch": 5, "yaw": -20, "roll": 1 } });
        for raw in [flat, nested, named] {
            let a = normalize_face(&raw).unwrap().head_angles;
            assert_eq!(a, HeadAngles { x: 5.0, y: -20.0, z: 1.0 });
        }
    }

    #[test]
    fn test_probability_spellings() {
        let raw = json!({
            "leftEyeOpenProb": 0.9,
            "rightEyeOpenProbability": 0.7,
            "smilingProbability": 0.2,
            "trackingID": 7,
            "score": 0.99
        });
        let face = normalize_face(&raw).unwrap();
        assert_eq!(face.left_eye_open, Some(0.9));
        assert_eq!(face.right_eye_open, Some(0.7));
        assert_eq!(face.smiling, Some(0.2));
        assert_eq!(face.tracking_id, Some(7));
        assert_eq!(face.confidence, Some(0.99));
    }

    #[test]
    fn test_payload_shapes() {
        let face = json!({ "bounds": [0, 0, 10, 10] });
        assert_eq!(normalize_payload(&json!([face.clone(), face.clone()])).len(), 2);
        assert_eq!(normalize_payload(&json!({ "faces": [face.clone()] })).len(), 1);
        assert_eq!(normalize_payload(&face).len(), 1);
        assert!(normalize_payload(&json!("nope")).is_empty());
        assert!(normalize_payload(&json!({ "faces": null })).is_empty());
    }

    #[test]
    fn test_snake_case() {
        assert_eq!(snake_case("upperLipTop"), "upper_lip_top");
        assert_eq!(snake_case("UPPER_LIP_TOP"), "upper_lip_top");
        assert_eq!(snake_case("nose-bridge"), "nose_bridge");
    }
}
