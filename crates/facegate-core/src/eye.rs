//! Eye openness from facial landmark geometry.
//!
//! Uses the Eye Aspect Ratio (EAR) over the six-point eye contours of the
//! 68-point landmark layout (indices 36–41 left eye, 42–47 right eye):
//!
//! ```text
//! EAR = (|p1 - p5| + |p2 - p4|) / (2 * |p0 - p3|)
//! ```
//!
//! EAR is then mapped linearly onto openness in [0, 1] between a fully
//! closed and a fully open reference ratio. With the defaults an EAR of 0.21
//! (the usual "eyes closed" cut-off for this layout) maps to openness 0.3.

use crate::types::{EyeState, Point3};

/// Minimum landmark count for the 68-point layout.
pub const LANDMARKS_68: usize = 68;

const LEFT_EYE: [usize; 6] = [36, 37, 38, 39, 40, 41];
const RIGHT_EYE: [usize; 6] = [42, 43, 44, 45, 46, 47];

/// EAR at or below which the eye is treated as fully closed.
const EAR_CLOSED: f32 = 0.15;
/// EAR at or above which the eye is treated as fully open.
const EAR_OPEN: f32 = 0.35;

/// Eye Aspect Ratio for one six-point eye contour.
///
/// Returns `None` for a degenerate contour (zero horizontal extent).
pub fn eye_aspect_ratio(eye: &[Point3; 6]) -> Option<f32> {
    let vertical_a = eye[1].planar_distance(&eye[5]);
    let vertical_b = eye[2].planar_distance(&eye[4]);
    let horizontal = eye[0].planar_distance(&eye[3]);
    if horizontal <= f32::EPSILON {
        return None;
    }
    Some((vertical_a + vertical_b) / (2.0 * horizontal))
}

/// Map an EAR onto openness in [0, 1].
pub fn openness_from_ear(ear: f32) -> f32 {
    ((ear - EAR_CLOSED) / (EAR_OPEN - EAR_CLOSED)).clamp(0.0, 1.0)
}

/// Derive per-eye openness from a 68-point landmark set.
///
/// Returns `None` when the landmark set is not in the 68-point layout or an
/// eye contour is degenerate.
pub fn eye_state_from_landmarks(landmarks: &[Point3]) -> Option<EyeState> {
    if landmarks.len() < LANDMARKS_68 {
        return None;
    }
    let left = contour(landmarks, &LEFT_EYE)?;
    let right = contour(landmarks, &RIGHT_EYE)?;
    Some(EyeState::new(
        openness_from_ear(eye_aspect_ratio(&left)?),
        openness_from_ear(eye_aspect_ratio(&right)?),
    ))
}

fn contour(landmarks: &[Point3], indices: &[usize; 6]) -> Option<[Point3; 6]> {
    let mut out = [Point3::default(); 6];
    for (slot, &idx) in out.iter_mut().zip(indices.iter()) {
        *slot = *landmarks.get(idx)?;
    }
    Some(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Six-point eye contour, `height` apart vertically, 1.0 wide.
    fn eye_contour(cx: f32, height: f32) -> [Point3; 6] {
        let h = height / 2.0;
        [
            Point3::new(cx - 0.5, 0.0, 0.0),
            Point3::new(cx - 0.2, -h, 0.0),
            Point3::new(cx + 0.2, -h, 0.0),
            Point3::new(cx + 0.5, 0.0, 0.0),
            Point3::new(cx + 0.2, h, 0.0),
            Point3::new(cx - 0.2, h, 0.0),
        ]
    }

    /// A 68-point landmark set whose eyes have the given EAR.
    pub(crate) fn landmarks_with_ear(ear: f32) -> Vec<Point3> {
        let mut landmarks = vec![Point3::default(); LANDMARKS_68];
        // EAR = (h + h) / (2 * 1.0) = h, so the contour height equals the EAR.
        for (idx, p) in LEFT_EYE.iter().zip(eye_contour(-2.0, ear)) {
            landmarks[*idx] = p;
        }
        for (idx, p) in RIGHT_EYE.iter().zip(eye_contour(2.0, ear)) {
            landmarks[*idx] = p;
        }
        landmarks
    }

    #[test]
    fn test_ear_known_geometry() {
        let ear = eye_aspect_ratio(&eye_contour(0.0, 0.3)).unwrap();
        assert!((ear - 0.3).abs() < 1e-6, "got {ear}");
    }

    #[test]
    fn test_degenerate_contour() {
        let eye = [Point3::default(); 6];
        assert_eq!(eye_aspect_ratio(&eye), None);
    }

    #[test]
    fn test_openness_mapping() {
        assert_eq!(openness_from_ear(0.05), 0.0);
        assert_eq!(openness_from_ear(0.50), 1.0);
        assert!((openness_from_ear(0.21) - 0.3).abs() < 1e-5);
    }

    #[test]
    fn test_state_from_landmarks() {
        let open = eye_state_from_landmarks(&landmarks_with_ear(0.35)).unwrap();
        assert!(open.mean_openness() > 0.99);

        let closed = eye_state_from_landmarks(&landmarks_with_ear(0.12)).unwrap();
        assert_eq!(closed.mean_openness(), 0.0);
    }

    #[test]
    fn test_short_landmark_set() {
        assert_eq!(eye_state_from_landmarks(&[Point3::default(); 5]), None);
    }
}
