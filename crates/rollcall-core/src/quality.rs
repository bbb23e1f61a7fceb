//! Acceptance checks for enrollment captures.
//!
//! A crop is accepted iff exactly one face was detected in the frame, the crop
//! is at least `min_face_size` on both sides, its mean gray level lies in
//! `[min_brightness, max_brightness]`, and its Laplacian variance is at least
//! `min_sharpness`. All bounds are inclusive.

use crate::imaging;
use crate::types::FaceBox;
use image::RgbImage;
use std::fmt;

pub const DEFAULT_MIN_BRIGHTNESS: f64 = 40.0;
pub const DEFAULT_MAX_BRIGHTNESS: f64 = 220.0;
pub const DEFAULT_MIN_SHARPNESS: f64 = 100.0;
pub const DEFAULT_MIN_FACE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityThresholds {
    pub min_brightness: f64,
    pub max_brightness: f64,
    pub min_sharpness: f64,
    pub min_face_size: u32,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_brightness: DEFAULT_MIN_BRIGHTNESS,
            max_brightness: DEFAULT_MAX_BRIGHTNESS,
            min_sharpness: DEFAULT_MIN_SHARPNESS,
            min_face_size: DEFAULT_MIN_FACE_SIZE,
        }
    }
}

/// Why a capture frame was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum QualityRejection {
    NoFace,
    MultipleFaces(usize),
    TooSmall { width: u32, height: u32 },
    TooDark(f64),
    TooBright(f64),
    Blurry(f64),
}

impl fmt::Display for QualityRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoFace => write!(f, "no face"),
            Self::MultipleFaces(n) => write!(f, "multiple faces ({n})"),
            Self::TooSmall { width, height } => write!(f, "face too small ({width}x{height})"),
            Self::TooDark(b) => write!(f, "too dark (brightness {b:.1})"),
            Self::TooBright(b) => write!(f, "too bright (brightness {b:.1})"),
            Self::Blurry(v) => write!(f, "too blurry (laplacian variance {v:.1})"),
        }
    }
}

/// Measurements of an accepted crop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityReport {
    pub brightness: f64,
    pub sharpness: f64,
}

impl QualityThresholds {
    pub fn check_face_count(&self, faces: usize) -> Result<(), QualityRejection> {
        match faces {
            0 => Err(QualityRejection::NoFace),
            1 => Ok(()),
            n => Err(QualityRejection::MultipleFaces(n)),
        }
    }

    pub fn check_size(&self, width: u32, height: u32) -> Result<(), QualityRejection> {
        if width < self.min_face_size || height < self.min_face_size {
            return Err(QualityRejection::TooSmall { width, height });
        }
        Ok(())
    }

    pub fn check_brightness(&self, brightness: f64) -> Result<(), QualityRejection> {
        if brightness < self.min_brightness {
            Err(QualityRejection::TooDark(brightness))
        } else if brightness > self.max_brightness {
            Err(QualityRejection::TooBright(brightness))
        } else {
            Ok(())
        }
    }

    pub fn check_sharpness(&self, variance: f64) -> Result<(), QualityRejection> {
        if variance < self.min_sharpness {
            return Err(QualityRejection::Blurry(variance));
        }
        Ok(())
    }

    /// Run every check against a frame and its detections.
    ///
    /// On success returns the face crop to persist plus its measurements.
    pub fn assess(
        &self,
        frame: &RgbImage,
        faces: &[FaceBox],
    ) -> Result<(RgbImage, QualityReport), QualityRejection> {
        self.check_face_count(faces.len())?;
        let crop = imaging::crop_face(frame, &faces[0]).ok_or(QualityRejection::NoFace)?;
        self.check_size(crop.width(), crop.height())?;

        let gray = imaging::to_grayscale(&crop);
        let brightness = imaging::mean_brightness(&gray);
        self.check_brightness(brightness)?;
        let sharpness = imaging::laplacian_variance(&gray);
        self.check_sharpness(sharpness)?;

        Ok((crop, QualityReport { brightness, sharpness }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, w: f32, h: f32) -> FaceBox {
        FaceBox { x, y, width: w, height: h, confidence: 0.9 }
    }

    /// Checkerboard around a mid-gray level: sharp, brightness ~128.
    fn textured(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            let v = if (x / 2 + y / 2) % 2 == 0 { 78 } else { 178 };
            image::Rgb([v, v, v])
        })
    }

    #[test]
    fn test_brightness_boundaries_inclusive() {
        let q = QualityThresholds::default();
        assert!(q.check_brightness(40.0).is_ok());
        assert_eq!(q.check_brightness(39.0), Err(QualityRejection::TooDark(39.0)));
        assert!(q.check_brightness(220.0).is_ok());
        assert!(matches!(q.check_brightness(220.5), Err(QualityRejection::TooBright(_))));
    }

    #[test]
    fn test_sharpness_boundaries_inclusive() {
        let q = QualityThresholds::default();
        assert!(q.check_sharpness(100.0).is_ok());
        assert!(matches!(q.check_sharpness(99.9), Err(QualityRejection::Blurry(_))));
    }

    #[test]
    fn test_face_count() {
        let q = QualityThresholds::default();
        assert_eq!(q.check_face_count(0), Err(QualityRejection::NoFace));
        assert!(q.check_face_count(1).is_ok());
        assert_eq!(q.check_face_count(2), Err(QualityRejection::MultipleFaces(2)));
    }

    #[test]
    fn test_multiple_faces_reason_text() {
        assert!(QualityRejection::MultipleFaces(2).to_string().starts_with("multiple faces"));
    }

    #[test]
    fn test_assess_accepts_good_crop() {
        let frame = textured(320, 240);
        let (crop, report) = QualityThresholds::default()
            .assess(&frame, &[face(50.0, 40.0, 120.0, 120.0)])
            .unwrap();
        assert_eq!(crop.dimensions(), (120, 120));
        assert!(report.sharpness >= DEFAULT_MIN_SHARPNESS);
    }

    #[test]
    fn test_assess_rejects_small_face() {
        let frame = textured(320, 240);
        let err = QualityThresholds::default()
            .assess(&frame, &[face(0.0, 0.0, 80.0, 120.0)])
            .unwrap_err();
        assert_eq!(err, QualityRejection::TooSmall { width: 80, height: 120 });
    }

    #[test]
    fn test_assess_rejects_flat_crop_as_blurry() {
        let frame = RgbImage::from_pixel(320, 240, image::Rgb([128, 128, 128]));
        let err = QualityThresholds::default()
            .assess(&frame, &[face(10.0, 10.0, 150.0, 150.0)])
            .unwrap_err();
        assert!(matches!(err, QualityRejection::Blurry(_)));
    }

    #[test]
    fn test_assess_rejects_dark_crop() {
        let frame = RgbImage::from_pixel(320, 240, image::Rgb([5, 5, 5]));
        let err = QualityThresholds::default()
            .assess(&frame, &[face(10.0, 10.0, 150.0, 150.0)])
            .unwrap_err();
        assert!(matches!(err, QualityRejection::TooDark(_)));
    }

    #[test]
    fn test_assess_rejects_two_faces() {
        let frame = textured(320, 240);
        let faces = [face(0.0, 0.0, 120.0, 120.0), face(150.0, 0.0, 120.0, 120.0)];
        let err = QualityThresholds::default().assess(&frame, &faces).unwrap_err();
        assert_eq!(err, QualityRejection::MultipleFaces(2));
    }
}
