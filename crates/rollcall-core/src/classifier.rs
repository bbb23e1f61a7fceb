//! Trained image classifier (Teachable Machine export converted to ONNX).
//!
//! Input is a `[1, 224, 224, 3]` NHWC RGB tensor scaled to [0, 1]; output is a
//! probability vector whose length equals the label count.

use crate::encoder::{EncoderError, FaceEncoder};
use crate::imaging;
use crate::labels;
use crate::types::{Prediction, UNKNOWN_LABEL};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

pub const CLASSIFIER_INPUT_SIZE: usize = 224;
pub const DEFAULT_TEACHABLE_CONFIDENCE: f32 = 0.7;

/// Classifier-mode encoder for one model bundle.
pub struct ClassifierEncoder {
    session: Mutex<Session>,
    labels: Vec<String>,
    confidence_threshold: f32,
    tag: String,
}

impl ClassifierEncoder {
    /// Load a bundle's model and label file.
    ///
    /// `tag` identifies the bundle (its registry id) in logs.
    pub fn load(
        model_path: &Path,
        labels_path: &Path,
        confidence_threshold: f32,
        tag: &str,
    ) -> Result<Self, EncoderError> {
        if !model_path.exists() {
            return Err(EncoderError::ModelNotFound(model_path.display().to_string()));
        }
        let labels = labels::read_labels(labels_path)
            .map_err(|e| EncoderError::Labels(format!("{}: {e}", labels_path.display())))?;
        if labels.is_empty() {
            return Err(EncoderError::Labels(format!("{} has no classes", labels_path.display())));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            tag,
            classes = labels.len(),
            confidence_threshold,
            "loaded classifier model"
        );

        Ok(Self {
            session: Mutex::new(session),
            labels,
            confidence_threshold,
            tag: tag.to_string(),
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// RGB crop → area-resized 224×224 → [0, 1] → batch of one.
    pub fn preprocess(face: &RgbImage) -> Array4<f32> {
        let size = CLASSIFIER_INPUT_SIZE;
        let resized = imaging::resize_area(face, size as u32, size as u32);
        let mut tensor = Array4::<f32>::zeros((1, size, size, 3));
        for (x, y, p) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, y as usize, x as usize, c]] = p[c] as f32 / 255.0;
            }
        }
        tensor
    }
}

impl FaceEncoder for ClassifierEncoder {
    fn encode(&self, face: &RgbImage) -> Result<Prediction, EncoderError> {
        if face.width() == 0 || face.height() == 0 {
            return Ok(Prediction::Nothing);
        }

        let input = Self::preprocess(face);
        let mut session = self
            .session
            .lock()
            .map_err(|_| EncoderError::InferenceFailed("classifier session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, probs) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncoderError::InferenceFailed(format!("probabilities: {e}")))?;

        classify(probs, &self.labels, self.confidence_threshold)
    }

    fn model_tag(&self) -> &str {
        &self.tag
    }
}

/// Map a probability vector to a classification.
///
/// The argmax wins; it is reported under its label iff its probability is
/// `>= threshold`, otherwise under [`UNKNOWN_LABEL`] with the same probability.
pub fn classify(probs: &[f32], labels: &[String], threshold: f32) -> Result<Prediction, EncoderError> {
    if probs.len() != labels.len() {
        return Err(EncoderError::UnexpectedOutput(format!(
            "classifier produced {} probabilities for {} labels",
            probs.len(),
            labels.len()
        )));
    }

    let Some((best, &confidence)) = probs
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
    else {
        return Ok(Prediction::Nothing);
    };

    let label = if confidence >= threshold {
        labels[best].clone()
    } else {
        UNKNOWN_LABEL.to_string()
    };
    Ok(Prediction::Classification { label, confidence })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_classify_known() {
        let p = classify(&[0.05, 0.92, 0.03], &labels(&["Alice", "Bob", "Carol"]), 0.7).unwrap();
        assert_eq!(p, Prediction::Classification { label: "Bob".into(), confidence: 0.92 });
    }

    #[test]
    fn test_classify_below_threshold_is_unknown() {
        let p = classify(&[0.41, 0.30, 0.29], &labels(&["Alice", "Bob", "Carol"]), 0.7).unwrap();
        assert_eq!(p, Prediction::Classification { label: UNKNOWN_LABEL.into(), confidence: 0.41 });
    }

    #[test]
    fn test_classify_equal_to_threshold_is_known() {
        let p = classify(&[0.7, 0.3], &labels(&["Alice", "Bob"]), 0.7).unwrap();
        assert_eq!(p, Prediction::Classification { label: "Alice".into(), confidence: 0.7 });
    }

    #[test]
    fn test_classify_output_dim_mismatch() {
        let err = classify(&[0.5, 0.5], &labels(&["Alice"]), 0.7).unwrap_err();
        assert!(matches!(err, EncoderError::UnexpectedOutput(_)));
    }

    #[test]
    fn test_classify_empty() {
        assert_eq!(classify(&[], &[], 0.7).unwrap(), Prediction::Nothing);
    }

    #[test]
    fn test_preprocess_shape_and_range() {
        let crop = RgbImage::from_pixel(300, 250, image::Rgb([255, 0, 51]));
        let tensor = ClassifierEncoder::preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, 224, 224, 3]);
        assert!((tensor[[0, 10, 10, 0]] - 1.0).abs() < 1e-6);
        assert_eq!(tensor[[0, 10, 10, 1]], 0.0);
        assert!((tensor[[0, 200, 100, 2]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_load_missing_model() {
        let err = ClassifierEncoder::load(
            Path::new("/nonexistent/model.onnx"),
            Path::new("/nonexistent/labels.txt"),
            0.7,
            "m",
        )
        .err()
        .unwrap();
        assert!(matches!(err, EncoderError::ModelNotFound(_)));
    }
}
