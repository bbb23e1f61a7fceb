//! Face-mesh landmark encoder for fallback mode.
//!
//! Runs a 468-point face-mesh ONNX model on the crop and flattens the
//! (x, y, z) landmarks into a 1404-dimensional embedding.

use crate::encoder::{EncoderError, FaceEncoder};
use crate::types::{Embedding, Prediction};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

pub const MESH_INPUT_SIZE: usize = 192;
pub const MESH_LANDMARKS: usize = 468;
pub const EMBEDDING_DIM: usize = MESH_LANDMARKS * 3;
pub const LANDMARK_MODEL_TAG: &str = "face_mesh_468";
const PRESENCE_THRESHOLD: f32 = 0.5;

/// Fallback-mode encoder producing landmark embeddings.
pub struct LandmarkEncoder {
    session: Mutex<Session>,
    num_outputs: usize,
}

impl LandmarkEncoder {
    pub fn load(model_path: &Path) -> Result<Self, EncoderError> {
        if !model_path.exists() {
            return Err(EncoderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;
        let num_outputs = session.outputs().len();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded face-mesh model"
        );

        Ok(Self {
            session: Mutex::new(session),
            num_outputs,
        })
    }

    fn preprocess(face: &RgbImage) -> Array4<f32> {
        let size = MESH_INPUT_SIZE;
        let resized = image::imageops::resize(face, size as u32, size as u32, FilterType::Triangle);
        let mut tensor = Array4::<f32>::zeros((1, size, size, 3));
        for (x, y, p) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, y as usize, x as usize, c]] = p[c] as f32 / 255.0;
            }
        }
        tensor
    }
}

impl FaceEncoder for LandmarkEncoder {
    fn encode(&self, face: &RgbImage) -> Result<Prediction, EncoderError> {
        if face.width() == 0 || face.height() == 0 {
            return Ok(Prediction::Nothing);
        }

        let input = Self::preprocess(face);
        let mut session = self
            .session
            .lock()
            .map_err(|_| EncoderError::InferenceFailed("face-mesh session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        // Outputs are told apart by size: the landmark tensor and a scalar presence logit.
        let mut landmarks: Option<Vec<f32>> = None;
        let mut presence: Option<f32> = None;
        for i in 0..self.num_outputs {
            let (_, data) = outputs[i]
                .try_extract_tensor::<f32>()
                .map_err(|e| EncoderError::InferenceFailed(format!("face-mesh output {i}: {e}")))?;
            match data.len() {
                EMBEDDING_DIM => landmarks = Some(data.to_vec()),
                1 => presence = Some(data[0]),
                _ => {}
            }
        }

        if let Some(logit) = presence {
            if sigmoid(logit) < PRESENCE_THRESHOLD {
                tracing::debug!(presence = sigmoid(logit), "face-mesh found no face");
                return Ok(Prediction::Nothing);
            }
        }

        Ok(landmarks
            .as_deref()
            .and_then(landmarks_to_embedding)
            .map(Prediction::Embedding)
            .unwrap_or(Prediction::Nothing))
    }

    fn model_tag(&self) -> &str {
        LANDMARK_MODEL_TAG
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Flatten raw mesh output (pixel coordinates of the model input) into an
/// embedding normalized by the input size. `None` unless all 468 points are present.
pub fn landmarks_to_embedding(raw: &[f32]) -> Option<Embedding> {
    if raw.len() != EMBEDDING_DIM {
        return None;
    }
    let scale = MESH_INPUT_SIZE as f32;
    Some(Embedding {
        values: raw.iter().map(|v| v / scale).collect(),
        model_version: Some(LANDMARK_MODEL_TAG.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_landmarks_to_embedding_dimension() {
        let raw = vec![96.0f32; EMBEDDING_DIM];
        let emb = landmarks_to_embedding(&raw).unwrap();
        assert_eq!(emb.dim(), 1404);
        assert!(emb.values.iter().all(|&v| (v - 0.5).abs() < 1e-6));
        assert_eq!(emb.model_version.as_deref(), Some(LANDMARK_MODEL_TAG));
    }

    #[test]
    fn test_incomplete_mesh_is_rejected() {
        assert!(landmarks_to_embedding(&vec![0.0f32; 467 * 3]).is_none());
    }

    #[test]
    fn test_sigmoid() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(-10.0) < PRESENCE_THRESHOLD);
        assert!(sigmoid(10.0) > PRESENCE_THRESHOLD);
    }

    #[test]
    fn test_preprocess_shape() {
        let crop = RgbImage::from_pixel(120, 140, image::Rgb([0, 255, 0]));
        let tensor = LandmarkEncoder::preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, MESH_INPUT_SIZE, MESH_INPUT_SIZE, 3]);
        assert!((tensor[[0, 5, 5, 1]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_load_missing_model() {
        let err = LandmarkEncoder::load(Path::new("/nonexistent/face_landmark.onnx")).err().unwrap();
        assert!(matches!(err, EncoderError::ModelNotFound(_)));
    }
}
