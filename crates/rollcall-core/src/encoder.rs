//! The face-encoding capability shared by the landmark and classifier variants.

use crate::types::Prediction;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("label file: {0}")]
    Labels(String),
    #[error("unexpected model output: {0}")]
    UnexpectedOutput(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Turns a face crop into a [`Prediction`].
///
/// Encoders hold their model in memory and may be called from several
/// threads at once.
pub trait FaceEncoder: Send + Sync {
    fn encode(&self, face: &RgbImage) -> Result<Prediction, EncoderError>;

    /// Short identifier of the model behind this encoder, stored alongside
    /// generated embeddings.
    fn model_tag(&self) -> &str;
}
