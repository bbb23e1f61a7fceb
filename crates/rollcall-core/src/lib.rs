//! rollcall-core: Face location and recognition primitives.
//!
//! SCRFD locates faces; a face-mesh landmark encoder (fallback mode) or a
//! trained classifier (preferred mode) turns each crop into a prediction.
//! All models run via ONNX Runtime on the CPU.

pub mod classifier;
pub mod detector;
pub mod encoder;
pub mod imaging;
pub mod labels;
pub mod landmarks;
pub mod quality;
pub mod types;

pub use classifier::ClassifierEncoder;
pub use detector::{DetectorError, FaceDetector, FaceLocator};
pub use encoder::{EncoderError, FaceEncoder};
pub use landmarks::LandmarkEncoder;
pub use quality::{QualityRejection, QualityThresholds};
pub use types::{
    CosineMatcher, Embedding, FaceBox, KnownFace, MatchResult, Matcher, Prediction,
    RecognitionResult, UNKNOWN_LABEL,
};
