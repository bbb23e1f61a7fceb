use serde::{Deserialize, Serialize};

/// Label emitted for faces that no known identity explains.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Axis-aligned face box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detection confidence in [0, 1].
    pub confidence: f32,
}

impl FaceBox {
    /// Clip the box to a `frame_width` × `frame_height` frame.
    ///
    /// Returns `None` when nothing of the box remains inside the frame.
    pub fn clipped(&self, frame_width: u32, frame_height: u32) -> Option<FaceBox> {
        let x1 = self.x.max(0.0);
        let y1 = self.y.max(0.0);
        let x2 = (self.x + self.width).min(frame_width as f32);
        let y2 = (self.y + self.height).min(frame_height as f32);

        let width = x2 - x1;
        let height = y2 - y1;
        if width <= 0.0 || height <= 0.0 {
            return None;
        }

        Some(FaceBox {
            x: x1,
            y: y1,
            width,
            height,
            confidence: self.confidence.clamp(0.0, 1.0),
        })
    }

    /// Scale all coordinates by `factor` (used to map detections on a
    /// downscaled frame back to the original resolution).
    pub fn scaled(&self, factor: f32) -> FaceBox {
        FaceBox {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
            confidence: self.confidence,
        }
    }

    /// Integer pixel rectangle `(x, y, w, h)` covering the box.
    pub fn pixel_rect(&self) -> (u32, u32, u32, u32) {
        let x = self.x.max(0.0).floor() as u32;
        let y = self.y.max(0.0).floor() as u32;
        let w = self.width.max(0.0).round() as u32;
        let h = self.height.max(0.0).round() as u32;
        (x, y, w, h)
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }
}

/// Dense face vector (1404-dimensional for face-mesh landmarks).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "face_mesh_468").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Cosine distance `1 - similarity`, in [0, 2].
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        1.0 - self.similarity(other)
    }

    /// Return a unit-length copy. Zero vectors are returned unchanged.
    pub fn l2_normalized(&self) -> Embedding {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            self.values.iter().map(|x| x / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding {
            values,
            model_version: self.model_version.clone(),
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }
}

/// Output of a [`FaceEncoder`](crate::encoder::FaceEncoder).
///
/// The variant tells the downstream matcher which recognition mode produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    /// Trained classifier output. `label` is [`UNKNOWN_LABEL`] when the top
    /// probability is below the configured confidence.
    Classification { label: String, confidence: f32 },
    /// Landmark vector from the fallback encoder.
    Embedding(Embedding),
    /// No usable face in the crop.
    Nothing,
}

/// One enrolled face in the fallback-mode gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownFace {
    pub name: String,
    pub embedding: Embedding,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Result of matching a query embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine distance of the closest gallery entry (`f32::INFINITY` for an empty gallery).
    pub distance: f32,
    /// `max(0, 1 - distance / threshold)` for a match, 0 otherwise.
    pub confidence: f32,
    /// Index into the gallery of the matched entry.
    pub index: Option<usize>,
    pub name: Option<String>,
}

impl MatchResult {
    fn no_match(distance: f32) -> Self {
        Self {
            matched: false,
            distance,
            confidence: 0.0,
            index: None,
            name: None,
        }
    }
}

/// Strategy for comparing a query embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, query: &Embedding, gallery: &[KnownFace], threshold: f32) -> MatchResult;
}

/// Minimum-cosine-distance matcher.
///
/// The query is L2-normalized, every gallery entry is visited, and the closest
/// one is accepted iff its distance is `<= threshold`.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, query: &Embedding, gallery: &[KnownFace], threshold: f32) -> MatchResult {
        let query = query.l2_normalized();
        let mut best_distance = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, known) in gallery.iter().enumerate() {
            if known.embedding.dim() != query.dim() {
                tracing::warn!(
                    name = %known.name,
                    expected = query.dim(),
                    got = known.embedding.dim(),
                    "skipping gallery entry with mismatched dimension"
                );
                continue;
            }
            let distance = query.cosine_distance(&known.embedding);
            if distance < best_distance {
                best_distance = distance;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_distance <= threshold => MatchResult {
                matched: true,
                distance: best_distance,
                confidence: distance_to_confidence(best_distance, threshold),
                index: Some(idx),
                name: Some(gallery[idx].name.clone()),
            },
            _ => MatchResult::no_match(best_distance),
        }
    }
}

/// Map a cosine distance to a confidence: `max(0, 1 - distance / threshold)`.
pub fn distance_to_confidence(distance: f32, threshold: f32) -> f32 {
    if threshold <= 0.0 {
        return if distance <= 0.0 { 1.0 } else { 0.0 };
    }
    (1.0 - distance / threshold).clamp(0.0, 1.0)
}

/// One recognized (or unknown) face in a frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionResult {
    /// Person name, or [`UNKNOWN_LABEL`].
    pub name: String,
    /// Confidence in [0, 1].
    pub confidence: f32,
    pub bbox: FaceBox,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl RecognitionResult {
    pub fn is_known(&self) -> bool {
        self.name != UNKNOWN_LABEL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: Vec<f32>) -> Embedding {
        Embedding { values, model_version: None }
    }

    fn known(name: &str, values: Vec<f32>) -> KnownFace {
        KnownFace {
            name: name.into(),
            embedding: emb(values),
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(vec![1.0, 0.0, 0.0]);
        let b = emb(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = emb(vec![1.0, 0.0]);
        let b = emb(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
        assert!((a.cosine_distance(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = emb(vec![0.0, 0.0]);
        let b = emb(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_l2_normalized_unit_length() {
        let n = emb(vec![3.0, 4.0]).l2_normalized();
        assert!((n.values[0] - 0.6).abs() < 1e-6);
        assert!((n.values[1] - 0.8).abs() < 1e-6);
        assert_eq!(emb(vec![0.0, 0.0]).l2_normalized().values, vec![0.0, 0.0]);
    }

    #[test]
    fn test_matcher_picks_minimum_distance_last_entry() {
        let query = emb(vec![1.0, 0.0, 0.0]);
        let gallery = vec![
            known("decoy1", vec![0.0, 1.0, 0.0]),
            known("decoy2", vec![0.0, 0.0, 1.0]),
            known("Alice", vec![2.0, 0.0, 0.0]),
        ];

        let result = CosineMatcher.compare(&query, &gallery, 0.6);
        assert!(result.matched);
        assert_eq!(result.index, Some(2));
        assert_eq!(result.name.as_deref(), Some("Alice"));
        assert!(result.distance.abs() < 1e-6);
        assert!((result.confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_matcher_no_match_beyond_threshold() {
        let query = emb(vec![1.0, 0.0]);
        let gallery = vec![known("Bob", vec![0.0, 1.0])];
        let result = CosineMatcher.compare(&query, &gallery, 0.6);
        assert!(!result.matched);
        assert_eq!(result.confidence, 0.0);
        assert!(result.name.is_none());
    }

    #[test]
    fn test_matcher_accepts_distance_equal_to_threshold() {
        // Orthogonal vectors sit at cosine distance exactly 1.0.
        let query = emb(vec![1.0, 0.0]);
        let gallery = vec![known("Carol", vec![0.0, 1.0])];
        let result = CosineMatcher.compare(&query, &gallery, 1.0);
        assert!(result.matched);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_matcher_empty_gallery() {
        let query = emb(vec![1.0, 0.0]);
        let result = CosineMatcher.compare(&query, &[], 0.5);
        assert!(!result.matched);
        assert!(result.distance.is_infinite());
    }

    #[test]
    fn test_matcher_skips_mismatched_dimension() {
        let query = emb(vec![1.0, 0.0]);
        let gallery = vec![known("Wrong", vec![1.0, 0.0, 0.0]), known("Right", vec![1.0, 0.1])];
        let result = CosineMatcher.compare(&query, &gallery, 0.5);
        assert_eq!(result.name.as_deref(), Some("Right"));
    }

    #[test]
    fn test_distance_to_confidence() {
        assert!((distance_to_confidence(0.3, 0.6) - 0.5).abs() < 1e-6);
        assert_eq!(distance_to_confidence(0.9, 0.6), 0.0);
        assert_eq!(distance_to_confidence(0.0, 0.0), 1.0);
    }

    #[test]
    fn test_face_box_clipped_to_frame() {
        let b = FaceBox { x: -10.0, y: 5.0, width: 50.0, height: 200.0, confidence: 1.2 };
        let c = b.clipped(100, 100).unwrap();
        assert_eq!(c.x, 0.0);
        assert_eq!(c.width, 40.0);
        assert_eq!(c.height, 95.0);
        assert_eq!(c.confidence, 1.0);
    }

    #[test]
    fn test_face_box_outside_frame_is_dropped() {
        let b = FaceBox { x: 120.0, y: 0.0, width: 10.0, height: 10.0, confidence: 0.9 };
        assert!(b.clipped(100, 100).is_none());
    }
}
