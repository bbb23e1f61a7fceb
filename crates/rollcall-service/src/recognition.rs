//! Per-frame recognition: locate every face, encode each crop, and resolve
//! the prediction to a name and confidence.

use image::RgbImage;
use rollcall_core::{
    imaging, CosineMatcher, FaceEncoder, FaceLocator, KnownFace, Matcher, Prediction,
    RecognitionResult, UNKNOWN_LABEL,
};
use serde::Serialize;
use std::time::{Duration, Instant};

/// Which encoder variant the service runs. Fixed for the service's lifetime.
pub enum RecognitionMode {
    /// A trained classifier bundle maps crops straight to labels.
    Classifier {
        encoder: Box<dyn FaceEncoder>,
        model_id: String,
    },
    /// Landmark embeddings matched by cosine distance against enrolled faces.
    Fallback {
        encoder: Box<dyn FaceEncoder>,
        gallery: Vec<KnownFace>,
        threshold: f32,
    },
}

impl RecognitionMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Classifier { .. } => "classifier",
            Self::Fallback { .. } => "fallback",
        }
    }

    fn encoder(&self) -> &dyn FaceEncoder {
        match self {
            Self::Classifier { encoder, .. } | Self::Fallback { encoder, .. } => encoder.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecognitionSettings {
    /// Process every Nth frame; 0 and 1 both mean every frame.
    pub frame_skip: u32,
    /// Frames with a longer side are downscaled before detection. 0 disables.
    pub max_detection_size: u32,
}

impl Default for RecognitionSettings {
    fn default() -> Self {
        Self {
            frame_skip: 2,
            max_detection_size: 640,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecognitionStats {
    pub frames_processed: u64,
    pub faces_recognized: u64,
    pub unknown_faces: u64,
    pub avg_processing_ms: f64,
}

/// Readiness report returned by [`RecognitionService::validate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceReport {
    pub mode: &'static str,
    pub model: String,
    pub ready: bool,
    pub known_faces: usize,
    pub issues: Vec<String>,
}

/// Results for one frame, and whether they were computed for it or reused
/// from the last processed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutcome {
    pub results: Vec<RecognitionResult>,
    pub fresh: bool,
}

pub struct RecognitionService {
    locator: Box<dyn FaceLocator>,
    mode: RecognitionMode,
    settings: RecognitionSettings,
    frame_counter: u64,
    last_results: Vec<RecognitionResult>,
    stats: RecognitionStats,
    total_processing: Duration,
}

impl RecognitionService {
    pub fn new(locator: Box<dyn FaceLocator>, mode: RecognitionMode, settings: RecognitionSettings) -> Self {
        tracing::info!(
            mode = mode.name(),
            model = mode.encoder().model_tag(),
            frame_skip = settings.frame_skip,
            max_detection_size = settings.max_detection_size,
            "recognition service ready"
        );
        Self {
            locator,
            mode,
            settings,
            frame_counter: 0,
            last_results: Vec::new(),
            stats: RecognitionStats::default(),
            total_processing: Duration::ZERO,
        }
    }

    pub fn mode(&self) -> &RecognitionMode {
        &self.mode
    }

    pub fn is_classifier_mode(&self) -> bool {
        matches!(self.mode, RecognitionMode::Classifier { .. })
    }

    pub fn stats(&self) -> &RecognitionStats {
        &self.stats
    }

    /// Results for `frame`, honouring `frame_skip`: skipped frames get the
    /// previous frame's results.
    pub fn recognize_faces(&mut self, frame: &RgbImage) -> Vec<RecognitionResult> {
        self.process_frame(frame).results
    }

    pub fn process_frame(&mut self, frame: &RgbImage) -> FrameOutcome {
        let skip = u64::from(self.settings.frame_skip.max(1));
        let index = self.frame_counter;
        self.frame_counter += 1;
        if index % skip != 0 {
            return FrameOutcome {
                results: self.last_results.clone(),
                fresh: false,
            };
        }

        let started = Instant::now();
        let results = self.recognize(frame);
        self.record_stats(&results, started.elapsed());
        self.last_results = results.clone();
        FrameOutcome { results, fresh: true }
    }

    /// Run the full pipeline on one frame, ignoring `frame_skip`.
    ///
    /// Model failures drop the affected result and are logged.
    pub fn recognize(&self, frame: &RgbImage) -> Vec<RecognitionResult> {
        let (scaled, factor) = imaging::limit_size(frame, self.settings.max_detection_size);
        let faces = match self.locator.locate(&scaled) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "face location failed, dropping frame");
                return Vec::new();
            }
        };

        let mut results = Vec::with_capacity(faces.len());
        for face in faces {
            let Some(bbox) = face.scaled(factor).clipped(frame.width(), frame.height()) else {
                continue;
            };
            let Some(crop) = imaging::crop_face(frame, &bbox) else {
                continue;
            };
            let prediction = match self.mode.encoder().encode(&crop) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error = %e, "face encoding failed, dropping result");
                    continue;
                }
            };
            if let Some(result) = self.resolve(prediction, bbox) {
                results.push(result);
            }
        }
        results
    }

    fn resolve(&self, prediction: Prediction, bbox: rollcall_core::FaceBox) -> Option<RecognitionResult> {
        match prediction {
            Prediction::Nothing => None,
            Prediction::Classification { label, confidence } => Some(RecognitionResult {
                name: label,
                confidence: confidence.clamp(0.0, 1.0),
                bbox,
                metadata: None,
            }),
            Prediction::Embedding(embedding) => {
                let RecognitionMode::Fallback { gallery, threshold, .. } = &self.mode else {
                    tracing::warn!("classifier returned an embedding, ignoring");
                    return None;
                };
                let m = CosineMatcher.compare(&embedding, gallery, *threshold);
                let result = match m.index {
                    Some(idx) if m.matched => RecognitionResult {
                        name: gallery[idx].name.clone(),
                        confidence: m.confidence,
                        bbox,
                        metadata: Some(gallery[idx].metadata.clone()).filter(|v| !v.is_null()),
                    },
                    _ => RecognitionResult {
                        name: UNKNOWN_LABEL.to_string(),
                        confidence: 0.0,
                        bbox,
                        metadata: None,
                    },
                };
                tracing::debug!(name = %result.name, distance = m.distance, "fallback match");
                Some(result)
            }
        }
    }

    fn record_stats(&mut self, results: &[RecognitionResult], elapsed: Duration) {
        self.stats.frames_processed += 1;
        for r in results {
            if r.is_known() {
                self.stats.faces_recognized += 1;
            } else {
                self.stats.unknown_faces += 1;
            }
        }
        self.total_processing += elapsed;
        self.stats.avg_processing_ms =
            self.total_processing.as_secs_f64() * 1000.0 / self.stats.frames_processed as f64;
    }

    /// Check that the loaded components can produce known identities.
    pub fn validate(&self) -> ServiceReport {
        let mut issues = Vec::new();
        let (model, known_faces) = match &self.mode {
            RecognitionMode::Classifier { model_id, .. } => (model_id.clone(), 0),
            RecognitionMode::Fallback { encoder, gallery, threshold } => {
                if gallery.is_empty() {
                    issues.push("no enrolled embeddings; every face will be Unknown".to_string());
                }
                if *threshold <= 0.0 {
                    issues.push(format!("recognition threshold {threshold} accepts nothing"));
                }
                let tag = encoder.model_tag();
                let foreign = gallery
                    .iter()
                    .filter(|k| k.embedding.model_version.as_deref().is_some_and(|v| v != tag))
                    .count();
                if foreign > 0 {
                    issues.push(format!("{foreign} embeddings were generated by a different model"));
                }
                (tag.to_string(), gallery.len())
            }
        };
        ServiceReport {
            mode: self.mode.name(),
            model,
            ready: issues.is_empty(),
            known_faces,
            issues,
        }
    }
}
