//! Startup: pick the recognition mode from config and what is on disk, load
//! the models, and report anything missing instead of failing.

use crate::recognition::{RecognitionMode, RecognitionService, RecognitionSettings};
use rollcall_core::{
    ClassifierEncoder, DetectorError, EncoderError, FaceDetector, LandmarkEncoder,
};
use rollcall_hw::CameraError;
use rollcall_store::{
    AppConfig, AttendanceError, DataPaths, DatasetError, DatasetStore, ModelBundle, ModelRegistry,
};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),
    #[error("dataset error: {0}")]
    Dataset(#[from] DatasetError),
    #[error("attendance error: {0}")]
    Attendance(#[from] AttendanceError),
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("camera loop error: {0}")]
    Loop(#[from] crate::camera_loop::LoopError),
    #[error("recognition unavailable: {0}")]
    Unavailable(String),
}

/// Something missing at startup. The application still comes up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Degraded {
    /// No face detector; nothing can be recognized or enrolled.
    NoDetector(String),
    /// Classifier mode wanted but unusable; running in fallback mode.
    ClassifierUnavailable(String),
    /// Fallback mode wanted but the landmark model failed to load.
    NoLandmarkModel(String),
    /// Fallback mode with no enrolled embeddings.
    NoEmbeddings,
}

impl fmt::Display for Degraded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDetector(why) => write!(f, "face detector unavailable ({why})"),
            Self::ClassifierUnavailable(why) => {
                write!(f, "trained model unavailable ({why}); using landmark fallback")
            }
            Self::NoLandmarkModel(why) => write!(f, "landmark model unavailable ({why})"),
            Self::NoEmbeddings => write!(f, "no enrolled embeddings; rebuild embeddings after enrolling"),
        }
    }
}

pub struct Startup {
    pub service: Option<RecognitionService>,
    /// The bundle the classifier was loaded from.
    pub active_model: Option<ModelBundle>,
    pub notices: Vec<Degraded>,
}

impl Startup {
    pub fn is_degraded(&self) -> bool {
        !self.notices.is_empty()
    }

    /// The service, or an error naming what is missing.
    pub fn into_service(self) -> Result<RecognitionService, ServiceError> {
        let reasons: Vec<String> = self.notices.iter().map(ToString::to_string).collect();
        self.service
            .ok_or_else(|| ServiceError::Unavailable(reasons.join("; ")))
    }
}

pub fn recognition_settings(config: &AppConfig) -> RecognitionSettings {
    RecognitionSettings {
        frame_skip: config.performance.frame_skip,
        max_detection_size: config.performance.max_detection_size,
    }
}

pub fn load_detector(paths: &DataPaths, config: &AppConfig) -> Result<FaceDetector, DetectorError> {
    FaceDetector::load(
        &paths.resolve(&config.recognition.detector_model),
        config.recognition.detection_confidence,
    )
}

/// The bundle classifier mode should use, without changing anything: the
/// registry's active bundle, else the configured id, else the newest bundle.
pub fn choose_bundle(config: &AppConfig, registry: &mut ModelRegistry) -> Option<ModelBundle> {
    if let Some(active) = registry.get_active() {
        return Some(active);
    }
    let bundles = registry.list();
    if let Some(id) = config.recognition.active_model_id.as_deref() {
        match bundles.iter().find(|b| b.id == id) {
            Some(configured) => return Some(configured.clone()),
            None => tracing::warn!(id, "configured model not found in registry"),
        }
    }
    bundles.into_iter().next()
}

/// [`choose_bundle`], then make the choice the registry's active bundle.
pub fn select_bundle(config: &AppConfig, registry: &mut ModelRegistry) -> Option<ModelBundle> {
    let bundle = choose_bundle(config, registry)?;
    if registry.active_id() != Some(bundle.id.as_str()) {
        tracing::info!(id = %bundle.id, "no active model, activating");
        registry.set_active(&bundle.id);
    }
    Some(bundle)
}

/// Build the recognition service. Never fails; whatever is missing is
/// returned in [`Startup::notices`]. May activate a bundle when none is.
pub fn start(
    paths: &DataPaths,
    config: &AppConfig,
    registry: &mut ModelRegistry,
    dataset: &DatasetStore,
) -> Startup {
    build(paths, config, registry, dataset, true)
}

/// Same as [`start`] but leaves the registry's active pointer alone.
pub fn check_readiness(
    paths: &DataPaths,
    config: &AppConfig,
    registry: &mut ModelRegistry,
    dataset: &DatasetStore,
) -> Startup {
    build(paths, config, registry, dataset, false)
}

fn build(
    paths: &DataPaths,
    config: &AppConfig,
    registry: &mut ModelRegistry,
    dataset: &DatasetStore,
    activate: bool,
) -> Startup {
    let mut notices = Vec::new();

    let detector = match load_detector(paths, config) {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!(error = %e, "face detector failed to load");
            notices.push(Degraded::NoDetector(e.to_string()));
            return Startup { service: None, active_model: None, notices };
        }
    };

    let mut active_model = None;
    let mut mode = None;
    if config.recognition.use_teachable_machine {
        let bundle = if activate {
            select_bundle(config, registry)
        } else {
            choose_bundle(config, registry)
        };
        match bundle {
            Some(bundle) => match load_classifier(&bundle, config) {
                Ok(encoder) => {
                    mode = Some(RecognitionMode::Classifier {
                        encoder: Box::new(encoder),
                        model_id: bundle.id.clone(),
                    });
                    active_model = Some(bundle);
                }
                Err(e) => {
                    tracing::warn!(id = %bundle.id, error = %e, "classifier failed to load, falling back");
                    notices.push(Degraded::ClassifierUnavailable(format!("{}: {e}", bundle.id)));
                }
            },
            None => {
                tracing::warn!("no trained model found, falling back to landmarks");
                notices.push(Degraded::ClassifierUnavailable("no model imported".into()));
            }
        }
    }

    let mode = match mode {
        Some(mode) => mode,
        None => match load_fallback(paths, config, dataset, &mut notices) {
            Some(mode) => mode,
            None => return Startup { service: None, active_model: None, notices },
        },
    };

    let service = RecognitionService::new(Box::new(detector), mode, recognition_settings(config));
    Startup {
        service: Some(service),
        active_model,
        notices,
    }
}

fn load_classifier(bundle: &ModelBundle, config: &AppConfig) -> Result<ClassifierEncoder, EncoderError> {
    ClassifierEncoder::load(
        &bundle.model_path,
        &bundle.labels_path,
        config.recognition.teachable_confidence,
        &bundle.id,
    )
}

fn load_fallback(
    paths: &DataPaths,
    config: &AppConfig,
    dataset: &DatasetStore,
    notices: &mut Vec<Degraded>,
) -> Option<RecognitionMode> {
    let encoder = match LandmarkEncoder::load(&paths.resolve(&config.recognition.landmark_model)) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(error = %e, "landmark model failed to load");
            notices.push(Degraded::NoLandmarkModel(e.to_string()));
            return None;
        }
    };

    let gallery = match dataset.load_embeddings() {
        Ok(set) => set.known_faces(),
        Err(e) => {
            tracing::warn!(error = %e, "embeddings unreadable, starting with none");
            Vec::new()
        }
    };
    if gallery.is_empty() {
        notices.push(Degraded::NoEmbeddings);
    }

    Some(RecognitionMode::Fallback {
        encoder: Box::new(encoder),
        gallery,
        threshold: config.recognition.threshold,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn bundle_source(dir: &Path, labels: &str) -> (std::path::PathBuf, std::path::PathBuf) {
        std::fs::create_dir_all(dir).unwrap();
        let model = dir.join("model.onnx");
        let labels_path = dir.join("labels.txt");
        std::fs::write(&model, b"onnx").unwrap();
        std::fs::write(&labels_path, labels).unwrap();
        (model, labels_path)
    }

    #[test]
    fn test_missing_detector_is_degraded_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let paths = DataPaths::new(tmp.path());
        let config = AppConfig::default();
        let mut registry = ModelRegistry::open(&paths.models);
        let dataset = DatasetStore::open(&paths.dataset, &paths.dataset_export).unwrap();

        let startup = start(&paths, &config, &mut registry, &dataset);
        assert!(startup.service.is_none());
        assert!(startup.is_degraded());
        assert!(matches!(startup.notices[0], Degraded::NoDetector(_)));
        let err = startup.into_service().err().unwrap();
        assert!(err.to_string().contains("face detector unavailable"));
    }

    #[test]
    fn test_select_bundle_prefers_registry_active() {
        let tmp = TempDir::new().unwrap();
        let (m, l) = bundle_source(&tmp.path().join("src"), "0 Alice\n");
        let mut registry = ModelRegistry::open(tmp.path().join("models"));
        let a = registry.import(&m, &l, Some("a")).unwrap();
        let b = registry.import(&m, &l, Some("b")).unwrap();
        assert!(registry.set_active(&a));

        let config = AppConfig::default();
        assert_eq!(select_bundle(&config, &mut registry).unwrap().id, a);

        // Restart with B activated: the persisted pointer is kept.
        assert!(registry.set_active(&b));
        let mut reopened = ModelRegistry::open(tmp.path().join("models"));
        assert_eq!(select_bundle(&config, &mut reopened).unwrap().id, b);
    }

    #[test]
    fn test_select_bundle_config_override_and_newest() {
        let tmp = TempDir::new().unwrap();
        let (m, l) = bundle_source(&tmp.path().join("src"), "Alice\nBob\n");
        let mut registry = ModelRegistry::open(tmp.path().join("models"));
        let a = registry.import(&m, &l, Some("a")).unwrap();
        let b = registry.import(&m, &l, Some("b")).unwrap();

        let mut config = AppConfig::default();
        config.recognition.active_model_id = Some(a.clone());
        assert_eq!(select_bundle(&config, &mut registry).unwrap().id, a);
        assert_eq!(registry.active_id(), Some(a.as_str()));

        // Nothing configured or active: the newest bundle is chosen.
        assert!(registry.delete(&a));
        config.recognition.active_model_id = None;
        let chosen = select_bundle(&config, &mut registry).unwrap();
        assert_eq!(chosen.id, b);
        assert_eq!(chosen.classes, vec!["Alice".to_string(), "Bob".to_string()]);
        assert_eq!(registry.active_id(), Some(b.as_str()));
    }

    #[test]
    fn test_registry_choice_beats_stale_config() {
        let tmp = TempDir::new().unwrap();
        let (m, l) = bundle_source(&tmp.path().join("src"), "Alice\n");
        let mut registry = ModelRegistry::open(tmp.path().join("models"));
        let a = registry.import(&m, &l, Some("a")).unwrap();
        let b = registry.import(&m, &l, Some("b")).unwrap();

        let mut config = AppConfig::default();
        config.recognition.active_model_id = Some(a.clone());
        assert_eq!(select_bundle(&config, &mut registry).unwrap().id, a);

        // Activated elsewhere, then restart with the old id still in config.
        assert!(registry.set_active(&b));
        let mut reopened = ModelRegistry::open(tmp.path().join("models"));
        assert_eq!(select_bundle(&config, &mut reopened).unwrap().id, b);
        assert_eq!(reopened.get_active().unwrap().id, b);
    }

    #[test]
    fn test_choose_bundle_leaves_pointer_alone() {
        let tmp = TempDir::new().unwrap();
        let (m, l) = bundle_source(&tmp.path().join("src"), "Alice\n");
        let mut registry = ModelRegistry::open(tmp.path().join("models"));
        let a = registry.import(&m, &l, Some("a")).unwrap();

        assert_eq!(choose_bundle(&AppConfig::default(), &mut registry).unwrap().id, a);
        assert!(registry.active_id().is_none());
        let mut reopened = ModelRegistry::open(tmp.path().join("models"));
        assert!(reopened.get_active().is_none());
    }

    #[test]
    fn test_check_readiness_without_detector() {
        let tmp = TempDir::new().unwrap();
        let paths = DataPaths::new(tmp.path());
        let mut registry = ModelRegistry::open(&paths.models);
        let dataset = DatasetStore::open(&paths.dataset, &paths.dataset_export).unwrap();
        let startup = check_readiness(&paths, &AppConfig::default(), &mut registry, &dataset);
        assert!(startup.service.is_none());
        assert!(matches!(startup.notices[0], Degraded::NoDetector(_)));
    }

    #[test]
    fn test_select_bundle_empty_registry() {
        let tmp = TempDir::new().unwrap();
        let mut registry = ModelRegistry::open(tmp.path().join("models"));
        assert!(select_bundle(&AppConfig::default(), &mut registry).is_none());
    }

    #[test]
    fn test_degraded_messages() {
        assert_eq!(
            Degraded::NoEmbeddings.to_string(),
            "no enrolled embeddings; rebuild embeddings after enrolling"
        );
        assert!(Degraded::ClassifierUnavailable("x".into()).to_string().contains("landmark fallback"));
    }
}
