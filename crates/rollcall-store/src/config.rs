//! Application configuration, persisted as `config.json`.
//!
//! Every section and every field falls back to its default when missing, and
//! unknown keys are ignored, so older or hand-edited files always load.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Cosine-distance cutoff in fallback mode.
    pub threshold: f32,
    /// Face detector confidence floor.
    pub detection_confidence: f32,
    pub use_teachable_machine: bool,
    /// Minimum classifier probability for a known label.
    pub teachable_confidence: f32,
    pub active_model_id: Option<String>,
    /// SCRFD model, relative to the data root unless absolute.
    pub detector_model: PathBuf,
    /// Face-mesh model, relative to the data root unless absolute.
    pub landmark_model: PathBuf,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            detection_confidence: 0.5,
            use_teachable_machine: true,
            teachable_confidence: 0.7,
            active_model_id: None,
            detector_model: PathBuf::from("assets/det_500m.onnx"),
            landmark_model: PathBuf::from("assets/face_landmark.onnx"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Process every Nth frame.
    pub frame_skip: u32,
    /// Longest frame side handed to the detector.
    pub max_detection_size: u32,
    pub target_fps: u32,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            frame_skip: 2,
            max_detection_size: 640,
            target_fps: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttendanceConfig {
    pub cooldown_seconds: u64,
    pub auto_checkout_hours: u32,
    pub work_start_hour: u32,
    pub work_end_hour: u32,
}

impl Default for AttendanceConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: 5,
            auto_checkout_hours: 12,
            work_start_hour: 8,
            work_end_hour: 17,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub min_photos_per_person: u32,
    pub max_photos_per_person: u32,
    /// Seconds between accepted captures.
    pub photo_capture_interval: f32,
    pub min_face_size: u32,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            min_photos_per_person: 20,
            max_photos_per_person: 50,
            photo_capture_interval: 0.5,
            min_face_size: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub auto_backup: bool,
    pub backup_interval_days: u32,
    pub backup_retention_days: u32,
    pub max_log_size_mb: u32,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            auto_backup: true,
            backup_interval_days: 1,
            backup_retention_days: 30,
            max_log_size_mb: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuiConfig {
    pub window_width: u32,
    pub window_height: u32,
    pub theme: String,
    pub webcam_width: u32,
    pub webcam_height: u32,
}

impl Default for GuiConfig {
    fn default() -> Self {
        Self {
            window_width: 1200,
            window_height: 700,
            theme: "light".to_string(),
            webcam_width: 640,
            webcam_height: 480,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub recognition: RecognitionConfig,
    pub performance: PerformanceConfig,
    pub attendance: AttendanceConfig,
    pub dataset: DatasetConfig,
    pub backup: BackupConfig,
    pub gui: GuiConfig,
}

impl AppConfig {
    /// Load from `path`. A missing file yields defaults; an unreadable or
    /// unparseable one is logged and also yields defaults.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(Some(config)) => {
                tracing::debug!(path = %path.display(), "loaded config");
                config
            }
            Ok(None) => {
                tracing::info!(path = %path.display(), "no config file, using defaults");
                Self::default()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "config unreadable, using defaults");
                Self::default()
            }
        }
    }

    fn try_load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::debug!(path = %path.display(), "saved config");
        Ok(())
    }

    /// Set `category.key` to `value`.
    ///
    /// Returns false, leaving the config unchanged, for an unknown category
    /// or key or a value of the wrong type.
    pub fn update_setting(&mut self, category: &str, key: &str, value: serde_json::Value) -> bool {
        let Ok(mut tree) = serde_json::to_value(&*self) else {
            return false;
        };
        let Some(slot) = tree.get_mut(category).and_then(|section| section.get_mut(key)) else {
            tracing::warn!(category, key, "unknown config setting");
            return false;
        };
        *slot = value;

        match serde_json::from_value::<AppConfig>(tree) {
            Ok(updated) => {
                *self = updated;
                true
            }
            Err(e) => {
                tracing::warn!(category, key, error = %e, "rejected config value");
                false
            }
        }
    }

    pub fn reset_to_defaults(&mut self) {
        *self = Self::default();
    }

    /// Minimum confidence the attendance gate requires in the given mode.
    pub fn min_attendance_confidence(&self, classifier_mode: bool) -> f32 {
        if classifier_mode {
            self.recognition.teachable_confidence
        } else {
            (1.0 - self.recognition.threshold).max(0.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let c = AppConfig::default();
        assert_eq!(c.recognition.threshold, 0.6);
        assert_eq!(c.recognition.teachable_confidence, 0.7);
        assert!(c.recognition.use_teachable_machine);
        assert!(c.recognition.active_model_id.is_none());
        assert_eq!(c.performance.frame_skip, 2);
        assert_eq!(c.attendance.cooldown_seconds, 5);
        assert_eq!(c.dataset.min_photos_per_person, 20);
        assert_eq!(c.dataset.max_photos_per_person, 50);
        assert_eq!(c.gui.theme, "light");
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut c = AppConfig::default();
        c.recognition.threshold = 0.45;
        c.recognition.active_model_id = Some("staff_20250101_090000".into());
        c.attendance.cooldown_seconds = 30;
        c.gui.theme = "dark".into();
        c.save(&path).unwrap();

        assert_eq!(AppConfig::load(&path), c);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(AppConfig::load(&dir.path().join("nope.json")), AppConfig::default());
    }

    #[test]
    fn test_unparseable_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(AppConfig::load(&path), AppConfig::default());
    }

    #[test]
    fn test_partial_file_and_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"recognition": {"threshold": 0.5, "model_name": "Facenet512"}, "extra": 1}"#,
        )
        .unwrap();
        let c = AppConfig::load(&path);
        assert_eq!(c.recognition.threshold, 0.5);
        assert_eq!(c.recognition.teachable_confidence, 0.7);
        assert_eq!(c.performance, PerformanceConfig::default());
    }

    #[test]
    fn test_update_setting() {
        let mut c = AppConfig::default();
        assert!(c.update_setting("attendance", "cooldown_seconds", json!(60)));
        assert_eq!(c.attendance.cooldown_seconds, 60);
        assert!(c.update_setting("recognition", "active_model_id", json!("m_1")));
        assert_eq!(c.recognition.active_model_id.as_deref(), Some("m_1"));
        assert!(c.update_setting("recognition", "active_model_id", serde_json::Value::Null));
        assert!(c.recognition.active_model_id.is_none());
    }

    #[test]
    fn test_update_setting_rejects_unknown_and_mistyped() {
        let mut c = AppConfig::default();
        assert!(!c.update_setting("nope", "threshold", json!(0.1)));
        assert!(!c.update_setting("recognition", "nope", json!(0.1)));
        assert!(!c.update_setting("recognition", "threshold", json!("high")));
        assert!(!c.update_setting("performance", "frame_skip", json!(-1)));
        assert_eq!(c, AppConfig::default());
    }

    #[test]
    fn test_reset_to_defaults() {
        let mut c = AppConfig::default();
        c.gui.window_width = 10;
        c.reset_to_defaults();
        assert_eq!(c, AppConfig::default());
    }

    #[test]
    fn test_min_attendance_confidence() {
        let c = AppConfig::default();
        assert_eq!(c.min_attendance_confidence(true), 0.7);
        assert!((c.min_attendance_confidence(false) - 0.4).abs() < 1e-6);
    }
}
