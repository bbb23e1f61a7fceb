//! Classifier bundle registry under `models/`.
//!
//! Each bundle lives in `models/<id>/` with `model.onnx` and `labels.txt`.
//! `models_metadata.json` indexes the bundles and holds the active pointer;
//! the directory tree is authoritative and the index is reconciled on every
//! [`ModelRegistry::list`].

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

pub const MODEL_FILE: &str = "model.onnx";
pub const LABELS_FILE: &str = "labels.txt";
pub const METADATA_FILE: &str = "models_metadata.json";
const DEFAULT_MODEL_NAME: &str = "model";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("source file not found: {0}")]
    SourceNotFound(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModelEntry {
    id: String,
    name: String,
    created_at: NaiveDateTime,
    model_path: PathBuf,
    labels_path: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryMetadata {
    #[serde(default)]
    models: Vec<ModelEntry>,
    #[serde(default)]
    active_model: Option<String>,
}

/// One deployable classifier bundle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelBundle {
    pub id: String,
    pub name: String,
    pub created_at: NaiveDateTime,
    pub model_path: PathBuf,
    pub labels_path: PathBuf,
    /// Empty when the label file could not be read.
    pub classes: Vec<String>,
}

impl ModelBundle {
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }
}

pub struct ModelRegistry {
    dir: PathBuf,
    metadata: RegistryMetadata,
}

impl ModelRegistry {
    /// Open the registry rooted at `dir`. The directory need not exist yet.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let metadata = load_metadata(&dir.join(METADATA_FILE));
        Self { dir, metadata }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All bundles on disk, newest first.
    ///
    /// Bundle directories missing from the index are added with the model
    /// file's mtime as their creation time.
    pub fn list(&mut self) -> Vec<ModelBundle> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        let mut bundles = Vec::new();
        let mut discovered = false;

        for entry in entries.flatten() {
            let path = entry.path();
            if !is_bundle_dir(&path) {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();

            let meta = match self.metadata.models.iter().find(|m| m.id == id) {
                Some(m) => m.clone(),
                None => {
                    let model_path = path.join(MODEL_FILE);
                    let created_at = std::fs::metadata(&model_path)
                        .and_then(|m| m.modified())
                        .map(|t| chrono::DateTime::<Local>::from(t).naive_local())
                        .unwrap_or_else(|_| Local::now().naive_local());
                    let m = ModelEntry {
                        id: id.clone(),
                        name: id.clone(),
                        created_at,
                        model_path,
                        labels_path: path.join(LABELS_FILE),
                    };
                    tracing::info!(id = %id, "discovered model bundle");
                    self.metadata.models.push(m.clone());
                    discovered = true;
                    m
                }
            };

            let labels_path = path.join(LABELS_FILE);
            let classes = match rollcall_core::labels::read_labels(&labels_path) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "unreadable label file");
                    Vec::new()
                }
            };

            bundles.push(ModelBundle {
                id,
                name: meta.name,
                created_at: meta.created_at,
                model_path: path.join(MODEL_FILE),
                labels_path,
                classes,
            });
        }

        if discovered {
            self.persist();
        }

        bundles.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        bundles
    }

    /// `(model_path, labels_path)` if `id` is a complete bundle.
    pub fn get(&self, id: &str) -> Option<(PathBuf, PathBuf)> {
        let dir = self.bundle_dir(id)?;
        is_bundle_dir(&dir).then(|| (dir.join(MODEL_FILE), dir.join(LABELS_FILE)))
    }

    /// Make `id` the active bundle and persist the choice. Unknown ids are a
    /// no-op returning false.
    pub fn set_active(&mut self, id: &str) -> bool {
        if self.get(id).is_none() {
            tracing::warn!(id, "cannot activate unknown model");
            return false;
        }
        let previous = self.metadata.active_model.replace(id.to_string());
        if let Err(e) = self.save() {
            tracing::warn!(id, error = %e, "failed to persist active model");
            self.metadata.active_model = previous;
            return false;
        }
        tracing::info!(id, "active model set");
        true
    }

    pub fn active_id(&self) -> Option<&str> {
        self.metadata.active_model.as_deref()
    }

    /// The active bundle, if one is set and still on disk.
    pub fn get_active(&mut self) -> Option<ModelBundle> {
        let id = self.metadata.active_model.clone()?;
        self.list().into_iter().find(|b| b.id == id)
    }

    /// Copy a model and label file into a new bundle directory.
    pub fn import(
        &mut self,
        model_file: &Path,
        labels_file: &Path,
        name: Option<&str>,
    ) -> Result<String, RegistryError> {
        for src in [model_file, labels_file] {
            if !src.is_file() {
                return Err(RegistryError::SourceNotFound(src.display().to_string()));
            }
        }

        let now = Local::now();
        let base = match name {
            Some(n) => {
                let safe = sanitize_name(n);
                if safe.is_empty() { DEFAULT_MODEL_NAME.to_string() } else { safe }
            }
            None => DEFAULT_MODEL_NAME.to_string(),
        };
        let stamp = now.format("%Y%m%d_%H%M%S");
        let mut id = format!("{base}_{stamp}");
        let mut n = 2;
        while self.dir.join(&id).exists() {
            id = format!("{base}_{stamp}_{n}");
            n += 1;
        }

        let bundle_dir = self.dir.join(&id);
        std::fs::create_dir_all(&bundle_dir)?;
        let model_path = bundle_dir.join(MODEL_FILE);
        let labels_path = bundle_dir.join(LABELS_FILE);
        std::fs::copy(model_file, &model_path)?;
        std::fs::copy(labels_file, &labels_path)?;

        self.metadata.models.push(ModelEntry {
            id: id.clone(),
            name: name.map(str::to_string).unwrap_or_else(|| id.clone()),
            created_at: now.naive_local(),
            model_path,
            labels_path,
        });
        self.save()?;

        tracing::info!(id = %id, source = %model_file.display(), "imported model bundle");
        Ok(id)
    }

    /// Remove a bundle directory and its index entry. Deleting the active
    /// bundle clears the active pointer.
    pub fn delete(&mut self, id: &str) -> bool {
        let Some(dir) = self.bundle_dir(id) else {
            tracing::warn!(id, "refusing to delete outside the registry");
            return false;
        };
        if !dir.is_dir() {
            return false;
        }
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            tracing::warn!(id, error = %e, "failed to delete model bundle");
            return false;
        }
        self.metadata.models.retain(|m| m.id != id);
        if self.metadata.active_model.as_deref() == Some(id) {
            self.metadata.active_model = None;
            tracing::info!(id, "deleted the active model; no model is active");
        }
        self.persist();
        true
    }

    pub fn rename(&mut self, id: &str, new_name: &str) -> bool {
        // Make sure scanned-but-unindexed bundles can be renamed too.
        if !self.metadata.models.iter().any(|m| m.id == id) {
            self.list();
        }
        let Some(entry) = self.metadata.models.iter_mut().find(|m| m.id == id) else {
            return false;
        };
        entry.name = new_name.to_string();
        self.persist();
        true
    }

    /// Case-insensitive lookup of `name` among the active bundle's classes.
    /// Returns the class label as spelled in the label file.
    pub fn find_class(&mut self, name: &str) -> Option<String> {
        let wanted = name.trim().to_lowercase();
        self.get_active()?
            .classes
            .into_iter()
            .find(|c| c.to_lowercase() == wanted)
    }

    /// `models/<id>`, or None unless `id` is a single plain path component.
    fn bundle_dir(&self, id: &str) -> Option<PathBuf> {
        let mut components = Path::new(id).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) if name == id => Some(self.dir.join(id)),
            _ => None,
        }
    }

    fn save(&self) -> Result<(), RegistryError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(METADATA_FILE);
        let tmp = self.dir.join(format!("{METADATA_FILE}.tmp"));
        std::fs::write(&tmp, serde_json::to_string_pretty(&self.metadata)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn persist(&self) {
        if let Err(e) = self.save() {
            tracing::warn!(error = %e, "failed to save model metadata");
        }
    }
}

fn load_metadata(path: &Path) -> RegistryMetadata {
    if !path.exists() {
        return RegistryMetadata::default();
    }
    let parsed = std::fs::read_to_string(path)
        .map_err(RegistryError::from)
        .and_then(|s| serde_json::from_str(&s).map_err(RegistryError::from));
    match parsed {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not load model metadata");
            RegistryMetadata::default()
        }
    }
}

fn is_bundle_dir(path: &Path) -> bool {
    path.is_dir() && path.join(MODEL_FILE).is_file() && path.join(LABELS_FILE).is_file()
}

/// Keep alphanumerics, space, `_` and `-`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '_' | '-'))
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sources(dir: &Path, labels: &str) -> (PathBuf, PathBuf) {
        let model = dir.join("src_model.onnx");
        let lbl = dir.join("src_labels.txt");
        std::fs::write(&model, b"onnx-bytes").unwrap();
        std::fs::write(&lbl, labels).unwrap();
        (model, lbl)
    }

    fn setup() -> (TempDir, ModelRegistry, PathBuf, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let (model, labels) = sources(tmp.path(), "0 Alice\n1 Bob\n");
        let registry = ModelRegistry::open(tmp.path().join("models"));
        (tmp, registry, model, labels)
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        let mut registry = ModelRegistry::open(tmp.path().join("absent"));
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_import_then_list() {
        let (_tmp, mut registry, model, labels) = setup();
        let id = registry.import(&model, &labels, Some("Staff v1!")).unwrap();
        assert!(id.starts_with("Staff v1_"));

        let bundles = registry.list();
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].id, id);
        assert_eq!(bundles[0].name, "Staff v1!");
        assert_eq!(bundles[0].classes, vec!["Alice", "Bob"]);
        assert_eq!(bundles[0].num_classes(), 2);

        // Import copies; sources stay in place.
        assert!(model.exists());
        assert!(labels.exists());
    }

    #[test]
    fn test_import_default_name() {
        let (_tmp, mut registry, model, labels) = setup();
        let id = registry.import(&model, &labels, None).unwrap();
        assert!(id.starts_with("model_"));
    }

    #[test]
    fn test_import_same_second_gets_unique_ids() {
        let (_tmp, mut registry, model, labels) = setup();
        let a = registry.import(&model, &labels, Some("x")).unwrap();
        let b = registry.import(&model, &labels, Some("x")).unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn test_import_missing_source() {
        let (tmp, mut registry, _model, labels) = setup();
        let err = registry.import(&tmp.path().join("nope.onnx"), &labels, None).unwrap_err();
        assert!(matches!(err, RegistryError::SourceNotFound(_)));
    }

    #[test]
    fn test_set_active_survives_reopen() {
        let (tmp, mut registry, model, labels) = setup();
        let a = registry.import(&model, &labels, Some("a")).unwrap();
        let b = registry.import(&model, &labels, Some("b")).unwrap();
        assert!(registry.set_active(&a));
        assert!(registry.set_active(&b));

        let mut reopened = ModelRegistry::open(tmp.path().join("models"));
        assert_eq!(reopened.get_active().unwrap().id, b);
    }

    #[test]
    fn test_set_active_unknown_is_noop() {
        let (_tmp, mut registry, model, labels) = setup();
        let a = registry.import(&model, &labels, None).unwrap();
        assert!(registry.set_active(&a));
        assert!(!registry.set_active("ghost"));
        assert_eq!(registry.active_id(), Some(a.as_str()));
    }

    #[test]
    fn test_get_active_does_not_auto_activate() {
        let (_tmp, mut registry, model, labels) = setup();
        registry.import(&model, &labels, None).unwrap();
        assert!(registry.get_active().is_none());
    }

    #[test]
    fn test_delete_active_clears_pointer() {
        let (_tmp, mut registry, model, labels) = setup();
        let id = registry.import(&model, &labels, None).unwrap();
        registry.set_active(&id);
        assert!(registry.delete(&id));
        assert!(registry.active_id().is_none());
        assert!(registry.get(&id).is_none());
        assert!(!registry.delete(&id));
    }

    #[test]
    fn test_ids_outside_models_dir_are_rejected() {
        let (tmp, mut registry, model, labels) = setup();
        registry.import(&model, &labels, None).unwrap();
        let logs = tmp.path().join("logs");
        std::fs::create_dir_all(logs.join("a").join("b")).unwrap();
        std::fs::write(logs.join("attendance.csv"), "timestamp\n").unwrap();
        std::fs::create_dir_all(tmp.path().join("models").join("a").join("b")).unwrap();

        for id in ["..", "../logs", "a/b", ".", "/tmp", ""] {
            assert!(!registry.delete(id), "{id:?} deleted");
            assert!(registry.get(id).is_none());
            assert!(!registry.set_active(id));
        }
        assert!(logs.join("attendance.csv").exists());
        assert!(tmp.path().join("models").join("a").join("b").exists());
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_rename() {
        let (_tmp, mut registry, model, labels) = setup();
        let id = registry.import(&model, &labels, None).unwrap();
        assert!(registry.rename(&id, "Front desk"));
        assert_eq!(registry.list()[0].name, "Front desk");
        assert!(!registry.rename("ghost", "x"));
    }

    #[test]
    fn test_scan_discovers_unindexed_bundle() {
        let tmp = TempDir::new().unwrap();
        let models = tmp.path().join("models");
        let dir = models.join("handmade");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MODEL_FILE), b"x").unwrap();
        std::fs::write(dir.join(LABELS_FILE), "Carol\n").unwrap();
        // Incomplete bundle is ignored.
        std::fs::create_dir_all(models.join("partial")).unwrap();
        std::fs::write(models.join("partial").join(MODEL_FILE), b"x").unwrap();

        let mut registry = ModelRegistry::open(&models);
        let bundles = registry.list();
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].id, "handmade");
        assert_eq!(bundles[0].classes, vec!["Carol"]);

        let index = std::fs::read_to_string(models.join(METADATA_FILE)).unwrap();
        assert!(index.contains("handmade"));
        assert!(registry.rename("handmade", "Hand made"));
    }

    #[test]
    fn test_list_newest_first() {
        let (tmp, mut registry, model, labels) = setup();
        let older = registry.import(&model, &labels, Some("older")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let newer = registry.import(&model, &labels, Some("newer")).unwrap();
        let ids: Vec<String> = registry.list().into_iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![newer, older]);
        drop(tmp);
    }

    #[test]
    fn test_find_class_case_insensitive() {
        let (_tmp, mut registry, model, labels) = setup();
        let id = registry.import(&model, &labels, None).unwrap();
        assert!(registry.find_class("alice").is_none(), "no active model yet");
        registry.set_active(&id);
        assert_eq!(registry.find_class("ALICE").as_deref(), Some("Alice"));
        assert!(registry.find_class("Dave").is_none());
    }

    #[test]
    fn test_corrupt_metadata_is_tolerated() {
        let tmp = TempDir::new().unwrap();
        let models = tmp.path().join("models");
        std::fs::create_dir_all(&models).unwrap();
        std::fs::write(models.join(METADATA_FILE), "{{{").unwrap();
        let mut registry = ModelRegistry::open(&models);
        assert!(registry.list().is_empty());
        assert!(registry.active_id().is_none());
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("My Model/../x"), "My Modelx");
        assert_eq!(sanitize_name("a_b-c 1"), "a_b-c 1");
        assert_eq!(sanitize_name("***"), "");
    }
}
