//! Enrollment dataset under `dataset/`, with its training mirror under
//! `dataset_export/`.
//!
//! Layout per person: `dataset/<person_id>/<person_id>_<NNN>.jpg`, where
//! `person_id` is the lowercased display name with spaces replaced by `_`.
//! `dataset/metadata.json` indexes persons; `dataset/encodings.msgpack` holds
//! fallback-mode embeddings.

use chrono::{Local, NaiveDateTime};
use image::RgbImage;
use rollcall_core::{Embedding, FaceEncoder, KnownFace, Prediction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const METADATA_FILE: &str = "metadata.json";
pub const EMBEDDINGS_FILE: &str = "encodings.msgpack";
pub const METADATA_EXPORT_FILE: &str = "dataset_export.json";

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("person not found: {0}")]
    UnknownPerson(String),
    #[error("invalid person name: {0:?}")]
    InvalidName(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("embedding encode: {0}")]
    EmbeddingEncode(#[from] rmp_serde::encode::Error),
    #[error("embedding decode: {0}")]
    EmbeddingDecode(#[from] rmp_serde::decode::Error),
}

/// Optional descriptive fields supplied at enrollment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersonInfo {
    pub employee_id: Option<String>,
    pub department: Option<String>,
    pub contact: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonRecord {
    pub name: String,
    #[serde(default)]
    pub employee_id: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
    pub created_at: NaiveDateTime,
    #[serde(default)]
    pub image_count: u32,
    #[serde(default)]
    pub encoding_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct DatasetMetadata {
    #[serde(default)]
    persons: BTreeMap<String, PersonRecord>,
    created_at: NaiveDateTime,
    #[serde(default)]
    updated_at: Option<NaiveDateTime>,
}

impl Default for DatasetMetadata {
    fn default() -> Self {
        Self {
            persons: BTreeMap::new(),
            created_at: Local::now().naive_local(),
            updated_at: None,
        }
    }
}

/// Per-embedding provenance, parallel to [`EmbeddingSet::vectors`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingMeta {
    pub person_id: String,
    pub employee_id: Option<String>,
    pub department: Option<String>,
    pub image_file: String,
}

/// Fallback-mode embedding database: three parallel arrays plus the tag of
/// the encoder that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingSet {
    pub model: String,
    pub generated_at: Option<NaiveDateTime>,
    pub vectors: Vec<Vec<f32>>,
    pub names: Vec<String>,
    pub metadata: Vec<EmbeddingMeta>,
}

impl EmbeddingSet {
    pub fn empty() -> Self {
        Self {
            model: String::new(),
            generated_at: None,
            vectors: Vec::new(),
            names: Vec::new(),
            metadata: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Gallery form used by the matcher.
    pub fn known_faces(&self) -> Vec<KnownFace> {
        self.vectors
            .iter()
            .zip(&self.names)
            .enumerate()
            .map(|(i, (values, name))| KnownFace {
                name: name.clone(),
                embedding: Embedding {
                    values: values.clone(),
                    model_version: Some(self.model.clone()),
                },
                metadata: self
                    .metadata
                    .get(i)
                    .and_then(|m| serde_json::to_value(m).ok())
                    .unwrap_or(serde_json::Value::Null),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetStats {
    pub total_persons: usize,
    pub total_images: u64,
    pub total_encodings: u64,
    pub dataset_path: PathBuf,
    pub has_embeddings: bool,
}

#[derive(Serialize)]
struct MetadataExport<'a> {
    dataset_path: &'a Path,
    exported_at: NaiveDateTime,
    statistics: DatasetStats,
    persons: &'a BTreeMap<String, PersonRecord>,
}

/// Person id for a display name: lowercase, spaces → `_`.
pub fn person_id_for(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

pub struct DatasetStore {
    dir: PathBuf,
    export_dir: PathBuf,
    metadata: DatasetMetadata,
}

impl DatasetStore {
    /// Open the store, creating `dir` if needed.
    pub fn open(dir: impl Into<PathBuf>, export_dir: impl Into<PathBuf>) -> Result<Self, DatasetError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let metadata = load_metadata(&dir.join(METADATA_FILE));
        Ok(Self {
            dir,
            export_dir: export_dir.into(),
            metadata,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }

    pub fn person_dir(&self, person_id: &str) -> PathBuf {
        self.dir.join(person_id)
    }

    /// Register a person (or refresh an existing one) and create their folder.
    ///
    /// Re-adding keeps the original creation time and counts; supplied
    /// descriptive fields replace the stored ones.
    pub fn add_person(&mut self, name: &str, info: PersonInfo) -> Result<String, DatasetError> {
        let name = name.trim();
        let person_id = person_id_for(name);
        if person_id.is_empty() || person_id.contains(['/', '\\']) || person_id.starts_with('.') {
            return Err(DatasetError::InvalidName(name.to_string()));
        }
        std::fs::create_dir_all(self.person_dir(&person_id))?;

        let record = self
            .metadata
            .persons
            .entry(person_id.clone())
            .or_insert_with(|| PersonRecord {
                name: name.to_string(),
                employee_id: None,
                department: None,
                contact: None,
                created_at: Local::now().naive_local(),
                image_count: 0,
                encoding_count: 0,
            });
        record.name = name.to_string();
        if info.employee_id.is_some() {
            record.employee_id = info.employee_id;
        }
        if info.department.is_some() {
            record.department = info.department;
        }
        if info.contact.is_some() {
            record.contact = info.contact;
        }
        self.save_metadata()?;

        tracing::info!(name, person_id = %person_id, "person added");
        Ok(person_id)
    }

    pub fn person(&self, person_id: &str) -> Option<&PersonRecord> {
        self.metadata.persons.get(person_id)
    }

    /// All persons, ordered by id.
    pub fn list_persons(&self) -> Vec<(String, PersonRecord)> {
        self.metadata
            .persons
            .iter()
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect()
    }

    /// Image files in a person's folder, sorted by name.
    pub fn get_person_images(&self, person_id: &str) -> Result<Vec<PathBuf>, DatasetError> {
        let dir = self.person_dir(person_id);
        if !dir.is_dir() {
            return Err(DatasetError::UnknownPerson(person_id.to_string()));
        }
        list_images(&dir)
    }

    /// Persist one accepted capture as the next `<person_id>_<NNN>.jpg`.
    pub fn save_capture(&mut self, person_id: &str, face: &RgbImage) -> Result<PathBuf, DatasetError> {
        if !self.metadata.persons.contains_key(person_id) {
            return Err(DatasetError::UnknownPerson(person_id.to_string()));
        }
        let dir = self.person_dir(person_id);
        if !dir.is_dir() {
            return Err(DatasetError::UnknownPerson(person_id.to_string()));
        }

        let images = list_images(&dir)?;
        let next = images
            .iter()
            .filter_map(|p| capture_index(person_id, p))
            .max()
            .unwrap_or(0)
            + 1;
        let path = dir.join(format!("{person_id}_{next:03}.jpg"));
        face.save(&path)?;

        if let Some(record) = self.metadata.persons.get_mut(person_id) {
            record.image_count = images.len() as u32 + 1;
        }
        self.save_metadata()?;

        tracing::debug!(person_id, path = %path.display(), "capture saved");
        Ok(path)
    }

    /// Remove a person's captured images (dataset and export mirror), e.g.
    /// before re-training an existing class.
    pub fn clear_person_images(&mut self, person_id: &str) -> Result<usize, DatasetError> {
        let images = self.get_person_images(person_id)?;
        for img in &images {
            std::fs::remove_file(img)?;
        }
        let export = self.export_dir.join(person_id);
        if export.is_dir() {
            std::fs::remove_dir_all(&export)?;
        }
        if let Some(record) = self.metadata.persons.get_mut(person_id) {
            record.image_count = 0;
            record.encoding_count = 0;
        }
        self.save_metadata()?;
        tracing::info!(person_id, removed = images.len(), "cleared person images");
        Ok(images.len())
    }

    /// Mirror a person's images into `dataset_export/<person_id>/`.
    pub fn export_training_data(&self, person_id: &str) -> Result<PathBuf, DatasetError> {
        let images = self.get_person_images(person_id)?;
        let out = self.export_dir.join(person_id);
        std::fs::create_dir_all(&out)?;
        for img in &images {
            if let Some(file_name) = img.file_name() {
                std::fs::copy(img, out.join(file_name))?;
            }
        }
        tracing::info!(person_id, images = images.len(), dir = %out.display(), "exported training data");
        Ok(out)
    }

    /// Encode every person's images and write the embedding database.
    ///
    /// Images the encoder cannot use are logged and skipped. Returns the number
    /// of embeddings written.
    pub fn generate_embeddings(&mut self, encoder: &dyn FaceEncoder) -> Result<usize, DatasetError> {
        let mut set = EmbeddingSet::empty();
        set.model = encoder.model_tag().to_string();
        set.generated_at = Some(Local::now().naive_local());

        let persons: Vec<(String, PersonRecord)> = self.list_persons();
        for (person_id, record) in &persons {
            let dir = self.person_dir(person_id);
            if !dir.is_dir() {
                continue;
            }
            let images = list_images(&dir)?;
            if images.is_empty() {
                tracing::warn!(person_id = %person_id, "no images found");
            }

            let mut count = 0u32;
            for path in &images {
                let file_name = path.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default();
                let img = match image::open(path) {
                    Ok(i) => i.to_rgb8(),
                    Err(e) => {
                        tracing::warn!(image = %path.display(), error = %e, "unreadable image, skipping");
                        continue;
                    }
                };
                match encoder.encode(&img) {
                    Ok(Prediction::Embedding(embedding)) => {
                        set.vectors.push(embedding.values);
                        set.names.push(record.name.clone());
                        set.metadata.push(EmbeddingMeta {
                            person_id: person_id.clone(),
                            employee_id: record.employee_id.clone(),
                            department: record.department.clone(),
                            image_file: file_name,
                        });
                        count += 1;
                    }
                    Ok(_) => {
                        tracing::warn!(image = %path.display(), "no landmarks found, skipping");
                    }
                    Err(e) => {
                        tracing::warn!(image = %path.display(), error = %e, "encoding failed, skipping");
                    }
                }
            }

            if let Some(r) = self.metadata.persons.get_mut(person_id) {
                r.encoding_count = count;
            }
            tracing::info!(person_id = %person_id, encodings = count, "person encoded");
        }

        let bytes = rmp_serde::to_vec_named(&set)?;
        std::fs::write(self.dir.join(EMBEDDINGS_FILE), bytes)?;
        self.save_metadata()?;

        tracing::info!(total = set.len(), model = %set.model, "embeddings generated");
        Ok(set.len())
    }

    /// Load the embedding database; an absent file yields an empty set.
    pub fn load_embeddings(&self) -> Result<EmbeddingSet, DatasetError> {
        let path = self.dir.join(EMBEDDINGS_FILE);
        if !path.exists() {
            tracing::info!(path = %path.display(), "no embeddings file");
            return Ok(EmbeddingSet::empty());
        }
        let bytes = std::fs::read(&path)?;
        let set: EmbeddingSet = rmp_serde::from_slice(&bytes)?;
        tracing::info!(count = set.len(), model = %set.model, "loaded embeddings");
        Ok(set)
    }

    pub fn statistics(&self) -> DatasetStats {
        let persons = self.metadata.persons.values();
        DatasetStats {
            total_persons: self.metadata.persons.len(),
            total_images: persons.clone().map(|p| p.image_count as u64).sum(),
            total_encodings: persons.map(|p| p.encoding_count as u64).sum(),
            dataset_path: self.dir.clone(),
            has_embeddings: self.dir.join(EMBEDDINGS_FILE).exists(),
        }
    }

    /// Write the person index plus statistics as JSON. Defaults to
    /// `dataset/dataset_export.json`.
    pub fn export_metadata(&self, path: Option<&Path>) -> Result<PathBuf, DatasetError> {
        let out = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.dir.join(METADATA_EXPORT_FILE));
        let export = MetadataExport {
            dataset_path: &self.dir,
            exported_at: Local::now().naive_local(),
            statistics: self.statistics(),
            persons: &self.metadata.persons,
        };
        std::fs::write(&out, serde_json::to_string_pretty(&export)?)?;
        Ok(out)
    }

    fn save_metadata(&mut self) -> Result<(), DatasetError> {
        self.metadata.updated_at = Some(Local::now().naive_local());
        std::fs::write(
            self.dir.join(METADATA_FILE),
            serde_json::to_string_pretty(&self.metadata)?,
        )?;
        Ok(())
    }
}

fn load_metadata(path: &Path) -> DatasetMetadata {
    if !path.exists() {
        return DatasetMetadata::default();
    }
    let parsed = std::fs::read_to_string(path)
        .map_err(DatasetError::from)
        .and_then(|s| serde_json::from_str(&s).map_err(DatasetError::from));
    match parsed {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not load dataset metadata");
            DatasetMetadata::default()
        }
    }
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    let mut images: Vec<PathBuf> = std::fs::read_dir(dir)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
        })
        .collect();
    images.sort();
    Ok(images)
}

/// `NNN` from `<person_id>_<NNN>.<ext>`.
fn capture_index(person_id: &str, path: &Path) -> Option<u32> {
    let stem = path.file_stem()?.to_str()?;
    stem.strip_prefix(person_id)?.strip_prefix('_')?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::EncoderError;
    use tempfile::TempDir;

    /// Encodes a crop as its mean colour; fails on near-black crops.
    struct MeanColourEncoder;

    impl FaceEncoder for MeanColourEncoder {
        fn encode(&self, face: &RgbImage) -> Result<Prediction, EncoderError> {
            let n = (face.width() * face.height()) as f32;
            let mut acc = [0.0f32; 3];
            for p in face.pixels() {
                for c in 0..3 {
                    acc[c] += p[c] as f32;
                }
            }
            if acc.iter().all(|&v| v / n < 5.0) {
                return Err(EncoderError::InferenceFailed("black".into()));
            }
            Ok(Prediction::Embedding(Embedding {
                values: acc.iter().map(|v| v / n).collect(),
                model_version: None,
            }))
        }

        fn model_tag(&self) -> &str {
            "mean_colour"
        }
    }

    fn store() -> (TempDir, DatasetStore) {
        let tmp = TempDir::new().unwrap();
        let store = DatasetStore::open(tmp.path().join("dataset"), tmp.path().join("dataset_export")).unwrap();
        (tmp, store)
    }

    fn crop(v: u8) -> RgbImage {
        RgbImage::from_pixel(120, 120, image::Rgb([v, v / 2, 200]))
    }

    #[test]
    fn test_person_id_for() {
        assert_eq!(person_id_for("Alice"), "alice");
        assert_eq!(person_id_for(" Bob Smith "), "bob_smith");
    }

    #[test]
    fn test_add_person_creates_folder_and_index() {
        let (_tmp, mut store) = store();
        let id = store
            .add_person("Alice", PersonInfo { employee_id: Some("E1".into()), ..Default::default() })
            .unwrap();
        assert_eq!(id, "alice");
        assert!(store.person_dir("alice").is_dir());
        let record = store.person("alice").unwrap();
        assert_eq!(record.name, "Alice");
        assert_eq!(record.employee_id.as_deref(), Some("E1"));

        let reopened = DatasetStore::open(store.dir().to_path_buf(), store.export_dir().to_path_buf()).unwrap();
        assert_eq!(reopened.list_persons().len(), 1);
    }

    #[test]
    fn test_add_person_rejects_bad_names() {
        let (_tmp, mut store) = store();
        assert!(matches!(store.add_person("  ", PersonInfo::default()), Err(DatasetError::InvalidName(_))));
        assert!(matches!(store.add_person("../x", PersonInfo::default()), Err(DatasetError::InvalidName(_))));
    }

    #[test]
    fn test_save_capture_numbering_and_counts() {
        let (_tmp, mut store) = store();
        let id = store.add_person("Alice", PersonInfo::default()).unwrap();
        let first = store.save_capture(&id, &crop(10)).unwrap();
        let second = store.save_capture(&id, &crop(20)).unwrap();
        assert!(first.ends_with("alice/alice_001.jpg"));
        assert!(second.ends_with("alice/alice_002.jpg"));
        assert_eq!(store.person(&id).unwrap().image_count, 2);
        assert_eq!(store.get_person_images(&id).unwrap().len(), 2);
    }

    #[test]
    fn test_save_capture_continues_after_gap() {
        let (_tmp, mut store) = store();
        let id = store.add_person("Alice", PersonInfo::default()).unwrap();
        store.save_capture(&id, &crop(10)).unwrap();
        let second = store.save_capture(&id, &crop(10)).unwrap();
        std::fs::remove_file(store.person_dir(&id).join("alice_001.jpg")).unwrap();
        let third = store.save_capture(&id, &crop(10)).unwrap();
        assert!(second.ends_with("alice_002.jpg"));
        assert!(third.ends_with("alice_003.jpg"));
    }

    #[test]
    fn test_save_capture_unknown_person() {
        let (_tmp, mut store) = store();
        assert!(matches!(
            store.save_capture("ghost", &crop(10)),
            Err(DatasetError::UnknownPerson(_))
        ));
    }

    #[test]
    fn test_export_training_data_mirrors_images() {
        let (_tmp, mut store) = store();
        let id = store.add_person("Alice", PersonInfo::default()).unwrap();
        for _ in 0..3 {
            store.save_capture(&id, &crop(50)).unwrap();
        }
        let out = store.export_training_data(&id).unwrap();
        assert!(out.ends_with("dataset_export/alice"));
        assert!(out.join("alice_001.jpg").is_file());
        assert!(out.join("alice_003.jpg").is_file());
    }

    #[test]
    fn test_clear_person_images() {
        let (_tmp, mut store) = store();
        let id = store.add_person("Alice", PersonInfo::default()).unwrap();
        store.save_capture(&id, &crop(50)).unwrap();
        store.export_training_data(&id).unwrap();
        assert_eq!(store.clear_person_images(&id).unwrap(), 1);
        assert!(store.get_person_images(&id).unwrap().is_empty());
        assert!(!store.export_dir().join(&id).exists());
        assert_eq!(store.person(&id).unwrap().image_count, 0);
        // Numbering restarts once the folder is empty.
        assert!(store.save_capture(&id, &crop(50)).unwrap().ends_with("alice_001.jpg"));
    }

    #[test]
    fn test_generate_then_load_embeddings() {
        let (_tmp, mut store) = store();
        let alice = store.add_person("Alice", PersonInfo::default()).unwrap();
        let bob = store.add_person("Bob", PersonInfo { department: Some("Ops".into()), ..Default::default() }).unwrap();
        for v in [40, 80] {
            store.save_capture(&alice, &crop(v)).unwrap();
        }
        store.save_capture(&bob, &crop(120)).unwrap();
        // An image the encoder rejects is skipped, not fatal.
        RgbImage::new(120, 120).save(store.person_dir(&bob).join("bob_002.jpg")).unwrap();

        let written = store.generate_embeddings(&MeanColourEncoder).unwrap();
        assert_eq!(written, 3);

        let set = store.load_embeddings().unwrap();
        assert_eq!(set.model, "mean_colour");
        assert_eq!(set.names, vec!["Alice", "Alice", "Bob"]);
        assert_eq!(set.metadata[2].department.as_deref(), Some("Ops"));
        assert_eq!(set.metadata[0].image_file, "alice_001.jpg");
        assert_eq!(set.vectors.len(), 3);
        assert_eq!(store.person(&alice).unwrap().encoding_count, 2);
        assert_eq!(store.person(&bob).unwrap().encoding_count, 1);

        let gallery = set.known_faces();
        assert_eq!(gallery.len(), 3);
        assert_eq!(gallery[2].name, "Bob");
        assert_eq!(gallery[2].embedding.values, set.vectors[2]);
    }

    #[test]
    fn test_load_embeddings_absent_is_empty() {
        let (_tmp, store) = store();
        assert!(store.load_embeddings().unwrap().is_empty());
    }

    #[test]
    fn test_statistics_and_export_metadata() {
        let (_tmp, mut store) = store();
        let id = store.add_person("Alice", PersonInfo::default()).unwrap();
        store.save_capture(&id, &crop(90)).unwrap();
        let stats = store.statistics();
        assert_eq!(stats.total_persons, 1);
        assert_eq!(stats.total_images, 1);
        assert!(!stats.has_embeddings);

        let out = store.export_metadata(None).unwrap();
        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(out).unwrap()).unwrap();
        assert_eq!(json["statistics"]["total_persons"], 1);
        assert_eq!(json["persons"]["alice"]["name"], "Alice");
    }

    #[test]
    fn test_capture_index() {
        assert_eq!(capture_index("alice", Path::new("alice_007.jpg")), Some(7));
        assert_eq!(capture_index("alice", Path::new("bob_007.jpg")), None);
        assert_eq!(capture_index("alice", Path::new("alice_x.jpg")), None);
    }
}
