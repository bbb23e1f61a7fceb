use std::path::{Path, PathBuf};

/// On-disk layout rooted at one data directory.
///
/// ```text
/// <root>/dataset/            captured crops, metadata.json, encodings.msgpack
/// <root>/dataset_export/     training-ready mirror
/// <root>/models/             classifier bundles, models_metadata.json
/// <root>/logs/               attendance.csv, photos/
/// <root>/config.json
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    pub root: PathBuf,
    pub dataset: PathBuf,
    pub dataset_export: PathBuf,
    pub models: PathBuf,
    pub logs: PathBuf,
    pub config: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            dataset: root.join("dataset"),
            dataset_export: root.join("dataset_export"),
            models: root.join("models"),
            logs: root.join("logs"),
            config: root.join("config.json"),
            root,
        }
    }

    /// Resolve from `ROLLCALL_DATA_DIR` (default: current directory) and
    /// `ROLLCALL_CONFIG` (default: `<root>/config.json`).
    pub fn from_env() -> Self {
        let root = std::env::var("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let mut paths = Self::new(root);
        if let Ok(config) = std::env::var("ROLLCALL_CONFIG") {
            paths.config = PathBuf::from(config);
        }
        paths
    }

    /// Resolve a path from the config relative to the data root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [&self.dataset, &self.dataset_export, &self.models, &self.logs] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let p = DataPaths::new("/data");
        assert_eq!(p.dataset, PathBuf::from("/data/dataset"));
        assert_eq!(p.dataset_export, PathBuf::from("/data/dataset_export"));
        assert_eq!(p.models, PathBuf::from("/data/models"));
        assert_eq!(p.logs, PathBuf::from("/data/logs"));
        assert_eq!(p.config, PathBuf::from("/data/config.json"));
    }

    #[test]
    fn test_resolve() {
        let p = DataPaths::new("/data");
        assert_eq!(p.resolve(Path::new("assets/det.onnx")), PathBuf::from("/data/assets/det.onnx"));
        assert_eq!(p.resolve(Path::new("/opt/det.onnx")), PathBuf::from("/opt/det.onnx"));
    }

    #[test]
    fn test_ensure_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let p = DataPaths::new(dir.path());
        p.ensure_dirs().unwrap();
        assert!(p.models.is_dir());
        assert!(p.logs.is_dir());
    }
}
