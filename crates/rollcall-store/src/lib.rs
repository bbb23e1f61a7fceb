//! rollcall-store: Everything rollcall keeps on disk.
//!
//! Configuration, the classifier model registry, the enrollment dataset and
//! the attendance log. Each store exclusively owns its directory tree.

pub mod attendance;
pub mod config;
pub mod dataset;
pub mod paths;
pub mod registry;

pub use attendance::{
    AttendanceEngine, AttendanceError, AttendanceRecord, CheckInOutcome, CheckOutOutcome, Clock,
    EventKind, SystemClock,
};
pub use config::{AppConfig, ConfigError};
pub use dataset::{DatasetError, DatasetStore, EmbeddingSet, PersonInfo};
pub use paths::DataPaths;
pub use registry::{ModelBundle, ModelRegistry, RegistryError};
