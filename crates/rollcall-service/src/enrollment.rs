//! Enrollment: duplicate-name policy, quality-checked capture of face crops
//! into the dataset, and the training-data export handed to the operator.

use rollcall_core::{FaceLocator, QualityRejection, QualityThresholds};
use rollcall_hw::{CameraError, FrameSource};
use rollcall_store::{AppConfig, DatasetError, DatasetStore, ModelRegistry, PersonInfo};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("{name:?} is already a class in model {model_id}; re-train to replace it or choose another name")]
    DuplicateName { name: String, model_id: String },
    #[error("dataset error: {0}")]
    Dataset(#[from] DatasetError),
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("failed to spawn capture thread: {0}")]
    Spawn(std::io::Error),
    #[error("dataset lock poisoned")]
    LockPoisoned,
    #[error("capture thread panicked")]
    Panicked,
}

/// Whether a proposed name collides with a class of the active model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplicateCheck {
    New,
    ExistingClass { class: String, model_id: String },
}

pub fn check_duplicate(registry: &mut ModelRegistry, name: &str) -> DuplicateCheck {
    let Some(class) = registry.find_class(name) else {
        return DuplicateCheck::New;
    };
    let model_id = registry.active_id().unwrap_or_default().to_string();
    DuplicateCheck::ExistingClass { class, model_id }
}

#[derive(Debug, Clone)]
pub struct EnrollmentRequest {
    pub name: String,
    pub info: PersonInfo,
    /// Replace an existing class's photos instead of refusing the name.
    pub retrain: bool,
}

/// Apply the duplicate-name policy and register the person.
///
/// Returns the person id. Existing captures are left alone; with `retrain`
/// they are replaced once capture accepts its first new photo (see
/// [`CaptureSettings::replace_existing`]).
pub fn prepare_enrollment(
    store: &mut DatasetStore,
    registry: &mut ModelRegistry,
    request: &EnrollmentRequest,
) -> Result<String, EnrollError> {
    if let DuplicateCheck::ExistingClass { class, model_id } = check_duplicate(registry, &request.name) {
        if !request.retrain {
            return Err(EnrollError::DuplicateName { name: class, model_id });
        }
        tracing::info!(name = %class, model_id = %model_id, "re-training existing class");
    }

    Ok(store.add_person(&request.name, request.info.clone())?)
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSettings {
    pub target_count: u32,
    /// Minimum time between accepted captures.
    pub interval: Duration,
    pub thresholds: QualityThresholds,
    /// Drop the person's earlier captures when the first new one is accepted.
    pub replace_existing: bool,
}

impl CaptureSettings {
    /// `requested` defaults to the configured minimum and is capped at the
    /// configured maximum.
    pub fn from_config(config: &AppConfig, requested: Option<u32>) -> Self {
        let dataset = &config.dataset;
        let target_count = requested
            .unwrap_or(dataset.min_photos_per_person)
            .min(dataset.max_photos_per_person)
            .max(1);
        Self {
            target_count,
            interval: Duration::from_secs_f32(dataset.photo_capture_interval.max(0.0)),
            thresholds: QualityThresholds {
                min_face_size: dataset.min_face_size,
                ..QualityThresholds::default()
            },
            replace_existing: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureProgress {
    pub accepted: u32,
    pub target: u32,
    /// Why the latest frame was rejected, if it was.
    pub rejection: Option<QualityRejection>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureReport {
    pub person_id: String,
    pub saved: Vec<PathBuf>,
    pub rejected: u64,
    pub cancelled: bool,
    /// Training-ready mirror, when anything was saved.
    pub export_dir: Option<PathBuf>,
}

/// Read frames until `settings.target_count` crops are accepted or `stop` is
/// set. Each accepted crop is saved as the person's next capture.
pub fn capture_faces(
    source: &mut dyn FrameSource,
    locator: &dyn FaceLocator,
    store: &mut DatasetStore,
    person_id: &str,
    settings: &CaptureSettings,
    stop: &AtomicBool,
    mut on_progress: impl FnMut(&CaptureProgress),
) -> Result<CaptureReport, EnrollError> {
    if store.person(person_id).is_none() {
        return Err(DatasetError::UnknownPerson(person_id.to_string()).into());
    }
    tracing::info!(person_id, target = settings.target_count, "capture started");

    let mut saved = Vec::new();
    let mut rejected = 0u64;
    let mut last_accept: Option<Instant> = None;
    let mut cancelled = false;

    while (saved.len() as u32) < settings.target_count {
        if stop.load(Ordering::SeqCst) {
            cancelled = true;
            break;
        }
        let frame = source.next_frame()?;
        if last_accept.is_some_and(|t| t.elapsed() < settings.interval) {
            continue;
        }

        let faces = match locator.locate(&frame.image) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "face location failed, skipping frame");
                continue;
            }
        };

        let rejection = match settings.thresholds.assess(&frame.image, &faces) {
            Ok((crop, report)) => {
                if saved.is_empty() && settings.replace_existing {
                    store.clear_person_images(person_id)?;
                }
                let path = store.save_capture(person_id, &crop)?;
                tracing::info!(
                    person_id,
                    n = saved.len() + 1,
                    brightness = report.brightness,
                    sharpness = report.sharpness,
                    path = %path.display(),
                    "capture accepted"
                );
                saved.push(path);
                last_accept = Some(Instant::now());
                None
            }
            Err(reason) => {
                rejected += 1;
                tracing::debug!(person_id, %reason, "capture rejected");
                Some(reason)
            }
        };
        on_progress(&CaptureProgress {
            accepted: saved.len() as u32,
            target: settings.target_count,
            rejection,
        });
    }

    let export_dir = if saved.is_empty() {
        None
    } else {
        Some(store.export_training_data(person_id)?)
    };
    tracing::info!(person_id, accepted = saved.len(), rejected, cancelled, "capture finished");

    Ok(CaptureReport {
        person_id: person_id.to_string(),
        saved,
        rejected,
        cancelled,
        export_dir,
    })
}

/// Capture running on its own thread, reporting progress over a channel.
pub struct CaptureSession {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<CaptureReport, EnrollError>>>,
    progress: mpsc::Receiver<CaptureProgress>,
}

impl CaptureSession {
    /// The session owns `source` and releases it when capture ends.
    pub fn spawn<S: FrameSource + 'static>(
        mut source: S,
        locator: Arc<dyn FaceLocator>,
        store: Arc<Mutex<DatasetStore>>,
        person_id: String,
        settings: CaptureSettings,
    ) -> Result<Self, EnrollError> {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, progress) = mpsc::channel(64);
        let flag = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("rollcall-enroll".into())
            .spawn(move || {
                let mut store = store.lock().map_err(|_| EnrollError::LockPoisoned)?;
                capture_faces(
                    &mut source,
                    locator.as_ref(),
                    &mut store,
                    &person_id,
                    &settings,
                    &flag,
                    |p| {
                        let _ = tx.try_send(p.clone());
                    },
                )
            })
            .map_err(EnrollError::Spawn)?;

        Ok(Self {
            stop,
            thread: Some(thread),
            progress,
        })
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Next progress update; `None` once capture has ended.
    pub async fn next_progress(&mut self) -> Option<CaptureProgress> {
        self.progress.recv().await
    }

    /// Ask the thread to stop after the current frame.
    pub fn cancel(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn wait(mut self) -> Result<CaptureReport, EnrollError> {
        let thread = self.thread.take().ok_or(EnrollError::Panicked)?;
        thread.join().map_err(|_| EnrollError::Panicked)?
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.stop.store(true, Ordering::SeqCst);
            let _ = thread.join();
        }
    }
}
