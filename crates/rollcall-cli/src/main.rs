use anyhow::{bail, Context, Result};
use chrono::{Duration as ChronoDuration, Local, NaiveDate};
use clap::{Parser, Subcommand, ValueEnum};
use rollcall_core::LandmarkEncoder;
use rollcall_hw::Camera;
use rollcall_service::bootstrap;
use rollcall_service::enrollment::{self, CaptureSession, CaptureSettings, EnrollmentRequest};
use rollcall_service::{AttendanceGate, AttendanceMode, CameraLoop, LoopEvent, LoopSettings, ToastLevel};
use rollcall_store::{
    AppConfig, AttendanceEngine, AttendanceRecord, DataPaths, DatasetStore, EventKind, ModelRegistry, PersonInfo,
};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance")]
struct Cli {
    /// Data root (overrides ROLLCALL_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognize faces from the camera and record attendance
    Run {
        #[arg(long, value_enum, default_value_t = Mode::In)]
        mode: Mode,
        /// Camera index (/dev/video<N>)
        #[arg(long, default_value_t = 0)]
        camera: u32,
        /// Do not store photo evidence
        #[arg(long)]
        no_photo: bool,
    },
    /// Capture face photos for a person
    Enroll {
        name: String,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        department: Option<String>,
        #[arg(long)]
        contact: Option<String>,
        /// Photos to capture (default: dataset.min_photos_per_person)
        #[arg(long)]
        count: Option<u32>,
        #[arg(long, default_value_t = 0)]
        camera: u32,
        /// Replace the photos of a class the active model already knows
        #[arg(long)]
        retrain: bool,
    },
    /// Fallback-mode embedding database
    Embeddings {
        #[command(subcommand)]
        command: EmbeddingsCommand,
    },
    /// Enrolled persons
    Persons {
        #[command(subcommand)]
        command: PersonsCommand,
    },
    /// Trained classifier bundles
    Models {
        #[command(subcommand)]
        command: ModelsCommand,
    },
    /// Attendance records
    Records {
        #[command(subcommand)]
        command: RecordsCommand,
    },
    /// Export attendance reports
    Report {
        #[command(subcommand)]
        command: ReportCommand,
    },
    /// Show or change configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Show pipeline readiness and today's numbers
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    In,
    Out,
}

#[derive(Subcommand)]
enum EmbeddingsCommand {
    /// Re-encode every enrolled image
    Rebuild,
}

#[derive(Subcommand)]
enum PersonsCommand {
    List,
    /// Write the person index and statistics as JSON
    Export {
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ModelsCommand {
    List,
    /// Copy a model and its labels into the registry
    Import {
        model: PathBuf,
        labels: PathBuf,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        activate: bool,
    },
    Activate { id: String },
    Delete { id: String },
    Rename { id: String, name: String },
}

#[derive(Subcommand)]
enum RecordsCommand {
    Today,
    List {
        #[arg(long, value_parser = parse_date)]
        date: Option<NaiveDate>,
        #[arg(long, value_parser = parse_date, requires = "to")]
        from: Option<NaiveDate>,
        #[arg(long, value_parser = parse_date, requires = "from")]
        to: Option<NaiveDate>,
    },
    /// Manual entry; bypasses the once-per-day rule
    Add {
        name: String,
        #[arg(long, value_enum, default_value_t = Mode::In)]
        kind: Mode,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Remove the row with this exact timestamp and name
    Delete { timestamp: String, name: String },
    /// Per-person counts (default: last 30 days)
    Summary {
        name: String,
        #[arg(long, value_parser = parse_date)]
        from: Option<NaiveDate>,
        #[arg(long, value_parser = parse_date)]
        to: Option<NaiveDate>,
    },
}

#[derive(Subcommand)]
enum ReportCommand {
    Json {
        #[arg(long, value_parser = parse_date)]
        from: Option<NaiveDate>,
        #[arg(long, value_parser = parse_date)]
        to: Option<NaiveDate>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    Csv {
        #[arg(long, value_parser = parse_date)]
        from: Option<NaiveDate>,
        #[arg(long, value_parser = parse_date)]
        to: Option<NaiveDate>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    Show,
    /// Set <category>.<key>; the value is parsed as JSON, else taken as a string
    Set { category: String, key: String, value: String },
    Reset,
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {e}"))
}

impl Mode {
    fn event_kind(self) -> EventKind {
        match self {
            Self::In => EventKind::CheckIn,
            Self::Out => EventKind::CheckOut,
        }
    }

    fn attendance_mode(self) -> AttendanceMode {
        match self {
            Self::In => AttendanceMode::CheckIn,
            Self::Out => AttendanceMode::CheckOut,
        }
    }
}

struct App {
    paths: DataPaths,
    config: AppConfig,
}

impl App {
    fn load(data_dir: Option<PathBuf>) -> Result<Self> {
        let paths = match data_dir {
            Some(root) => DataPaths::new(root),
            None => DataPaths::from_env(),
        };
        paths.ensure_dirs().context("creating data directories")?;
        let config = AppConfig::load(&paths.config);
        Ok(Self { paths, config })
    }

    fn save_config(&self) -> Result<()> {
        self.config.save(&self.paths.config).context("saving config")
    }

    fn dataset(&self) -> Result<DatasetStore> {
        Ok(DatasetStore::open(&self.paths.dataset, &self.paths.dataset_export)?)
    }

    fn registry(&self) -> ModelRegistry {
        ModelRegistry::open(&self.paths.models)
    }

    fn attendance(&self) -> Result<AttendanceEngine> {
        Ok(AttendanceEngine::open(&self.paths.logs)?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut ctx = App::load(cli.data_dir)?;
    tracing::debug!(root = %ctx.paths.root.display(), "data root");

    match cli.command {
        Commands::Run { mode, camera, no_photo } => run(&ctx, mode, camera, !no_photo).await?,
        Commands::Enroll { name, id, department, contact, count, camera, retrain } => {
            let request = EnrollmentRequest {
                name,
                info: PersonInfo { employee_id: id, department, contact },
                retrain,
            };
            enroll(&ctx, request, count, camera).await?;
        }
        Commands::Embeddings { command: EmbeddingsCommand::Rebuild } => {
            let model = ctx.paths.resolve(&ctx.config.recognition.landmark_model);
            let encoder = LandmarkEncoder::load(&model)?;
            let mut dataset = ctx.dataset()?;
            let count = dataset.generate_embeddings(&encoder)?;
            println!("Generated {count} embeddings");
        }
        Commands::Persons { command } => persons(&ctx, command)?,
        Commands::Models { command } => models(&mut ctx, command)?,
        Commands::Records { command } => records(&ctx, command)?,
        Commands::Report { command } => report(&ctx, command)?,
        Commands::Config { command } => config(&mut ctx, command)?,
        Commands::Status => status(&ctx)?,
    }

    Ok(())
}

async fn run(ctx: &App, mode: Mode, camera: u32, save_photos: bool) -> Result<()> {
    let mut registry = ctx.registry();
    let dataset = ctx.dataset()?;
    let startup = bootstrap::start(&ctx.paths, &ctx.config, &mut registry, &dataset);
    for notice in &startup.notices {
        println!("! {notice}");
    }
    if let Some(bundle) = &startup.active_model {
        println!("Model: {} ({} classes)", bundle.name, bundle.num_classes());
    }
    let service = startup.into_service()?;

    let gate = AttendanceGate::from_config(&ctx.config, service.is_classifier_mode());
    let attendance = Arc::new(Mutex::new(ctx.attendance()?));
    let gui = &ctx.config.gui;
    let source = Camera::open_index(camera, gui.webcam_width, gui.webcam_height)?;

    let settings = LoopSettings {
        mode: mode.attendance_mode(),
        target_fps: ctx.config.performance.target_fps,
        save_photos,
    };
    let mut cam = CameraLoop::spawn(source, service, gate, attendance, settings)?;
    println!("Recording {} events; Ctrl-C to stop", mode.event_kind());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            event = cam.next_event() => match event {
                Some(LoopEvent::Toast(toast)) => {
                    let mark = match toast.level {
                        ToastLevel::Success => "+",
                        ToastLevel::Warning => "!",
                        ToastLevel::Error => "x",
                    };
                    println!("{mark} {}", toast.message);
                }
                Some(LoopEvent::Frame { sequence, results }) => {
                    for r in &results {
                        tracing::debug!(sequence, name = %r.name, confidence = r.confidence, "face");
                    }
                }
                Some(LoopEvent::Stopped(reason)) => {
                    tracing::info!(?reason, "camera loop stopped");
                    break;
                }
                None => break,
            },
        }
    }

    let summary = tokio::task::spawn_blocking(move || cam.stop()).await??;
    println!("{} frames, {} events recorded", summary.frames, summary.events_recorded);
    Ok(())
}

async fn enroll(ctx: &App, request: EnrollmentRequest, count: Option<u32>, camera: u32) -> Result<()> {
    let mut dataset = ctx.dataset()?;
    let mut registry = ctx.registry();
    let person_id = enrollment::prepare_enrollment(&mut dataset, &mut registry, &request)?;

    let detector = bootstrap::load_detector(&ctx.paths, &ctx.config)?;
    let settings = CaptureSettings {
        replace_existing: request.retrain,
        ..CaptureSettings::from_config(&ctx.config, count)
    };
    let target = settings.target_count;
    let gui = &ctx.config.gui;
    let source = Camera::open_index(camera, gui.webcam_width, gui.webcam_height)?;

    let dataset = Arc::new(Mutex::new(dataset));
    let mut session = CaptureSession::spawn(source, Arc::new(detector), dataset, person_id.clone(), settings)?;
    let stop = session.stop_flag();
    println!("Capturing {target} photos of {}; Ctrl-C to stop", request.name);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancelled = false;
    loop {
        tokio::select! {
            _ = &mut ctrl_c, if !cancelled => {
                cancelled = true;
                stop.store(true, Ordering::SeqCst);
            }
            progress = session.next_progress() => match progress {
                Some(p) => match p.rejection {
                    Some(reason) => println!("  rejected: {reason}"),
                    None => println!("  [{}/{}] captured", p.accepted, p.target),
                },
                None => break,
            },
        }
    }

    let report = tokio::task::spawn_blocking(move || session.wait()).await??;
    println!(
        "{}: {} photos saved, {} frames rejected{}",
        person_id,
        report.saved.len(),
        report.rejected,
        if report.cancelled { " (stopped)" } else { "" }
    );
    if let Some(dir) = &report.export_dir {
        println!("Training data: {}", dir.display());
    }
    let min = ctx.config.dataset.min_photos_per_person as usize;
    if report.saved.len() < min {
        println!("! fewer than {min} photos; consider capturing more");
    }
    Ok(())
}

fn persons(ctx: &App, command: PersonsCommand) -> Result<()> {
    let dataset = ctx.dataset()?;
    match command {
        PersonsCommand::List => {
            for (id, p) in dataset.list_persons() {
                println!(
                    "{id:<20} {:<24} {:>4} images  {}",
                    p.name,
                    p.image_count,
                    p.department.as_deref().unwrap_or("-")
                );
            }
            let stats = dataset.statistics();
            println!(
                "{} persons, {} images, {} embeddings",
                stats.total_persons, stats.total_images, stats.total_encodings
            );
        }
        PersonsCommand::Export { out } => {
            let path = dataset.export_metadata(out.as_deref())?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}

fn models(ctx: &mut App, command: ModelsCommand) -> Result<()> {
    let mut registry = ctx.registry();
    match command {
        ModelsCommand::List => {
            let active = registry.active_id().map(str::to_string);
            let bundles = registry.list();
            if bundles.is_empty() {
                println!("No models imported");
            }
            for b in bundles {
                let mark = if active.as_deref() == Some(b.id.as_str()) { "*" } else { " " };
                println!(
                    "{mark} {:<32} {:<20} {}  {} classes: {}",
                    b.id,
                    b.name,
                    b.created_at.format("%Y-%m-%d %H:%M"),
                    b.num_classes(),
                    b.classes.join(", ")
                );
            }
        }
        ModelsCommand::Import { model, labels, name, activate } => {
            let id = registry.import(&model, &labels, name.as_deref())?;
            println!("Imported {id}");
            if activate {
                activate_model(ctx, &mut registry, &id)?;
            }
        }
        ModelsCommand::Activate { id } => activate_model(ctx, &mut registry, &id)?,
        ModelsCommand::Delete { id } => {
            if !registry.delete(&id) {
                bail!("no model {id}");
            }
            if ctx.config.recognition.active_model_id.as_deref() == Some(id.as_str()) {
                ctx.config.recognition.active_model_id = None;
                ctx.save_config()?;
            }
            println!("Deleted {id}");
        }
        ModelsCommand::Rename { id, name } => {
            if !registry.rename(&id, &name) {
                bail!("no model {id}");
            }
            println!("Renamed {id} to {name}");
        }
    }
    Ok(())
}

/// The registry pointer and the config id move together; takes effect on the
/// next `run`.
fn activate_model(ctx: &mut App, registry: &mut ModelRegistry, id: &str) -> Result<()> {
    if !registry.set_active(id) {
        bail!("no model {id}");
    }
    ctx.config.recognition.active_model_id = Some(id.to_string());
    ctx.save_config()?;
    println!("Active model: {id}");
    Ok(())
}

fn print_records(records: &[AttendanceRecord]) {
    if records.is_empty() {
        println!("No records");
    }
    for r in records {
        println!(
            "{} {} {:<20} {:<9} {:.4}  {}  [{}]",
            r.date,
            r.time,
            r.person_name,
            r.kind,
            r.confidence,
            r.notes.as_deref().unwrap_or(""),
            r.timestamp
        );
    }
}

fn records(ctx: &App, command: RecordsCommand) -> Result<()> {
    let mut engine = ctx.attendance()?;
    match command {
        RecordsCommand::Today => print_records(&engine.get_today_attendance()?),
        RecordsCommand::List { date, from, to } => {
            let rows = match (from, to) {
                (Some(from), Some(to)) => engine.get_records_between(from, to)?,
                _ => engine.get_records(date)?,
            };
            print_records(&rows);
        }
        RecordsCommand::Add { name, kind, location, notes } => {
            let notes = notes.unwrap_or_else(|| "Manual entry".to_string());
            let record = engine.record_attendance(
                &name,
                kind.event_kind(),
                1.0,
                None,
                location.as_deref(),
                Some(&notes),
            )?;
            println!("Recorded {} for {} at {}", record.kind, record.person_name, record.time);
        }
        RecordsCommand::Delete { timestamp, name } => {
            if !engine.delete_record(&timestamp, &name)? {
                bail!("no record for {name} at {timestamp}");
            }
            println!("Deleted");
        }
        RecordsCommand::Summary { name, from, to } => {
            let s = engine.person_summary(&name, from, to)?;
            println!(
                "{} {}..{}: {} check-ins, {} check-outs",
                s.person_name, s.start, s.end, s.total_check_ins, s.total_check_outs
            );
            print_records(&s.records);
        }
    }
    Ok(())
}

fn report(ctx: &App, command: ReportCommand) -> Result<()> {
    let engine = ctx.attendance()?;
    let today = Local::now().date_naive();
    match command {
        ReportCommand::Json { from, to, out } => {
            let path = engine.export_report(from.unwrap_or(today), to.unwrap_or(today), out.as_deref())?;
            println!("Wrote {}", path.display());
        }
        ReportCommand::Csv { from, to, out } => {
            let (from, to) = (from.unwrap_or(today), to.unwrap_or(today));
            let out = out.unwrap_or_else(|| ctx.paths.logs.join(format!("attendance_{from}_{to}.csv")));
            let path = engine.export_csv(from, to, &out)?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}

fn config(ctx: &mut App, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => println!("{}", serde_json::to_string_pretty(&ctx.config)?),
        ConfigCommand::Set { category, key, value } => {
            let value = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
            if !ctx.config.update_setting(&category, &key, value) {
                bail!("cannot set {category}.{key}");
            }
            ctx.save_config()?;
            println!("Set {category}.{key}");
        }
        ConfigCommand::Reset => {
            ctx.config.reset_to_defaults();
            ctx.save_config()?;
            println!("Configuration reset to defaults");
        }
    }
    Ok(())
}

fn status(ctx: &App) -> Result<()> {
    println!("Data root: {}", ctx.paths.root.display());

    let mut registry = ctx.registry();
    let dataset = ctx.dataset()?;
    let startup = bootstrap::check_readiness(&ctx.paths, &ctx.config, &mut registry, &dataset);
    for notice in &startup.notices {
        println!("! {notice}");
    }
    match &startup.service {
        Some(service) => {
            let report = service.validate();
            println!(
                "Recognition: {} mode, model {} ({})",
                report.mode,
                report.model,
                if report.ready { "ready" } else { "not ready" }
            );
            for issue in &report.issues {
                println!("  - {issue}");
            }
        }
        None => println!("Recognition: unavailable"),
    }

    let stats = dataset.statistics();
    println!(
        "Dataset: {} persons, {} images, embeddings {}",
        stats.total_persons,
        stats.total_images,
        if stats.has_embeddings { "present" } else { "missing" }
    );

    let mut engine = ctx.attendance()?;
    let today = engine.today_stats(stats.total_persons)?;
    println!(
        "Today {}: {} check-ins, {} check-outs, {}/{} present ({:.0}%)",
        today.date,
        today.check_ins,
        today.check_outs,
        today.present,
        today.total_persons,
        today.attendance_rate * 100.0
    );
    let week_ago = today.date - ChronoDuration::days(7);
    let recent = engine.get_records_between(week_ago, today.date)?;
    println!("Last 7 days: {} records", recent.len());
    Ok(())
}
