//! Attendance log: `logs/attendance.csv` plus photo evidence in `logs/photos/`.
//!
//! Rows are appended and flushed one event at a time. The only rewrite is an
//! explicit [`AttendanceEngine::delete_record`]. An in-memory index of today's
//! rows backs the once-per-day check-in/check-out rule and is rebuilt from
//! the file at startup, after a delete, and when the local date changes.

use chrono::{Duration, Local, NaiveDate, NaiveDateTime};
use image::RgbImage;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ATTENDANCE_FILE: &str = "attendance.csv";
pub const PHOTO_DIR: &str = "photos";
pub const CSV_HEADER: [&str; 9] = [
    "timestamp",
    "date",
    "time",
    "person_name",
    "type",
    "confidence",
    "photo_path",
    "location",
    "notes",
];
const SUMMARY_DEFAULT_DAYS: i64 = 30;

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("photo: {0}")]
    Photo(#[from] image::ImageError),
    #[error("attendance file has no {0} column")]
    MissingColumn(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CheckIn,
    CheckOut,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CheckIn => "check_in",
            Self::CheckOut => "check_out",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "check_in" | "in" => Ok(Self::CheckIn),
            "check_out" | "out" => Ok(Self::CheckOut),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

/// One CSV row. Field order is the column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    /// ISO-8601 local timestamp with microseconds.
    pub timestamp: String,
    pub date: NaiveDate,
    /// `HH:MM:SS`.
    pub time: String,
    pub person_name: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(serialize_with = "four_places")]
    pub confidence: f32,
    /// Relative to the logs directory, e.g. `photos/Alice_20250101_090000.jpg`.
    pub photo_path: Option<String>,
    pub location: Option<String>,
    pub notes: Option<String>,
}

fn four_places<S: Serializer>(value: &f32, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{value:.4}"))
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckInOutcome {
    Recorded(AttendanceRecord),
    /// Already checked in today; carries the earlier row's time.
    AlreadyCheckedIn { name: String, time: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutOutcome {
    Recorded(AttendanceRecord),
    NotCheckedIn,
    AlreadyCheckedOut { time: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersonSummary {
    pub person_name: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub total_check_ins: usize,
    pub total_check_outs: usize,
    pub total_records: usize,
    pub records: Vec<AttendanceRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TodayStats {
    pub date: NaiveDate,
    pub check_ins: usize,
    pub check_outs: usize,
    /// Distinct people with a check-in today.
    pub present: usize,
    pub total_persons: usize,
    /// `present / total_persons`, 0 when nobody is enrolled.
    pub attendance_rate: f32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReportPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total_persons: usize,
    pub total_records: usize,
    pub total_check_ins: usize,
    pub total_check_outs: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PersonReport {
    pub check_ins: usize,
    pub check_outs: usize,
    pub records: Vec<AttendanceRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AttendanceReport {
    pub generated_at: NaiveDateTime,
    pub period: ReportPeriod,
    pub summary: ReportSummary,
    pub persons: BTreeMap<String, PersonReport>,
}

/// Source of local wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

pub struct AttendanceEngine {
    log_dir: PathBuf,
    csv_path: PathBuf,
    photo_dir: PathBuf,
    clock: Box<dyn Clock>,
    cache_date: NaiveDate,
    today: HashMap<String, Vec<AttendanceRecord>>,
}

impl AttendanceEngine {
    /// Open the log in `log_dir`, creating the directory, the photo folder and
    /// the CSV (with header) as needed.
    pub fn open(log_dir: impl Into<PathBuf>) -> Result<Self, AttendanceError> {
        Self::with_clock(log_dir, Box::new(SystemClock))
    }

    pub fn with_clock(log_dir: impl Into<PathBuf>, clock: Box<dyn Clock>) -> Result<Self, AttendanceError> {
        let log_dir = log_dir.into();
        let photo_dir = log_dir.join(PHOTO_DIR);
        std::fs::create_dir_all(&photo_dir)?;
        let csv_path = log_dir.join(ATTENDANCE_FILE);

        let cache_date = clock.now().date();
        let mut engine = Self {
            log_dir,
            csv_path,
            photo_dir,
            clock,
            cache_date,
            today: HashMap::new(),
        };
        engine.ensure_file()?;
        engine.reload_today()?;
        Ok(engine)
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    fn ensure_file(&self) -> Result<(), AttendanceError> {
        let empty = std::fs::metadata(&self.csv_path).map(|m| m.len() == 0).unwrap_or(true);
        if empty {
            let mut writer = csv_writer(std::fs::File::create(&self.csv_path)?);
            writer.write_record(CSV_HEADER)?;
            writer.flush()?;
            tracing::info!(path = %self.csv_path.display(), "created attendance log");
        }
        Ok(())
    }

    /// Rebuild the today-cache from the file.
    fn reload_today(&mut self) -> Result<(), AttendanceError> {
        let today = self.clock.now().date();
        let mut cache: HashMap<String, Vec<AttendanceRecord>> = HashMap::new();
        for record in self.read_records()? {
            if record.date == today {
                cache.entry(person_key(&record.person_name)).or_default().push(record);
            }
        }
        tracing::debug!(date = %today, persons = cache.len(), "today cache loaded");
        self.cache_date = today;
        self.today = cache;
        Ok(())
    }

    fn roll_over_if_needed(&mut self) -> Result<(), AttendanceError> {
        if self.clock.now().date() != self.cache_date {
            tracing::info!(previous = %self.cache_date, "date changed, rebuilding today cache");
            self.reload_today()?;
        }
        Ok(())
    }

    /// Stream every parseable row. Malformed rows are logged and skipped.
    fn read_records(&self) -> Result<Vec<AttendanceRecord>, AttendanceError> {
        if !self.csv_path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&self.csv_path)?;
        let mut records = Vec::new();
        for (i, row) in reader.deserialize::<AttendanceRecord>().enumerate() {
            match row {
                Ok(r) => records.push(r),
                Err(e) => tracing::warn!(row = i + 1, error = %e, "skipping malformed attendance row"),
            }
        }
        Ok(records)
    }

    /// Unconditional append, used for manual entries and by the checked paths.
    pub fn record_attendance(
        &mut self,
        name: &str,
        kind: EventKind,
        confidence: f32,
        photo: Option<&RgbImage>,
        location: Option<&str>,
        notes: Option<&str>,
    ) -> Result<AttendanceRecord, AttendanceError> {
        self.roll_over_if_needed()?;
        let now = self.clock.now();

        let photo_path = match photo {
            Some(img) => {
                let file_name = format!("{}_{}.jpg", file_safe(name), now.format("%Y%m%d_%H%M%S"));
                img.save(self.photo_dir.join(&file_name))?;
                Some(format!("{PHOTO_DIR}/{file_name}"))
            }
            None => None,
        };

        let record = AttendanceRecord {
            timestamp: now.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            date: now.date(),
            time: now.format("%H:%M:%S").to_string(),
            person_name: name.to_string(),
            kind,
            confidence,
            photo_path,
            location: location.filter(|s| !s.is_empty()).map(str::to_string),
            notes: notes.filter(|s| !s.is_empty()).map(str::to_string),
        };

        self.ensure_file()?;
        let file = OpenOptions::new().append(true).open(&self.csv_path)?;
        let mut writer = csv_writer(file);
        writer.serialize(&record)?;
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| AttendanceError::Io(std::io::Error::other(e.to_string())))?;
        file.sync_data()?;

        if record.date == self.cache_date {
            self.today.entry(person_key(name)).or_default().push(record.clone());
        }
        tracing::info!(
            name,
            kind = %kind,
            confidence = format!("{confidence:.4}"),
            photo = record.photo_path.as_deref().unwrap_or(""),
            "attendance recorded"
        );
        Ok(record)
    }

    /// Record today's check-in unless one already exists.
    pub fn check_in(
        &mut self,
        name: &str,
        confidence: f32,
        photo: Option<&RgbImage>,
    ) -> Result<CheckInOutcome, AttendanceError> {
        self.roll_over_if_needed()?;
        if let Some(existing) = self.find_today(name, EventKind::CheckIn) {
            return Ok(CheckInOutcome::AlreadyCheckedIn {
                name: name.to_string(),
                time: existing.time.clone(),
            });
        }
        let notes = format!("Check-in at {}", self.clock.now().format("%H:%M:%S"));
        let record = self.record_attendance(name, EventKind::CheckIn, confidence, photo, None, Some(&notes))?;
        Ok(CheckInOutcome::Recorded(record))
    }

    /// Record today's check-out. Requires a check-in today and no prior
    /// check-out today.
    pub fn check_out(
        &mut self,
        name: &str,
        confidence: f32,
        photo: Option<&RgbImage>,
    ) -> Result<CheckOutOutcome, AttendanceError> {
        self.roll_over_if_needed()?;
        if self.find_today(name, EventKind::CheckIn).is_none() {
            return Ok(CheckOutOutcome::NotCheckedIn);
        }
        if let Some(existing) = self.find_today(name, EventKind::CheckOut) {
            return Ok(CheckOutOutcome::AlreadyCheckedOut {
                time: existing.time.clone(),
            });
        }
        let record = self.record_attendance(
            name,
            EventKind::CheckOut,
            confidence,
            photo,
            None,
            Some("Auto check-out via face recognition"),
        )?;
        Ok(CheckOutOutcome::Recorded(record))
    }

    fn find_today(&self, name: &str, kind: EventKind) -> Option<&AttendanceRecord> {
        self.today.get(&person_key(name))?.iter().find(|r| r.kind == kind)
    }

    /// Physically remove the row matching `timestamp` and `name`, rewriting
    /// the whole file. Returns false when no row matched.
    pub fn delete_record(&mut self, timestamp: &str, name: &str) -> Result<bool, AttendanceError> {
        if !self.csv_path.exists() {
            return Ok(false);
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&self.csv_path)?;
        let headers = reader.byte_headers()?.clone();
        let ts_col = headers
            .iter()
            .position(|h| h == b"timestamp")
            .ok_or(AttendanceError::MissingColumn("timestamp"))?;
        let name_col = headers
            .iter()
            .position(|h| h == b"person_name")
            .ok_or(AttendanceError::MissingColumn("person_name"))?;

        // Raw bytes, so rows the typed reader skips survive the rewrite.
        let mut kept = Vec::new();
        let mut deleted = false;
        for row in reader.byte_records() {
            let row = row?;
            if !deleted
                && row.get(ts_col) == Some(timestamp.as_bytes())
                && row.get(name_col) == Some(name.as_bytes())
            {
                deleted = true;
                continue;
            }
            kept.push(row);
        }
        if !deleted {
            return Ok(false);
        }

        let tmp = self.csv_path.with_extension("csv.tmp");
        {
            let mut writer = csv_writer(std::fs::File::create(&tmp)?);
            writer.write_record(&headers)?;
            for row in &kept {
                writer.write_record(row)?;
            }
            writer.flush()?;
        }
        std::fs::rename(&tmp, &self.csv_path)?;
        self.reload_today()?;

        tracing::info!(timestamp, name, "attendance record deleted");
        Ok(true)
    }

    /// All rows, optionally restricted to one date.
    pub fn get_records(&self, date: Option<NaiveDate>) -> Result<Vec<AttendanceRecord>, AttendanceError> {
        let records = self.read_records()?;
        Ok(match date {
            Some(d) => records.into_iter().filter(|r| r.date == d).collect(),
            None => records,
        })
    }

    /// Rows with `start <= date <= end`.
    pub fn get_records_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, AttendanceError> {
        Ok(self
            .read_records()?
            .into_iter()
            .filter(|r| r.date >= start && r.date <= end)
            .collect())
    }

    /// Today's rows sorted by timestamp.
    pub fn get_today_attendance(&mut self) -> Result<Vec<AttendanceRecord>, AttendanceError> {
        self.roll_over_if_needed()?;
        let mut records: Vec<AttendanceRecord> = self.today.values().flatten().cloned().collect();
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(records)
    }

    pub fn today_stats(&mut self, total_persons: usize) -> Result<TodayStats, AttendanceError> {
        let records = self.get_today_attendance()?;
        let check_ins = records.iter().filter(|r| r.kind == EventKind::CheckIn).count();
        let check_outs = records.len() - check_ins;
        let present: HashSet<String> = records
            .iter()
            .filter(|r| r.kind == EventKind::CheckIn)
            .map(|r| person_key(&r.person_name))
            .collect();
        let attendance_rate = if total_persons > 0 {
            present.len() as f32 / total_persons as f32
        } else {
            0.0
        };
        Ok(TodayStats {
            date: self.cache_date,
            check_ins,
            check_outs,
            present: present.len(),
            total_persons,
            attendance_rate,
        })
    }

    /// Per-person counts over a date range (default: the last 30 days).
    pub fn person_summary(
        &self,
        name: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<PersonSummary, AttendanceError> {
        let today = self.clock.now().date();
        let start = start.unwrap_or(today - Duration::days(SUMMARY_DEFAULT_DAYS));
        let end = end.unwrap_or(today);
        let records: Vec<AttendanceRecord> = self
            .get_records_between(start, end)?
            .into_iter()
            .filter(|r| r.person_name == name)
            .collect();
        let total_check_ins = records.iter().filter(|r| r.kind == EventKind::CheckIn).count();
        Ok(PersonSummary {
            person_name: name.to_string(),
            start,
            end,
            total_check_ins,
            total_check_outs: records.len() - total_check_ins,
            total_records: records.len(),
            records,
        })
    }

    pub fn build_report(&self, start: NaiveDate, end: NaiveDate) -> Result<AttendanceReport, AttendanceError> {
        let records = self.get_records_between(start, end)?;
        let total_records = records.len();
        let mut persons: BTreeMap<String, PersonReport> = BTreeMap::new();
        for record in records {
            let entry = persons.entry(record.person_name.clone()).or_default();
            match record.kind {
                EventKind::CheckIn => entry.check_ins += 1,
                EventKind::CheckOut => entry.check_outs += 1,
            }
            entry.records.push(record);
        }
        Ok(AttendanceReport {
            generated_at: self.clock.now(),
            period: ReportPeriod { start, end },
            summary: ReportSummary {
                total_persons: persons.len(),
                total_records,
                total_check_ins: persons.values().map(|p| p.check_ins).sum(),
                total_check_outs: persons.values().map(|p| p.check_outs).sum(),
            },
            persons,
        })
    }

    /// Write a JSON report grouped by person. Defaults to
    /// `logs/report_<start>_<end>.json`.
    pub fn export_report(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        path: Option<&Path>,
    ) -> Result<PathBuf, AttendanceError> {
        let out = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.log_dir.join(format!("report_{start}_{end}.json")));
        let report = self.build_report(start, end)?;
        std::fs::write(&out, serde_json::to_string_pretty(&report)?)?;
        tracing::info!(path = %out.display(), records = report.summary.total_records, "report exported");
        Ok(out)
    }

    /// Write a flat CSV with `Date,Time,Name,Type,Confidence,Notes` columns.
    pub fn export_csv(&self, start: NaiveDate, end: NaiveDate, path: &Path) -> Result<PathBuf, AttendanceError> {
        let records = self.get_records_between(start, end)?;
        let mut writer = csv_writer(std::fs::File::create(path)?);
        writer.write_record(["Date", "Time", "Name", "Type", "Confidence", "Notes"])?;
        for r in &records {
            writer.write_record([
                r.date.to_string(),
                r.time.clone(),
                r.person_name.clone(),
                r.kind.to_string(),
                format!("{:.4}", r.confidence),
                r.notes.clone().unwrap_or_default(),
            ])?;
        }
        writer.flush()?;
        tracing::info!(path = %path.display(), records = records.len(), "csv exported");
        Ok(path.to_path_buf())
    }
}

fn csv_writer<W: std::io::Write>(inner: W) -> csv::Writer<W> {
    csv::WriterBuilder::new()
        .has_headers(false)
        .quote_style(csv::QuoteStyle::Necessary)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(inner)
}

/// Name as used in photo file names: path separators and other punctuation → `_`.
/// Today-cache key. Person names are unique regardless of case.
fn person_key(name: &str) -> String {
    name.trim().to_lowercase()
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || matches!(c, ' ' | '_' | '-') { c } else { '_' })
        .collect()
}
