//! Daily attendance ledger.
//!
//! One CSV file per calendar date, `Attendance_DD-MM-YYYY.csv`, with a
//! `NAME,TIME` header and one row per distinct name in first-sighting order.
//!
//! A new day's file is written whole (header plus first row) through a temp
//! file and rename, so the header is never torn. Later rows are appended
//! with a single write. A row cut short by a crash has no trailing newline:
//! readers skip it and the next append truncates it before writing.
//!
//! Like the gallery, the ledger assumes one writer process at a time.

use crate::types::AttendanceRecord;
use chrono::{NaiveDate, NaiveTime};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const HEADER: [&str; 2] = ["NAME", "TIME"];
const TIME_FORMAT: &str = "%H:%M:%S";
const DATE_FORMAT: &str = "%d-%m-%Y";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger I/O: {0}")]
    Io(#[from] io::Error),
    #[error("ledger {path} corrupt: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("attendance name is empty")]
    EmptyName,
}

/// Result of [`LedgerBook::record_if_new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// A new row was written.
    Recorded(AttendanceRecord),
    /// The name was already on today's ledger; carries the original row.
    AlreadyPresent(AttendanceRecord),
}

impl RecordOutcome {
    pub fn is_recorded(&self) -> bool {
        matches!(self, RecordOutcome::Recorded(_))
    }

    pub fn record(&self) -> &AttendanceRecord {
        match self {
            RecordOutcome::Recorded(r) | RecordOutcome::AlreadyPresent(r) => r,
        }
    }
}

/// Directory of daily ledger files.
#[derive(Debug, Clone)]
pub struct LedgerBook {
    dir: PathBuf,
}

/// Date string used in ledger file names (`DD-MM-YYYY`).
pub fn date_key(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Parse a `DD-MM-YYYY` date string.
pub fn parse_date_key(key: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(key, DATE_FORMAT).ok()
}

impl LedgerBook {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("Attendance_{}.csv", date_key(date)))
    }

    /// Every record for `date`, in the order they were written.
    pub fn list_for_date(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let path = self.path_for(date);
        match fs::read(&path) {
            Ok(bytes) => parse_ledger(&path, &bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Record `name` at `time` unless it already appears on `date`'s ledger.
    ///
    /// First sighting wins: an existing row is never rewritten.
    pub fn record_if_new(
        &self,
        name: &str,
        date: NaiveDate,
        time: NaiveTime,
    ) -> Result<RecordOutcome, LedgerError> {
        if name.trim().is_empty() {
            return Err(LedgerError::EmptyName);
        }

        let path = self.path_for(date);
        let existing = self.list_for_date(date)?;
        if let Some(record) = existing.into_iter().find(|r| r.name == name) {
            return Ok(RecordOutcome::AlreadyPresent(record));
        }

        let record = AttendanceRecord {
            name: name.to_string(),
            time,
        };
        let time_text = time.format(TIME_FORMAT).to_string();
        let row = encode_row(&[name, time_text.as_str()])?;

        let is_new = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        if is_new {
            let mut contents = encode_row(&HEADER)?;
            contents.extend_from_slice(&row);
            create_atomic(&path, &contents)?;
            tracing::info!(path = %path.display(), "created daily ledger");
        } else {
            append_row(&path, &row)?;
        }

        tracing::debug!(name, time = %record.time, date = %date_key(date), "attendance recorded");
        Ok(RecordOutcome::Recorded(record))
    }
}

fn encode_row<S: AsRef<[u8]>>(fields: &[S]) -> Result<Vec<u8>, LedgerError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(fields).map_err(csv_to_io)?;
    writer
        .into_inner()
        .map_err(|e| LedgerError::Io(e.into_error()))
}

fn csv_to_io(e: csv::Error) -> LedgerError {
    LedgerError::Io(io::Error::new(io::ErrorKind::Other, e))
}

fn parse_ledger(path: &Path, bytes: &[u8]) -> Result<Vec<AttendanceRecord>, LedgerError> {
    let corrupt = |reason: String| LedgerError::Corrupt {
        path: path.display().to_string(),
        reason,
    };

    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let complete = match bytes.iter().rposition(|&b| b == b'\n') {
        Some(last) => &bytes[..=last],
        None => return Err(corrupt("no complete header line".into())),
    };
    if complete.len() < bytes.len() {
        tracing::warn!(
            path = %path.display(),
            bytes = bytes.len() - complete.len(),
            "ignoring torn trailing row"
        );
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(complete);

    let headers = reader.headers().map_err(|e| corrupt(e.to_string()))?;
    if headers.iter().map(str::trim).ne(HEADER.iter().copied()) {
        return Err(corrupt(format!("unexpected header {headers:?}")));
    }

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| corrupt(e.to_string()))?;
        let (Some(name), Some(time)) = (row.get(0), row.get(1)) else {
            return Err(corrupt(format!("short row {row:?}")));
        };
        let time = NaiveTime::parse_from_str(time.trim(), TIME_FORMAT)
            .map_err(|e| corrupt(format!("bad time {time:?}: {e}")))?;
        records.push(AttendanceRecord {
            name: name.to_string(),
            time,
        });
    }
    Ok(records)
}

fn create_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("csv.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Append one encoded row, first cutting off any torn tail.
fn append_row(path: &Path, row: &[u8]) -> io::Result<()> {
    let bytes = fs::read(path)?;
    let keep = bytes
        .iter()
        .rposition(|&b| b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);

    let file = OpenOptions::new().write(true).open(path)?;
    if keep < bytes.len() {
        tracing::warn!(path = %path.display(), "truncating torn trailing row");
        file.set_len(keep as u64)?;
    }
    drop(file);

    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(row)?;
    file.sync_data()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 7).unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn test_file_naming() {
        let dir = TempDir::new().unwrap();
        let book = LedgerBook::open(dir.path()).unwrap();
        assert_eq!(
            book.path_for(day()),
            dir.path().join("Attendance_07-03-2024.csv")
        );
        assert_eq!(parse_date_key("07-03-2024"), Some(day()));
    }

    #[test]
    fn test_header_written_once() {
        let dir = TempDir::new().unwrap();
        let book = LedgerBook::open(dir.path()).unwrap();
        book.record_if_new("alice", day(), at(9, 0, 1)).unwrap();
        book.record_if_new("bob", day(), at(9, 0, 5)).unwrap();

        let text = fs::read_to_string(book.path_for(day())).unwrap();
        assert_eq!(text, "NAME,TIME\nalice,09:00:01\nbob,09:00:05\n");
    }

    #[test]
    fn test_first_sighting_wins() {
        let dir = TempDir::new().unwrap();
        let book = LedgerBook::open(dir.path()).unwrap();

        let first = book.record_if_new("alice", day(), at(8, 59, 0)).unwrap();
        assert!(first.is_recorded());
        for minute in 0..10 {
            let again = book.record_if_new("alice", day(), at(9, minute, 0)).unwrap();
            assert_eq!(again, RecordOutcome::AlreadyPresent(first.record().clone()));
        }

        let records = book.list_for_date(day()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].time, at(8, 59, 0));
    }

    #[test]
    fn test_days_are_independent() {
        let dir = TempDir::new().unwrap();
        let book = LedgerBook::open(dir.path()).unwrap();
        let next = day().succ_opt().unwrap();

        assert!(book.record_if_new("alice", day(), at(9, 0, 0)).unwrap().is_recorded());
        assert!(book.record_if_new("alice", next, at(9, 0, 0)).unwrap().is_recorded());
        assert_eq!(book.list_for_date(next).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_day_is_empty() {
        let dir = TempDir::new().unwrap();
        let book = LedgerBook::open(dir.path()).unwrap();
        assert!(book.list_for_date(day()).unwrap().is_empty());
    }

    #[test]
    fn test_names_with_commas_round_trip() {
        let dir = TempDir::new().unwrap();
        let book = LedgerBook::open(dir.path()).unwrap();
        book.record_if_new("Doe, Jane", day(), at(10, 0, 0)).unwrap();

        let records = book.list_for_date(day()).unwrap();
        assert_eq!(records[0].name, "Doe, Jane");
    }

    #[test]
    fn test_torn_tail_is_skipped_and_repaired() {
        let dir = TempDir::new().unwrap();
        let book = LedgerBook::open(dir.path()).unwrap();
        book.record_if_new("alice", day(), at(9, 0, 0)).unwrap();

        let path = book.path_for(day());
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"bo").unwrap();
        drop(file);

        assert_eq!(book.list_for_date(day()).unwrap().len(), 1);

        book.record_if_new("bob", day(), at(9, 1, 0)).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "NAME,TIME\nalice,09:00:00\nbob,09:01:00\n");
    }

    #[test]
    fn test_bad_header_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let book = LedgerBook::open(dir.path()).unwrap();
        fs::write(book.path_for(day()), "WHO,WHEN\nalice,09:00:00\n").unwrap();

        assert!(matches!(
            book.list_for_date(day()),
            Err(LedgerError::Corrupt { .. })
        ));
        assert!(book.record_if_new("bob", day(), at(9, 0, 0)).is_err());
    }

    #[test]
    fn test_empty_name_rejected() {
        let dir = TempDir::new().unwrap();
        let book = LedgerBook::open(dir.path()).unwrap();
        assert!(matches!(
            book.record_if_new(" ", day(), at(9, 0, 0)),
            Err(LedgerError::EmptyName)
        ));
    }
}
