use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::Result;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorOrigin {
    Update,
    Launch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_key: Option<String>,
    pub origin: ErrorOrigin,
    pub message: String,
}

/// Append-only failure record read by the UI. One JSON object per line.
pub struct ErrorJournal {
    path: PathBuf,
    inner: Mutex<()>,
}

impl ErrorJournal {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            inner: Mutex::new(()),
        }
    }

    pub fn record(
        &self,
        application_key: Option<&str>,
        origin: ErrorOrigin,
        message: impl Into<String>,
    ) -> Result<ErrorEntry> {
        let entry = ErrorEntry {
            timestamp: Utc::now(),
            application_key: application_key.map(str::to_string),
            origin,
            message: message.into(),
        };
        let line = serde_json::to_string(&entry).map_err(io::Error::from)?;
        let _guard = self.inner.lock();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        Ok(entry)
    }

    /// All entries in the order they were written. Lines that do not parse
    /// are skipped.
    pub fn entries(&self) -> Result<Vec<ErrorEntry>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ErrorEntry>(&line) {
                Ok(entry) => out.push(entry),
                Err(e) => warn!(line = idx + 1, error = %e, "skipping corrupt journal line"),
            }
        }
        Ok(out)
    }

    /// Entries grouped by calendar day, newest day first.
    pub fn grouped_by_date(&self) -> Result<Vec<(NaiveDate, Vec<ErrorEntry>)>> {
        let mut groups: BTreeMap<NaiveDate, Vec<ErrorEntry>> = BTreeMap::new();
        for entry in self.entries()? {
            groups
                .entry(entry.timestamp.date_naive())
                .or_default()
                .push(entry);
        }
        Ok(groups.into_iter().rev().collect())
    }

    pub fn clear(&self) -> Result<()> {
        let _guard = self.inner.lock();
        match OpenOptions::new().write(true).truncate(true).open(&self.path) {
            Ok(file) => file.sync_all()?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn record_and_list_in_order() {
        let dir = tempdir().unwrap();
        let journal = ErrorJournal::new(dir.path().join("logs/errors.jsonl"));
        journal
            .record(Some("demo"), ErrorOrigin::Update, "server unreachable")
            .unwrap();
        journal
            .record(None, ErrorOrigin::Launch, "spawn failed")
            .unwrap();
        let entries = journal.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].application_key.as_deref(), Some("demo"));
        assert_eq!(entries[1].origin, ErrorOrigin::Launch);
        assert!(entries[1].application_key.is_none());
    }

    #[test]
    fn missing_journal_is_empty() {
        let dir = tempdir().unwrap();
        let journal = ErrorJournal::new(dir.path().join("errors.jsonl"));
        assert!(journal.entries().unwrap().is_empty());
        journal.clear().unwrap();
    }

    #[test]
    fn clear_truncates_everything() {
        let dir = tempdir().unwrap();
        let journal = ErrorJournal::new(dir.path().join("errors.jsonl"));
        journal.record(Some("a"), ErrorOrigin::Update, "x").unwrap();
        journal.clear().unwrap();
        assert!(journal.entries().unwrap().is_empty());
        journal.record(Some("b"), ErrorOrigin::Update, "y").unwrap();
        assert_eq!(journal.entries().unwrap().len(), 1);
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("errors.jsonl");
        let journal = ErrorJournal::new(&path);
        journal.record(Some("a"), ErrorOrigin::Update, "ok").unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{garbage").unwrap();
        journal.record(Some("b"), ErrorOrigin::Launch, "ok").unwrap();
        assert_eq!(journal.entries().unwrap().len(), 2);
    }

    #[test]
    fn grouping_puts_newest_day_first() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("errors.jsonl");
        let mut file = File::create(&path).unwrap();
        for (day, app) in [(1, "a"), (3, "b"), (1, "c")] {
            let entry = ErrorEntry {
                timestamp: Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap(),
                application_key: Some(app.into()),
                origin: ErrorOrigin::Update,
                message: "boom".into(),
            };
            writeln!(file, "{}", serde_json::to_string(&entry).unwrap()).unwrap();
        }
        drop(file);
        let groups = ErrorJournal::new(&path).grouped_by_date().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, NaiveDate::from_ymd_opt(2024, 5, 3).unwrap());
        assert_eq!(groups[1].1.len(), 2);
    }

    #[test]
    fn serialized_shape() {
        let entry = ErrorEntry {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            application_key: Some("demo".into()),
            origin: ErrorOrigin::Launch,
            message: "boom".into(),
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["applicationKey"], "demo");
        assert_eq!(value["origin"], "launch");
    }
}
