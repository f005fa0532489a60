//! Run summary and the JSON-lines error report

use chrono::{DateTime, Utc};
use salsync_common::types::RecordKind;
use salsync_common::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Leading run-id characters in the error report name
const RUN_ID_IN_NAME: usize = 8;

/// Per-kind record counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindCounts {
    /// Rows read from the source, malformed ones included
    pub read: usize,
    pub created: usize,
    /// Already succeeded in an earlier run
    pub skipped: usize,
    pub duplicates: usize,
    pub malformed: usize,
    /// Rejected by the remote store, record by record
    pub failed: usize,
    /// Records of batches that exhausted retries or timed out
    pub permanently_failed: usize,
    pub blocked_by_dependency: usize,
    pub oversized: usize,
}

impl KindCounts {
    pub fn merge(&mut self, other: &KindCounts) {
        self.read += other.read;
        self.created += other.created;
        self.skipped += other.skipped;
        self.duplicates += other.duplicates;
        self.malformed += other.malformed;
        self.failed += other.failed;
        self.permanently_failed += other.permanently_failed;
        self.blocked_by_dependency += other.blocked_by_dependency;
        self.oversized += other.oversized;
    }

    /// Records that did not reach the remote store and were not skipped on purpose
    pub fn unsuccessful(&self) -> usize {
        self.malformed
            + self.failed
            + self.permanently_failed
            + self.blocked_by_dependency
            + self.oversized
    }
}

/// One row-, record- or batch-level problem, as written to the error report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncIssue {
    pub kind: RecordKind,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

impl SyncIssue {
    pub fn new(kind: RecordKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            key: None,
            row_id: None,
            batch_id: None,
        }
    }

    pub fn from_error(kind: RecordKind, error: &SyncError) -> Self {
        let mut issue = Self::new(kind, error.code(), error.to_string());
        if let SyncError::MalformedRow { row_id, .. } = error {
            issue.row_id = Some(*row_id);
        }
        issue
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }
}

/// Error that ended a run early
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatalError {
    pub code: String,
    pub message: String,
}

impl From<&SyncError> for FatalError {
    fn from(error: &SyncError) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Outcome of one pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub people: KindCounts,
    pub salaries: KindCounts,
    pub failed_batches: usize,
    /// Orphaned jobs from an earlier run that were re-polled
    pub recovered_batches: usize,
    pub interrupted: bool,
    pub fatal: Option<FatalError>,
    pub issues: Vec<SyncIssue>,
    pub error_report: Option<PathBuf>,
}

impl SyncSummary {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            people: KindCounts::default(),
            salaries: KindCounts::default(),
            failed_batches: 0,
            recovered_batches: 0,
            interrupted: false,
            fatal: None,
            issues: Vec::new(),
            error_report: None,
        }
    }

    pub fn counts_mut(&mut self, kind: RecordKind) -> &mut KindCounts {
        match kind {
            RecordKind::Person => &mut self.people,
            RecordKind::Salary => &mut self.salaries,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.people.created + self.salaries.created
    }

    pub fn skipped(&self) -> usize {
        self.people.skipped
            + self.salaries.skipped
            + self.people.duplicates
            + self.salaries.duplicates
    }

    pub fn failed(&self) -> usize {
        self.people.unsuccessful() + self.salaries.unsuccessful()
    }

    /// Anything a clean run would not have: failed batches or records, or an abort
    pub fn has_failures(&self) -> bool {
        self.fatal.is_some() || self.failed_batches > 0 || self.failed() > 0
    }

    /// Write every issue as one JSON object per line
    ///
    /// The file is written even when there are no issues so each run leaves
    /// a report behind. The name carries the start stamp and the head of the
    /// run id, so runs started in the same second keep separate reports.
    pub fn write_error_report(&mut self, dir: &Path, stamp: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let run: String = self.run_id.chars().take(RUN_ID_IN_NAME).collect();
        let path = dir.join(format!("salsync-errors-{}-{}.jsonl", stamp, run));
        let mut file = std::io::BufWriter::new(std::fs::File::create(&path)?);

        for issue in &self.issues {
            let line = ReportLine {
                run_id: &self.run_id,
                issue,
            };
            serde_json::to_writer(&mut file, &line)?;
            file.write_all(b"\n")?;
        }
        if let Some(fatal) = &self.fatal {
            serde_json::to_writer(
                &mut file,
                &serde_json::json!({
                    "run_id": self.run_id,
                    "code": fatal.code,
                    "message": fatal.message,
                    "fatal": true,
                }),
            )?;
            file.write_all(b"\n")?;
        }
        file.flush()?;

        self.error_report = Some(path.clone());
        Ok(path)
    }
}

#[derive(Serialize)]
struct ReportLine<'a> {
    run_id: &'a str,
    #[serde(flatten)]
    issue: &'a SyncIssue,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_issue_carries_row() {
        let err = SyncError::malformed("Person", 7, "LastName is empty");
        let issue = SyncIssue::from_error(RecordKind::Person, &err);
        assert_eq!(issue.code, "malformed_row");
        assert_eq!(issue.row_id, Some(7));
    }

    #[test]
    fn test_failure_accounting() {
        let mut summary = SyncSummary::new("run-1");
        summary.people.created = 2;
        summary.people.duplicates = 1;
        assert!(!summary.has_failures());
        assert_eq!(summary.skipped(), 1);

        summary.salaries.blocked_by_dependency = 3;
        assert!(summary.has_failures());
        assert_eq!(summary.failed(), 3);
    }

    #[test]
    fn test_error_report_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut summary = SyncSummary::new("run-1");
        summary.issues.push(
            SyncIssue::new(RecordKind::Salary, "blocked_by_dependency", "person not confirmed")
                .with_key("lovelace|ada||@2021-01-01"),
        );
        summary.issues.push(
            SyncIssue::new(RecordKind::Person, "DUPLICATE_VALUE", "duplicate")
                .with_batch("person-run-1-1"),
        );

        let path = summary.write_error_report(dir.path(), "20240101_120000").unwrap();
        assert!(path.ends_with("salsync-errors-20240101_120000-run-1.jsonl"));
        assert_eq!(summary.error_report.as_deref(), Some(path.as_path()));

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["run_id"], "run-1");
        assert_eq!(lines[0]["kind"], "salary");
        assert_eq!(lines[1]["batch_id"], "person-run-1-1");
        assert!(lines[1].get("key").is_none());
    }

    #[test]
    fn test_reports_from_the_same_second_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = SyncSummary::new("6f1c2a90-0b7e-4c4e-9d0e-2f5b8c1a7e33");
        first
            .issues
            .push(SyncIssue::new(RecordKind::Person, "DUPLICATE_VALUE", "duplicate"));
        let mut second = SyncSummary::new("c3d9e4b1-5a6f-4e2d-8b7c-1e0f9a8d6c55");

        let a = first.write_error_report(dir.path(), "20240101_120000").unwrap();
        let b = second.write_error_report(dir.path(), "20240101_120000").unwrap();

        assert_ne!(a, b);
        assert!(a.ends_with("salsync-errors-20240101_120000-6f1c2a90.jsonl"));
        assert_eq!(std::fs::read_to_string(&a).unwrap().lines().count(), 1);
        assert_eq!(std::fs::read_to_string(&b).unwrap(), "");
    }

    #[test]
    fn test_empty_report_is_still_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut summary = SyncSummary::new("run-2");
        let path = summary.write_error_report(dir.path(), "stamp").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "");
    }
}
