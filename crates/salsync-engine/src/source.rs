//! Source reader
//!
//! Lazy, restartable cursors over the `Person` and `Salary` tables of a
//! read-only SQLite snapshot. Rows are paged by `rowid`, so each cursor
//! yields rows in insertion order and a fresh cursor always starts over.
//!
//! A row that cannot be parsed yields [`SyncError::MalformedRow`] and the
//! cursor moves on; only a failure of the store itself ends iteration.

use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags};
use salsync_common::types::{NaturalKey, PersonRecord, SalaryRecord};
use salsync_common::{Result, SyncError};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const PERSON_TABLE: &str = "Person";
pub const SALARY_TABLE: &str = "Salary";

/// A parsed row, or the reason it was skipped
pub type RowResult<T> = Result<T>;

/// One page of rows keyed by `rowid`
pub type Page<T> = Vec<(i64, RowResult<T>)>;

/// Ordered, paged access to source rows
///
/// The pipeline only depends on this trait; [`SqliteSource`] is the
/// production implementation.
pub trait RowStore {
    /// Person rows with `rowid > after`, at most `limit` of them
    fn fetch_people_page(&self, after: i64, limit: usize) -> Result<Page<PersonRecord>>;

    /// Salary rows with `rowid > after`, at most `limit` of them
    fn fetch_salary_page(&self, after: i64, limit: usize) -> Result<Page<SalaryRecord>>;

    fn people(&self, page_size: usize) -> RowCursor<'_, Self, PersonRecord>
    where
        Self: Sized,
    {
        RowCursor::new(self, page_size, Self::fetch_people_page)
    }

    fn salaries(&self, page_size: usize) -> RowCursor<'_, Self, SalaryRecord>
    where
        Self: Sized,
    {
        RowCursor::new(self, page_size, Self::fetch_salary_page)
    }
}

type FetchPage<S, T> = fn(&S, i64, usize) -> Result<Page<T>>;

/// Lazy keyset-paginated cursor
pub struct RowCursor<'a, S, T> {
    store: &'a S,
    fetch: FetchPage<S, T>,
    page_size: usize,
    last_row: i64,
    buffer: VecDeque<RowResult<T>>,
    exhausted: bool,
}

impl<'a, S, T> RowCursor<'a, S, T> {
    fn new(store: &'a S, page_size: usize, fetch: FetchPage<S, T>) -> Self {
        Self {
            store,
            fetch,
            page_size: page_size.max(1),
            last_row: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }
}

impl<S, T> Iterator for RowCursor<'_, S, T> {
    type Item = RowResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(item) = self.buffer.pop_front() {
            return Some(item);
        }
        if self.exhausted {
            return None;
        }

        match (self.fetch)(self.store, self.last_row, self.page_size) {
            Ok(page) => {
                if page.len() < self.page_size {
                    self.exhausted = true;
                }
                if let Some((row_id, _)) = page.last() {
                    self.last_row = *row_id;
                }
                self.buffer.extend(page.into_iter().map(|(_, row)| row));
                self.buffer.pop_front()
            }
            Err(e) => {
                self.exhausted = true;
                Some(Err(e))
            }
        }
    }
}

/// Read-only SQLite snapshot with `Person` and `Salary` tables
pub struct SqliteSource {
    conn: Connection,
    path: PathBuf,
    has_department: bool,
    has_hire_date: bool,
    person_limit: Option<usize>,
}

impl SqliteSource {
    /// Open and validate a snapshot
    ///
    /// Fails with `SourceUnavailable` when the file is missing, is not a
    /// SQLite database, or lacks either required table.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(SyncError::SourceUnavailable(format!(
                "{} does not exist or is not a file",
                path.display()
            )));
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| unavailable(path, e))?;

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('Person', 'Salary')",
                )
                .map_err(|e| unavailable(path, e))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| unavailable(path, e))?;
            rows.collect::<rusqlite::Result<_>>()
                .map_err(|e| unavailable(path, e))?
        };

        for required in [PERSON_TABLE, SALARY_TABLE] {
            if !tables.iter().any(|t| t == required) {
                return Err(SyncError::SourceUnavailable(format!(
                    "{} has no {} table",
                    path.display(),
                    required
                )));
            }
        }

        let person_columns = table_columns(&conn, PERSON_TABLE).map_err(|e| unavailable(path, e))?;
        let has_department = person_columns.iter().any(|c| c.eq_ignore_ascii_case("Department"));
        let has_hire_date = person_columns.iter().any(|c| c.eq_ignore_ascii_case("HireDate"));

        info!(
            path = %path.display(),
            has_department,
            has_hire_date,
            "Opened source snapshot"
        );

        Ok(Self {
            conn,
            path: path.to_path_buf(),
            has_department,
            has_hire_date,
            person_limit: None,
        })
    }

    /// Read at most `limit` person rows, and only the salaries of those people
    pub fn with_person_limit(mut self, limit: Option<usize>) -> Self {
        self.person_limit = limit;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn person_columns_sql(&self) -> (&'static str, &'static str) {
        (
            if self.has_department { "p.Department" } else { "NULL" },
            if self.has_hire_date { "p.HireDate" } else { "NULL" },
        )
    }

    /// SQLite treats a negative LIMIT as unbounded
    fn limit_param(&self) -> i64 {
        self.person_limit
            .map(|n| i64::try_from(n).unwrap_or(i64::MAX))
            .unwrap_or(-1)
    }

    fn fetch_raw(&self, sql: &str, after: i64, limit: usize) -> Result<Vec<Vec<Value>>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self
            .conn
            .prepare_cached(sql)
            .map_err(|e| unavailable(&self.path, e))?;
        let columns = stmt.column_count();
        let rows = stmt
            .query_map(params![after, limit, self.limit_param()], |row| {
                (0..columns)
                    .map(|i| row.get::<_, Value>(i))
                    .collect::<rusqlite::Result<Vec<Value>>>()
            })
            .map_err(|e| unavailable(&self.path, e))?;
        rows.collect::<rusqlite::Result<Vec<Vec<Value>>>>()
            .map_err(|e| unavailable(&self.path, e))
    }
}

impl RowStore for SqliteSource {
    fn fetch_people_page(&self, after: i64, limit: usize) -> Result<Page<PersonRecord>> {
        let (department, hire_date) = self.person_columns_sql();
        let sql = format!(
            "SELECT p.rowid, p.ID, p.FirstName, p.LastName, {department}, {hire_date}
             FROM Person p
             WHERE p.rowid > ?1
               AND p.rowid IN (SELECT rowid FROM Person ORDER BY rowid LIMIT ?3)
             ORDER BY p.rowid
             LIMIT ?2"
        );

        let page: Page<PersonRecord> = self
            .fetch_raw(&sql, after, limit)?
            .iter()
            .map(|values| {
                let row_id = integer(&values[0]).unwrap_or_default();
                (row_id, parse_person(row_id, values))
            })
            .collect();

        debug!(after, rows = page.len(), "Fetched person page");
        Ok(page)
    }

    fn fetch_salary_page(&self, after: i64, limit: usize) -> Result<Page<SalaryRecord>> {
        let (department, hire_date) = self.person_columns_sql();
        let sql = format!(
            "SELECT s.rowid, s.ID, s.PersonID, s.Title, s.Employer, s.Salary, s.Bonus,
                    s.TotalPay, s.EntryDate, s.SourceFile, s.LineNumber,
                    p.ID, p.FirstName, p.LastName, {department}, {hire_date}
             FROM Salary s
             LEFT JOIN Person p ON p.ID = s.PersonID
             WHERE s.rowid > ?1
               AND (?3 < 0 OR s.PersonID IN (SELECT ID FROM Person ORDER BY rowid LIMIT ?3))
             ORDER BY s.rowid
             LIMIT ?2"
        );

        let page: Page<SalaryRecord> = self
            .fetch_raw(&sql, after, limit)?
            .iter()
            .map(|values| {
                let row_id = integer(&values[0]).unwrap_or_default();
                (row_id, parse_salary(row_id, values))
            })
            .collect();

        debug!(after, rows = page.len(), "Fetched salary page");
        Ok(page)
    }
}

fn unavailable(path: &Path, err: rusqlite::Error) -> SyncError {
    SyncError::SourceUnavailable(format!("{}: {}", path.display(), err))
}

fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let rows = stmt.query_map([table], |row| row.get::<_, String>(0))?;
    rows.collect()
}

// ============================================================================
// Row parsing
// ============================================================================

fn parse_person(row_id: i64, v: &[Value]) -> RowResult<PersonRecord> {
    let malformed = |reason: String| SyncError::malformed(PERSON_TABLE, row_id, reason);

    let source_id = integer(&v[1]).unwrap_or(row_id);
    let first_name = text(&v[2]).ok_or_else(|| malformed("FirstName is empty".into()))?;
    let last_name = text(&v[3]).ok_or_else(|| malformed("LastName is empty".into()))?;
    let department = text(&v[4]);
    let hire_date = date(&v[5]).map_err(|e| malformed(format!("HireDate {}", e)))?;

    Ok(PersonRecord::new(
        source_id,
        first_name,
        last_name,
        department,
        hire_date,
    ))
}

fn parse_salary(row_id: i64, v: &[Value]) -> RowResult<SalaryRecord> {
    let malformed = |reason: String| SyncError::malformed(SALARY_TABLE, row_id, reason);

    if matches!(v[11], Value::Null) {
        let person = match &v[2] {
            Value::Null => "NULL".to_string(),
            other => display_value(other),
        };
        return Err(malformed(format!("PersonID {} has no Person row", person)));
    }

    let first_name = text(&v[12]).ok_or_else(|| malformed("person FirstName is empty".into()))?;
    let last_name = text(&v[13]).ok_or_else(|| malformed("person LastName is empty".into()))?;
    let hire_date = date(&v[15]).map_err(|e| malformed(format!("person HireDate {}", e)))?;
    let person_key = NaturalKey::new(&first_name, &last_name, text(&v[14]).as_deref(), hire_date);

    let effective_date = date(&v[8])
        .map_err(|e| malformed(format!("EntryDate {}", e)))?
        .ok_or_else(|| malformed("EntryDate is empty".into()))?;

    Ok(SalaryRecord {
        source_id: integer(&v[1]).unwrap_or(row_id),
        person_key,
        effective_date,
        salary: amount(&v[5]).map_err(|e| malformed(format!("Salary {}", e)))?,
        bonus: amount(&v[6]).map_err(|e| malformed(format!("Bonus {}", e)))?,
        total_pay: amount(&v[7]).map_err(|e| malformed(format!("TotalPay {}", e)))?,
        title: text(&v[3]),
        employer: text(&v[4]),
        source_file: text(&v[9]),
        line_number: integer(&v[10]),
    })
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(i) => Some(*i),
        Value::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Trimmed, non-empty text; numbers are rendered as text
fn text(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Blob(_) => None,
        other => {
            let s = display_value(other);
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => s.clone(),
        Value::Blob(b) => format!("<{} byte blob>", b.len()),
    }
}

fn amount(value: &Value) -> std::result::Result<Option<f64>, String> {
    match value {
        Value::Null => Ok(None),
        Value::Integer(i) => Ok(Some(*i as f64)),
        Value::Real(f) => Ok(Some(*f)),
        Value::Text(s) => {
            let cleaned: String = s
                .trim()
                .trim_start_matches('$')
                .chars()
                .filter(|c| *c != ',')
                .collect();
            if cleaned.is_empty() {
                return Ok(None);
            }
            cleaned
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Some)
                .ok_or_else(|| format!("'{}' is not a number", s))
        }
        Value::Blob(_) => Err("is a blob, not a number".to_string()),
    }
}

fn date(value: &Value) -> std::result::Result<Option<NaiveDate>, String> {
    let raw = match value {
        Value::Null => return Ok(None),
        Value::Text(s) => s.trim(),
        other => return Err(format!("'{}' is not a date", display_value(other))),
    };
    if raw.is_empty() {
        return Ok(None);
    }

    // Accept a date-time by its date part
    let day = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%m/%d/%Y"))
        .map(Some)
        .map_err(|_| format!("'{}' is not a date", raw))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn snapshot(with_optional_columns: bool) -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payroll.db");
        let conn = Connection::open(&path).unwrap();
        let person_extra = if with_optional_columns {
            ", Department TEXT, HireDate TEXT"
        } else {
            ""
        };
        conn.execute_batch(&format!(
            "CREATE TABLE Person (ID INTEGER PRIMARY KEY, FirstName TEXT, LastName TEXT{person_extra});
             CREATE TABLE Salary (ID INTEGER PRIMARY KEY, PersonID INTEGER, Title TEXT, Employer TEXT,
                                  Salary REAL, Bonus REAL, TotalPay REAL, EntryDate TEXT,
                                  SourceFile TEXT, LineNumber INTEGER);"
        ))
        .unwrap();
        (dir, path)
    }

    fn add_person(path: &Path, id: i64, first: Option<&str>, last: &str) {
        let conn = Connection::open(path).unwrap();
        conn.execute(
            "INSERT INTO Person (ID, FirstName, LastName) VALUES (?1, ?2, ?3)",
            params![id, first, last],
        )
        .unwrap();
    }

    fn add_salary(path: &Path, id: i64, person: i64, salary: &str, entry: &str) {
        let conn = Connection::open(path).unwrap();
        conn.execute(
            "INSERT INTO Salary (ID, PersonID, Title, Employer, Salary, EntryDate, SourceFile, LineNumber)
             VALUES (?1, ?2, 'Analyst', 'City', ?3, ?4, 'payroll-2021.csv', ?1)",
            params![id, person, salary, entry],
        )
        .unwrap();
    }

    #[test]
    fn test_missing_file_is_unavailable() {
        let err = SqliteSource::open("/nonexistent/payroll.db").err().unwrap();
        assert!(matches!(err, SyncError::SourceUnavailable(_)));
    }

    #[test]
    fn test_missing_table_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE Person (ID INTEGER, FirstName TEXT, LastName TEXT);")
            .unwrap();

        let err = SqliteSource::open(&path).err().unwrap();
        assert!(err.to_string().contains("Salary"));
    }

    #[test]
    fn test_not_a_database_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.db");
        std::fs::write(&path, "this is not sqlite, just some text that is long enough").unwrap();

        assert!(matches!(
            SqliteSource::open(&path),
            Err(SyncError::SourceUnavailable(_))
        ));
    }

    #[test]
    fn test_people_in_rowid_order_across_pages() {
        let (_dir, path) = snapshot(false);
        for (id, last) in [(5, "Eve"), (1, "Ann"), (3, "Cid"), (2, "Bea"), (4, "Dan")] {
            add_person(&path, id, Some("X"), last);
        }

        let source = SqliteSource::open(&path).unwrap();
        let people: Vec<_> = source.people(2).map(|r| r.unwrap()).collect();
        let ids: Vec<i64> = people.iter().map(|p| p.source_id).collect();
        // INTEGER PRIMARY KEY aliases rowid
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_malformed_person_does_not_stop_iteration() {
        let (_dir, path) = snapshot(false);
        add_person(&path, 1, Some("Ada"), "Lovelace");
        add_person(&path, 2, None, "Nameless");
        add_person(&path, 3, Some("Grace"), "Hopper");

        let source = SqliteSource::open(&path).unwrap();
        let rows: Vec<_> = source.people(10).collect();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].is_ok());
        assert!(matches!(
            rows[1],
            Err(SyncError::MalformedRow { row_id: 2, .. })
        ));
        assert_eq!(rows[2].as_ref().unwrap().last_name, "Hopper");
    }

    #[test]
    fn test_cursors_are_restartable() {
        let (_dir, path) = snapshot(false);
        add_person(&path, 1, Some("Ada"), "Lovelace");
        add_person(&path, 2, Some("Grace"), "Hopper");

        let source = SqliteSource::open(&path).unwrap();
        let first: Vec<_> = source.people(1).map(|r| r.unwrap()).collect();
        let second: Vec<_> = source.people(1).map(|r| r.unwrap()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_optional_columns_feed_natural_key() {
        let (_dir, path) = snapshot(true);
        Connection::open(&path)
            .unwrap()
            .execute(
                "INSERT INTO Person VALUES (1, 'Ada', 'Lovelace', 'Engineering', '2019-03-01')",
                [],
            )
            .unwrap();

        let source = SqliteSource::open(&path).unwrap();
        let person = source.people(10).next().unwrap().unwrap();
        assert_eq!(person.department.as_deref(), Some("Engineering"));
        assert_eq!(
            person.natural_key.as_str(),
            "lovelace|ada|engineering|2019-03-01"
        );
    }

    #[test]
    fn test_salary_rows() {
        let (_dir, path) = snapshot(false);
        add_person(&path, 1, Some("Ada"), "Lovelace");
        add_salary(&path, 10, 1, "1,250.50", "2021-06-30 00:00:00");
        add_salary(&path, 11, 1, "lots", "2022-06-30");
        add_salary(&path, 12, 99, "100", "2022-06-30");
        add_salary(&path, 13, 1, "100", "June");

        let source = SqliteSource::open(&path).unwrap();
        let rows: Vec<_> = source.salaries(3).collect();
        assert_eq!(rows.len(), 4);

        let first = rows[0].as_ref().unwrap();
        assert_eq!(first.salary, Some(1250.5));
        assert_eq!(
            first.effective_date,
            NaiveDate::from_ymd_opt(2021, 6, 30).unwrap()
        );
        assert_eq!(first.person_key, NaturalKey::new("Ada", "Lovelace", None, None));
        assert_eq!(first.line_number, Some(10));

        assert!(rows[1].as_ref().unwrap_err().to_string().contains("not a number"));
        assert!(rows[2]
            .as_ref()
            .unwrap_err()
            .to_string()
            .contains("PersonID 99 has no Person row"));
        assert!(rows[3].as_ref().unwrap_err().to_string().contains("EntryDate"));
    }

    #[test]
    fn test_person_limit_scopes_salaries() {
        let (_dir, path) = snapshot(false);
        add_person(&path, 1, Some("Ada"), "Lovelace");
        add_person(&path, 2, Some("Grace"), "Hopper");
        add_salary(&path, 10, 1, "100", "2021-01-01");
        add_salary(&path, 11, 2, "200", "2021-01-01");

        let source = SqliteSource::open(&path).unwrap().with_person_limit(Some(1));
        assert_eq!(source.people(10).count(), 1);

        let salaries: Vec<_> = source.salaries(10).map(|r| r.unwrap()).collect();
        assert_eq!(salaries.len(), 1);
        assert_eq!(salaries[0].source_id, 10);
    }
}
