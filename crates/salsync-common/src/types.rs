//! Domain types shared across salsync crates

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Field separator inside natural keys
const KEY_SEPARATOR: char = '|';

/// Normalise one key component: trim, lower-case, collapse inner whitespace.
///
/// The separator character is folded into whitespace so a name can never
/// forge an extra key segment.
fn normalize_component(value: &str) -> String {
    value
        .replace(KEY_SEPARATOR, " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Stable, source-derived identifier for a person
///
/// Encoded as `last|first|department|hire_date`; absent optional parts are
/// empty segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(String);

impl NaturalKey {
    pub fn new(
        first_name: &str,
        last_name: &str,
        department: Option<&str>,
        hire_date: Option<NaiveDate>,
    ) -> Self {
        let hire_date = hire_date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        Self(format!(
            "{last}{sep}{first}{sep}{dept}{sep}{hire_date}",
            last = normalize_component(last_name),
            first = normalize_component(first_name),
            dept = department.map(normalize_component).unwrap_or_default(),
            sep = KEY_SEPARATOR,
        ))
    }

    /// Rebuild a key previously produced by [`NaturalKey::new`] (ledger replay)
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one salary observation: person natural key plus effective date
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SalaryKey(String);

impl SalaryKey {
    pub fn new(person: &NaturalKey, effective_date: NaiveDate) -> Self {
        Self(format!("{}@{}", person.as_str(), effective_date.format("%Y-%m-%d")))
    }

    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SalaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read-only projection of a `Person` source row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonRecord {
    pub source_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub department: Option<String>,
    pub hire_date: Option<NaiveDate>,
    pub natural_key: NaturalKey,
}

impl PersonRecord {
    pub fn new(
        source_id: i64,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        department: Option<String>,
        hire_date: Option<NaiveDate>,
    ) -> Self {
        let first_name = first_name.into();
        let last_name = last_name.into();
        let natural_key =
            NaturalKey::new(&first_name, &last_name, department.as_deref(), hire_date);
        Self {
            source_id,
            first_name,
            last_name,
            department,
            hire_date,
            natural_key,
        }
    }
}

/// Read-only projection of a `Salary` source row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalaryRecord {
    pub source_id: i64,
    pub person_key: NaturalKey,
    pub effective_date: NaiveDate,
    pub salary: Option<f64>,
    pub bonus: Option<f64>,
    pub total_pay: Option<f64>,
    pub title: Option<String>,
    pub employer: Option<String>,
    pub source_file: Option<String>,
    pub line_number: Option<i64>,
}

impl SalaryRecord {
    pub fn key(&self) -> SalaryKey {
        SalaryKey::new(&self.person_key, self.effective_date)
    }
}

/// Remote object family a record targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Person,
    Salary,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Person => "person",
            RecordKind::Salary => "salary",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordKind {
    type Err = crate::SyncError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "person" => Ok(RecordKind::Person),
            "salary" => Ok(RecordKind::Salary),
            other => Err(crate::SyncError::LedgerCorrupt(format!(
                "unknown record kind '{}'",
                other
            ))),
        }
    }
}

/// Confirmed mapping from a person's natural key to the remote account id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIdentity {
    pub natural_key: NaturalKey,
    pub remote_id: String,
}

/// Per-record outcome reported by the remote store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordOutcome {
    Succeeded { remote_id: String },
    Failed { code: String, message: String },
}

impl RecordOutcome {
    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn remote_id(&self) -> Option<&str> {
        match self {
            Self::Succeeded { remote_id } => Some(remote_id),
            Self::Failed { .. } => None,
        }
    }
}

/// Outcome of one record, keyed by its position within the submitted batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub position: usize,
    /// Natural key (person) or salary key (salary) of the record
    pub key: String,
    pub outcome: RecordOutcome,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_natural_key_normalization() {
        let a = NaturalKey::new("  Grace ", "HOPPER", Some("Navy  Research"), None);
        let b = NaturalKey::new("grace", "hopper", Some("navy research"), None);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "hopper|grace|navy research|");
    }

    #[test]
    fn test_natural_key_includes_hire_date() {
        let date = NaiveDate::from_ymd_opt(2019, 3, 1).unwrap();
        let key = NaturalKey::new("Ada", "Lovelace", None, Some(date));
        assert_eq!(key.as_str(), "lovelace|ada||2019-03-01");
        assert_ne!(key, NaturalKey::new("Ada", "Lovelace", None, None));
    }

    #[test]
    fn test_natural_key_separator_cannot_forge_segments() {
        let forged = NaturalKey::new("a|b", "c", None, None);
        let plain = NaturalKey::new("a", "c", Some("b"), None);
        assert_ne!(forged, plain);
    }

    #[test]
    fn test_salary_key() {
        let person = NaturalKey::new("Ada", "Lovelace", None, None);
        let key = SalaryKey::new(&person, NaiveDate::from_ymd_opt(2021, 12, 31).unwrap());
        assert_eq!(key.as_str(), "lovelace|ada||@2021-12-31");
    }

    #[test]
    fn test_record_kind_round_trip() {
        assert_eq!("person".parse::<RecordKind>().unwrap(), RecordKind::Person);
        assert_eq!(RecordKind::Salary.to_string(), "salary");
        assert!("account".parse::<RecordKind>().is_err());
    }

    #[test]
    fn test_outcome_serialization() {
        let ok = RecordOutcome::Succeeded {
            remote_id: "001xx".to_string(),
        };
        let json = serde_json::to_string(&ok).unwrap();
        assert_eq!(json, r#"{"status":"succeeded","remote_id":"001xx"}"#);
        assert_eq!(ok.remote_id(), Some("001xx"));
        assert!(!RecordOutcome::failed("DUPLICATE_VALUE", "dup").is_success());
    }
}
