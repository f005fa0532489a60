//! Outbound records: source rows shaped for the remote objects

use chrono::NaiveDate;
use salsync_common::types::{NaturalKey, PersonRecord, RecordKind, SalaryKey, SalaryRecord};

use crate::transfer::csv_codec;

/// Person account to create
#[derive(Debug, Clone, PartialEq)]
pub struct PersonPayload {
    pub natural_key: NaturalKey,
    pub source_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub record_type_id: Option<String>,
}

impl PersonPayload {
    pub fn from_record(record: &PersonRecord, record_type_id: Option<&str>) -> Self {
        Self {
            natural_key: record.natural_key.clone(),
            source_id: record.source_id,
            first_name: record.first_name.clone(),
            last_name: record.last_name.clone(),
            record_type_id: record_type_id.map(str::to_string),
        }
    }
}

/// Salary history row linked to a confirmed person account
#[derive(Debug, Clone, PartialEq)]
pub struct SalaryPayload {
    pub key: SalaryKey,
    pub source_id: i64,
    pub person_remote_id: String,
    pub title: Option<String>,
    pub employer: Option<String>,
    pub salary: Option<f64>,
    pub bonus: Option<f64>,
    pub total_pay: Option<f64>,
    pub effective_date: NaiveDate,
    pub source_file: Option<String>,
    pub line_number: Option<i64>,
}

impl SalaryPayload {
    pub fn from_record(record: &SalaryRecord, person_remote_id: impl Into<String>) -> Self {
        Self {
            key: record.key(),
            source_id: record.source_id,
            person_remote_id: person_remote_id.into(),
            title: record.title.clone(),
            employer: record.employer.clone(),
            salary: record.salary,
            bonus: record.bonus,
            total_pay: record.total_pay,
            effective_date: record.effective_date,
            source_file: record.source_file.clone(),
            line_number: record.line_number,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundRecord {
    Person(PersonPayload),
    Salary(SalaryPayload),
}

impl OutboundRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            OutboundRecord::Person(_) => RecordKind::Person,
            OutboundRecord::Salary(_) => RecordKind::Salary,
        }
    }

    /// External-id value: natural key for people, salary key for salaries
    pub fn key(&self) -> &str {
        match self {
            OutboundRecord::Person(p) => p.natural_key.as_str(),
            OutboundRecord::Salary(s) => s.key.as_str(),
        }
    }

    /// Bytes this record occupies as one CSV row
    pub fn encoded_len(&self) -> usize {
        csv_codec::encode_row(self)
            .map(|row| row.len())
            .unwrap_or(usize::MAX)
    }
}
