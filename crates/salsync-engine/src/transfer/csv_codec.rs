//! CSV bodies for bulk ingest jobs

use csv::{Terminator, WriterBuilder};
use salsync_common::types::RecordKind;
use salsync_common::{Result, SyncError};

use crate::record::{OutboundRecord, PersonPayload, SalaryPayload};

pub const PERSON_EXTERNAL_ID_FIELD: &str = "External_Id__pc";
pub const SALARY_EXTERNAL_ID_FIELD: &str = "External_Id__c";

const PERSON_FIELDS: [&str; 3] = ["FirstName", "LastName", PERSON_EXTERNAL_ID_FIELD];
const SALARY_FIELDS: [&str; 10] = [
    SALARY_EXTERNAL_ID_FIELD,
    "Person__c",
    "Title__c",
    "Employer__c",
    "Salary__c",
    "Bonus__c",
    "TotalPay__c",
    "EntryDate__c",
    "SourceFile__c",
    "LineNumber__c",
];

pub fn external_id_field(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Person => PERSON_EXTERNAL_ID_FIELD,
        RecordKind::Salary => SALARY_EXTERNAL_ID_FIELD,
    }
}

/// Column header for a batch; `RecordTypeId` leads only when configured
pub fn header(kind: RecordKind, with_record_type: bool) -> Vec<&'static str> {
    match kind {
        RecordKind::Person => {
            let mut fields = Vec::with_capacity(PERSON_FIELDS.len() + 1);
            if with_record_type {
                fields.push("RecordTypeId");
            }
            fields.extend(PERSON_FIELDS);
            fields
        }
        RecordKind::Salary => SALARY_FIELDS.to_vec(),
    }
}

fn person_fields(p: &PersonPayload) -> Vec<String> {
    let mut fields = Vec::with_capacity(4);
    if let Some(record_type) = &p.record_type_id {
        fields.push(record_type.clone());
    }
    fields.push(p.first_name.clone());
    fields.push(p.last_name.clone());
    fields.push(p.natural_key.as_str().to_string());
    fields
}

fn salary_fields(s: &SalaryPayload) -> Vec<String> {
    let amount = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_default();
    vec![
        s.key.as_str().to_string(),
        s.person_remote_id.clone(),
        s.title.clone().unwrap_or_default(),
        s.employer.clone().unwrap_or_default(),
        amount(s.salary),
        amount(s.bonus),
        amount(s.total_pay),
        s.effective_date.format("%Y-%m-%d").to_string(),
        s.source_file.clone().unwrap_or_default(),
        s.line_number.map(|n| n.to_string()).unwrap_or_default(),
    ]
}

fn fields(record: &OutboundRecord) -> Vec<String> {
    match record {
        OutboundRecord::Person(p) => person_fields(p),
        OutboundRecord::Salary(s) => salary_fields(s),
    }
}

fn encode_rows<'a>(
    header: Option<&[&str]>,
    records: impl IntoIterator<Item = &'a OutboundRecord>,
) -> Result<Vec<u8>> {
    let mut writer = WriterBuilder::new()
        .terminator(Terminator::Any(b'\n'))
        .flexible(false)
        .from_writer(Vec::new());

    if let Some(header) = header {
        writer.write_record(header).map_err(encode_error)?;
    }
    for record in records {
        writer.write_record(fields(record)).map_err(encode_error)?;
    }

    writer
        .into_inner()
        .map_err(|e| SyncError::Rejected(format!("CSV encoding failed: {}", e)))
}

fn encode_error(e: csv::Error) -> SyncError {
    SyncError::Rejected(format!("CSV encoding failed: {}", e))
}

/// One record as a single CSV row, terminator included
pub fn encode_row(record: &OutboundRecord) -> Result<Vec<u8>> {
    encode_rows(None, std::iter::once(record))
}

/// Header plus rows for a homogeneous batch
pub fn encode_batch(kind: RecordKind, records: &[OutboundRecord]) -> Result<Vec<u8>> {
    if let Some(other) = records.iter().find(|r| r.kind() != kind) {
        return Err(SyncError::Rejected(format!(
            "{} record in a {} batch",
            other.kind(),
            kind
        )));
    }

    let with_record_type = records.iter().any(|r| match r {
        OutboundRecord::Person(p) => p.record_type_id.is_some(),
        OutboundRecord::Salary(_) => false,
    });

    encode_rows(Some(header(kind, with_record_type).as_slice()), records)
}
