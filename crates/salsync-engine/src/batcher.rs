//! Batcher
//!
//! Splits a record stream into homogeneous [`TransferBatch`]es bounded by a
//! record count and an encoded payload size. Input order is preserved and
//! every record lands in exactly one batch, or is yielded back as an
//! [`OversizedRecord`] when it cannot fit even on its own.

use salsync_common::types::RecordKind;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::record::OutboundRecord;

/// Room kept in each payload for the CSV header line
pub const HEADER_RESERVE_BYTES: usize = 1024;

pub const DEFAULT_MAX_RECORDS: usize = 10_000;

/// 100 MiB, the remote limit for one upload
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchLimits {
    pub max_records: usize,
    pub max_payload_bytes: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_records: DEFAULT_MAX_RECORDS,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl BatchLimits {
    fn row_budget(&self) -> usize {
        self.max_payload_bytes.saturating_sub(HEADER_RESERVE_BYTES)
    }
}

/// Records of one kind submitted together as one bulk job
#[derive(Debug, Clone, PartialEq)]
pub struct TransferBatch {
    /// `<kind>-<run id>-<seq>`
    pub id: String,
    pub kind: RecordKind,
    pub records: Vec<OutboundRecord>,
    /// Encoded size of the rows, header excluded
    pub payload_bytes: usize,
}

impl TransferBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// External-id values in batch order
    pub fn record_keys(&self) -> Vec<String> {
        self.records.iter().map(|r| r.key().to_string()).collect()
    }
}

/// A record whose own encoding exceeds the payload budget
#[derive(Debug, Clone, PartialEq)]
pub struct OversizedRecord {
    pub record: OutboundRecord,
    pub encoded_len: usize,
    pub budget: usize,
}

impl fmt::Display for OversizedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} record {} encodes to {} bytes, over the {} byte batch budget",
            self.record.kind(),
            self.record.key(),
            self.encoded_len,
            self.budget
        )
    }
}

#[derive(Debug, Clone)]
pub struct Batcher {
    limits: BatchLimits,
    run_id: String,
}

impl Batcher {
    pub fn new(limits: BatchLimits, run_id: impl Into<String>) -> Self {
        Self {
            limits,
            run_id: run_id.into(),
        }
    }

    pub fn limits(&self) -> BatchLimits {
        self.limits
    }

    /// Lazily batch `records`; sequence numbers start at 1 for each call
    pub fn batches<I>(&self, records: I) -> Batches<'_, I>
    where
        I: Iterator<Item = OutboundRecord>,
    {
        Batches {
            batcher: self,
            records,
            carry: None,
            pending: Vec::new(),
            pending_bytes: 0,
            seq: 0,
        }
    }
}

pub struct Batches<'b, I> {
    batcher: &'b Batcher,
    records: I,
    /// Record that closed the previous batch and opens the next
    carry: Option<(OutboundRecord, usize)>,
    pending: Vec<OutboundRecord>,
    pending_bytes: usize,
    seq: u64,
}

impl<I> Batches<'_, I> {
    /// Hand back the record source, e.g. to collect its counters
    pub fn into_inner(self) -> I {
        self.records
    }

    fn take_batch(&mut self) -> Option<TransferBatch> {
        let first = self.pending.first()?;
        let kind = first.kind();
        self.seq += 1;
        let batch = TransferBatch {
            id: format!("{}-{}-{}", kind, self.batcher.run_id, self.seq),
            kind,
            records: std::mem::take(&mut self.pending),
            payload_bytes: self.pending_bytes,
        };
        self.pending_bytes = 0;
        Some(batch)
    }
}

impl<I> Iterator for Batches<'_, I>
where
    I: Iterator<Item = OutboundRecord>,
{
    type Item = Result<TransferBatch, OversizedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let limits = self.batcher.limits;
        let budget = limits.row_budget();

        loop {
            let (record, len) = match self.carry.take() {
                Some(carried) => carried,
                None => match self.records.next() {
                    Some(record) => {
                        let len = record.encoded_len();
                        (record, len)
                    }
                    None => return self.take_batch().map(Ok),
                },
            };

            if len > budget {
                return Some(Err(OversizedRecord {
                    record,
                    encoded_len: len,
                    budget,
                }));
            }

            let kind_changed = self
                .pending
                .first()
                .is_some_and(|first| first.kind() != record.kind());
            let full = self.pending.len() >= limits.max_records
                || self.pending_bytes + len > budget;

            if !self.pending.is_empty() && (kind_changed || full) {
                self.carry = Some((record, len));
                return self.take_batch().map(Ok);
            }

            self.pending_bytes += len;
            self.pending.push(record);
        }
    }
}
