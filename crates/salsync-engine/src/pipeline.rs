//! Pipeline orchestrator
//!
//! One run, in order:
//!
//! 1. replay the ledger and seed the identity resolver;
//! 2. re-poll jobs an earlier run submitted but never reconciled;
//! 3. plan, batch and dispatch people, then drain the pool so every person
//!    result is reconciled;
//! 4. plan salaries against confirmed identities only, batch and dispatch;
//! 5. write the error report and return the [`SyncSummary`].
//!
//! Cancellation stops new dispatches; in-flight jobs are still drained and
//! reconciled. A fatal error (ledger, unrefreshable credential, source)
//! also drains before the run ends.

use chrono::{Local, Utc};
use salsync_common::logging::run_stamp;
use salsync_common::types::{NaturalKey, RecordKind, RecordOutcome, SalaryKey};
use salsync_common::Result;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::batcher::{Batcher, Batches, OversizedRecord};
use crate::config::SyncConfig;
use crate::dispatch::{Dispatcher, OnSettled, SettledBatch};
use crate::job::JobRunner;
use crate::ledger::{BatchStatus, ResultLedger};
use crate::record::OutboundRecord;
use crate::report::{FatalError, SyncIssue, SyncSummary};
use crate::resolver::IdentityResolver;
use crate::retry::{Clock, TokioClock};
use crate::source::RowStore;
use crate::transfer::{BulkTransfer, Credential, CredentialRefresher, NoRefresh};

/// Default directory for error reports, shared with run logs
pub const DEFAULT_REPORT_DIR: &str = "./logs";

pub struct Pipeline {
    config: SyncConfig,
    transfer: Arc<dyn BulkTransfer>,
    ledger: Arc<dyn ResultLedger>,
    credential: Credential,
    refresher: Arc<dyn CredentialRefresher>,
    clock: Arc<dyn Clock>,
    run_id: String,
    report_dir: PathBuf,
}

impl Pipeline {
    pub fn new(
        config: SyncConfig,
        transfer: Arc<dyn BulkTransfer>,
        ledger: Arc<dyn ResultLedger>,
        credential: Credential,
    ) -> Self {
        Self {
            config,
            transfer,
            ledger,
            credential,
            refresher: Arc::new(NoRefresh),
            clock: Arc::new(TokioClock),
            run_id: Uuid::new_v4().to_string(),
            report_dir: PathBuf::from(DEFAULT_REPORT_DIR),
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn CredentialRefresher>) -> Self {
        self.refresher = refresher;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.report_dir = dir.into();
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn report_dir(&self) -> &Path {
        &self.report_dir
    }

    /// Run the whole sync; never fails, errors end up in the summary
    pub async fn run<S: RowStore>(&self, source: &S, cancel: &CancellationToken) -> SyncSummary {
        let mut summary = SyncSummary::new(&self.run_id);
        info!(run_id = %self.run_id, "Starting sync run");

        if let Err(e) = self.execute(source, cancel, &mut summary).await {
            error!(run_id = %self.run_id, error = %e, "Sync run aborted");
            summary.fatal = Some(FatalError::from(&e));
        }

        summary.interrupted = cancel.is_cancelled();
        summary.finished_at = Some(Utc::now());

        let stamp = run_stamp(summary.started_at.with_timezone(&Local));
        match summary.write_error_report(&self.report_dir, &stamp) {
            Ok(path) => info!(path = %path.display(), "Wrote error report"),
            Err(e) => warn!(error = %e, "Could not write error report"),
        }

        info!(
            run_id = %self.run_id,
            succeeded = summary.succeeded(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            failed_batches = summary.failed_batches,
            interrupted = summary.interrupted,
            "Sync run finished"
        );
        summary
    }

    async fn execute<S: RowStore>(
        &self,
        source: &S,
        cancel: &CancellationToken,
        summary: &mut SyncSummary,
    ) -> Result<()> {
        self.config.validate()?;
        let state = self.ledger.replay().await?;
        info!(
            identities = state.identities.len(),
            salaries = state.succeeded_salaries.len(),
            orphans = state.orphans.len(),
            "Replayed ledger"
        );

        let mut resolver = IdentityResolver::seeded(
            state.identities(),
            self.config.remote.person_record_type_id.clone(),
        );
        let mut succeeded_salaries = state.succeeded_salaries;
        // Salaries created by recovered jobs, already tallied this run
        let mut settled_salaries: HashSet<SalaryKey> = HashSet::new();

        let runner = JobRunner::new(
            self.transfer.clone(),
            self.clock.clone(),
            self.config.retry,
            self.config.poll,
        );
        let mut dispatcher = Dispatcher::new(
            runner,
            self.ledger.clone(),
            self.refresher.clone(),
            self.credential.clone(),
            self.config.concurrency.max_in_flight,
            &self.run_id,
        );
        let batcher = Batcher::new(self.config.batch, &self.run_id);
        let page_size = self.config.source.page_size;

        // Orphans first: their results may confirm people or salaries
        if !state.orphans.is_empty() {
            let mut on_settled = |settled: &SettledBatch| {
                tally(settled, summary);
                settled_salaries.extend(apply_successes(
                    settled,
                    &mut resolver,
                    &mut succeeded_salaries,
                ));
            };
            let recovered = dispatcher.recover(state.orphans, &mut on_settled).await;
            let drained = dispatcher.drain(&mut on_settled).await;
            recovered?;
            drained?;
        }

        if cancel.is_cancelled() {
            info!("Cancelled before the person phase");
            return Ok(());
        }

        let plan = resolver.plan_people(source.people(page_size))?;
        summary.people.merge(&plan.counts);
        summary.issues.extend(plan.issues);
        info!(
            to_upload = plan.to_upload.len(),
            skipped = plan.counts.skipped,
            duplicates = plan.counts.duplicates,
            "Planned people"
        );
        if !plan.to_upload.is_empty() && self.config.remote.person_record_type_id.is_none() {
            warn!("No person record type id configured, accounts get the org default record type");
        }

        let mut oversized = Vec::new();
        let person_result = {
            let mut on_settled = |settled: &SettledBatch| {
                tally(settled, summary);
                apply_successes(settled, &mut resolver, &mut succeeded_salaries);
            };
            let mut batches = batcher.batches(plan.to_upload.into_iter());
            dispatch_all(
                &mut dispatcher,
                &mut batches,
                cancel,
                &mut on_settled,
                &mut oversized,
            )
            .await
        };
        record_oversized(summary, oversized);
        person_result?;

        if cancel.is_cancelled() {
            info!("Cancelled before the salary phase");
            return Ok(());
        }

        let mut oversized = Vec::new();
        let (salary_result, planned) = {
            let mut on_settled = |settled: &SettledBatch| tally(settled, summary);
            let planner = resolver.salaries(
                source.salaries(page_size),
                &succeeded_salaries,
                &settled_salaries,
            );
            let mut batches = batcher.batches(planner);
            let result = dispatch_all(
                &mut dispatcher,
                &mut batches,
                cancel,
                &mut on_settled,
                &mut oversized,
            )
            .await;
            (result, batches.into_inner().finish())
        };
        record_oversized(summary, oversized);
        salary_result?;

        let (counts, issues) = planned?;
        summary.salaries.merge(&counts);
        summary.issues.extend(issues);

        Ok(())
    }
}

/// Dispatch every batch, then drain the pool
///
/// Stops dispatching on cancellation or the first fatal error, but always
/// drains; returns the first fatal error.
async fn dispatch_all<I>(
    dispatcher: &mut Dispatcher,
    batches: &mut Batches<'_, I>,
    cancel: &CancellationToken,
    on_settled: &mut OnSettled<'_>,
    oversized: &mut Vec<OversizedRecord>,
) -> Result<()>
where
    I: Iterator<Item = OutboundRecord>,
{
    let mut outcome = Ok(());

    for item in batches.by_ref() {
        match item {
            Ok(batch) => {
                if cancel.is_cancelled() {
                    info!("Cancellation requested, no further batches will be dispatched");
                    break;
                }
                if let Err(e) = dispatcher.dispatch(batch, on_settled).await {
                    outcome = Err(e);
                    break;
                }
            }
            Err(record) => {
                warn!(error = %record, "Record exceeds batch payload budget");
                oversized.push(record);
            }
        }
    }

    let drained = dispatcher.drain(on_settled).await;
    match (outcome, drained) {
        (Err(e), Err(later)) => {
            error!(error = %later, "Further fatal error while draining");
            Err(e)
        }
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Ok(()), Ok(())) => Ok(()),
    }
}

/// Fold one settled batch into the summary
fn tally(settled: &SettledBatch, summary: &mut SyncSummary) {
    let reconciliation = &settled.reconciliation;
    let kind = reconciliation.kind;
    let batch_id = reconciliation.batch_id.as_str();

    if settled.recovered {
        summary.recovered_batches += 1;
    }

    match reconciliation.status {
        BatchStatus::Completed => {
            for result in &reconciliation.results {
                match &result.outcome {
                    RecordOutcome::Succeeded { .. } => summary.counts_mut(kind).created += 1,
                    RecordOutcome::Failed { code, message } => {
                        summary.counts_mut(kind).failed += 1;
                        summary.issues.push(
                            SyncIssue::new(kind, code.clone(), message.clone())
                                .with_key(result.key.clone())
                                .with_batch(batch_id),
                        );
                    }
                }
            }
        }
        // A recovered batch that failed is planned again from the source
        BatchStatus::FailedPermanent if settled.recovered => {
            let reason = reconciliation.reason.clone().unwrap_or_default();
            summary.issues.push(
                SyncIssue::new(
                    kind,
                    "recovered_batch_failed",
                    format!("Job from an earlier run did not complete: {}", reason),
                )
                .with_batch(batch_id),
            );
        }
        BatchStatus::FailedPermanent => {
            summary.failed_batches += 1;
            summary.counts_mut(kind).permanently_failed += reconciliation.record_keys.len();
            let issue = match &settled.error {
                Some(error) => SyncIssue::from_error(kind, error),
                None => SyncIssue::new(
                    kind,
                    "batch_failed",
                    reconciliation.reason.clone().unwrap_or_default(),
                ),
            };
            summary.issues.push(issue.with_batch(batch_id));
        }
    }
}

/// Feed succeeded results back into the resolver and the salary set
///
/// Returns the salary keys that were new to the set.
fn apply_successes(
    settled: &SettledBatch,
    resolver: &mut IdentityResolver,
    succeeded_salaries: &mut HashSet<SalaryKey>,
) -> Vec<SalaryKey> {
    let reconciliation = &settled.reconciliation;
    let mut added = Vec::new();
    for result in &reconciliation.results {
        let Some(remote_id) = result.outcome.remote_id() else {
            continue;
        };
        match reconciliation.kind {
            RecordKind::Person => {
                resolver.confirm(&NaturalKey::from_stored(result.key.clone()), remote_id);
            }
            RecordKind::Salary => {
                let key = SalaryKey::from_stored(result.key.clone());
                if succeeded_salaries.insert(key.clone()) {
                    added.push(key);
                }
            }
        }
    }
    added
}

fn record_oversized(summary: &mut SyncSummary, oversized: Vec<OversizedRecord>) {
    for record in oversized {
        let kind = record.record.kind();
        summary.counts_mut(kind).oversized += 1;
        summary.issues.push(
            SyncIssue::new(kind, "oversized_record", record.to_string())
                .with_key(record.record.key()),
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::ledger::BatchReconciliation;
    use crate::transfer::JobHandle;
    use salsync_common::types::TransferResult;

    fn handle(kind: RecordKind, keys: &[&str]) -> JobHandle {
        JobHandle {
            job_id: "750x".into(),
            batch_id: format!("{}-run-1", kind),
            kind,
            record_keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    fn settled(reconciliation: BatchReconciliation, recovered: bool) -> SettledBatch {
        SettledBatch {
            reconciliation,
            error: None,
            recovered,
            left_open: false,
        }
    }

    #[test]
    fn test_tally_counts_partial_batch_per_record() {
        let h = handle(RecordKind::Person, &["a||", "b||"]);
        let reconciliation = BatchReconciliation::completed(
            &h,
            vec![
                TransferResult {
                    position: 0,
                    key: "a||".into(),
                    outcome: RecordOutcome::Succeeded {
                        remote_id: "001A".into(),
                    },
                },
                TransferResult {
                    position: 1,
                    key: "b||".into(),
                    outcome: RecordOutcome::failed("REQUIRED_FIELD_MISSING", "LastName"),
                },
            ],
        );
        let settled = settled(reconciliation, false);

        let mut summary = SyncSummary::new("run");
        tally(&settled, &mut summary);
        assert_eq!(summary.people.created, 1);
        assert_eq!(summary.people.failed, 1);
        assert_eq!(summary.failed_batches, 0);
        assert_eq!(summary.issues[0].code, "REQUIRED_FIELD_MISSING");
        assert_eq!(summary.issues[0].key.as_deref(), Some("b||"));

        let mut resolver = IdentityResolver::new(None);
        let mut salaries = HashSet::new();
        apply_successes(&settled, &mut resolver, &mut salaries);
        assert_eq!(resolver.identity_of(&NaturalKey::from_stored("a||")), Some("001A"));
        assert_eq!(resolver.confirmed_count(), 1);
    }

    #[test]
    fn test_tally_failed_batches() {
        let reconciliation = BatchReconciliation::failed_permanent(
            "salary-run-1",
            RecordKind::Salary,
            None,
            vec!["k||@2020-01-01".into(), "k||@2021-01-01".into()],
            "timed out",
        );
        let mut summary = SyncSummary::new("run");
        tally(&settled(reconciliation.clone(), false), &mut summary);
        assert_eq!(summary.failed_batches, 1);
        assert_eq!(summary.salaries.permanently_failed, 2);
        assert!(summary.has_failures());

        let mut summary = SyncSummary::new("run");
        tally(&settled(reconciliation, true), &mut summary);
        assert_eq!(summary.failed_batches, 0);
        assert_eq!(summary.recovered_batches, 1);
        assert_eq!(summary.issues[0].code, "recovered_batch_failed");
    }
}
