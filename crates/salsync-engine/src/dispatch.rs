//! Bounded pool of in-flight bulk jobs
//!
//! The dispatcher spawns one task per batch on a [`JoinSet`], never more than
//! `max_in_flight` at a time. Tasks only talk to the remote store; every
//! ledger write happens here, on the caller's task:
//!
//! - a task reports its new job through a channel and waits for the
//!   `job_submitted` entry to be committed before it polls;
//! - a finished task is reconciled (all outcomes plus the `batch_reconciled`
//!   marker) before its result is handed to the caller.
//!
//! `AuthExpired` from any task pauses nothing else; the dispatcher asks the
//! [`CredentialRefresher`] once per credential generation and restarts the
//! affected job with the new credential.

use salsync_common::types::RecordKind;
use salsync_common::{Result, SyncError};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::batcher::TransferBatch;
use crate::job::{JobOutcome, JobPhase, JobRunner};
use crate::ledger::{BatchReconciliation, ResultLedger};
use crate::transfer::{Credential, CredentialRefresher, JobHandle};

/// Credential refreshes a single job may trigger before the run gives up
pub const MAX_REFRESHES_PER_JOB: u32 = 2;

/// A batch the dispatcher is done with
#[derive(Debug)]
pub struct SettledBatch {
    pub reconciliation: BatchReconciliation,
    /// Why the batch failed, when it did
    pub error: Option<SyncError>,
    /// Started from a `job_submitted` entry of an earlier run
    pub recovered: bool,
    /// Not written to the ledger; a later run polls the job again
    pub left_open: bool,
}

/// Callback receiving each settled batch, in completion order
pub type OnSettled<'a> = dyn FnMut(&SettledBatch) + 'a;

enum JobEvent {
    Submitted {
        handle: JobHandle,
        ack: oneshot::Sender<bool>,
    },
}

struct JobReport {
    batch_id: String,
    kind: RecordKind,
    record_keys: Vec<String>,
    batch: Option<TransferBatch>,
    recovered: bool,
    generation: u64,
    refreshes: u32,
    outcome: JobOutcome,
}

pub struct Dispatcher {
    runner: JobRunner,
    ledger: Arc<dyn ResultLedger>,
    refresher: Arc<dyn CredentialRefresher>,
    credential: Credential,
    /// Bumped on every successful refresh
    generation: u64,
    max_in_flight: usize,
    run_id: String,
    tasks: JoinSet<JobReport>,
    events_tx: mpsc::Sender<JobEvent>,
    events_rx: mpsc::Receiver<JobEvent>,
    halted: bool,
}

impl Dispatcher {
    pub fn new(
        runner: JobRunner,
        ledger: Arc<dyn ResultLedger>,
        refresher: Arc<dyn CredentialRefresher>,
        credential: Credential,
        max_in_flight: usize,
        run_id: impl Into<String>,
    ) -> Self {
        let max_in_flight = max_in_flight.max(1);
        let (events_tx, events_rx) = mpsc::channel(max_in_flight * 2);
        Self {
            runner,
            ledger,
            refresher,
            credential,
            generation: 0,
            max_in_flight,
            run_id: run_id.into(),
            tasks: JoinSet::new(),
            events_tx,
            events_rx,
            halted: false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Credential currently in use (refreshed ones included)
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Whether a fatal error stopped the dispatcher
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Submit a batch once a slot is free
    ///
    /// Batches settled while waiting for the slot are passed to
    /// `on_settled`. Returns the first fatal error; the dispatcher then
    /// accepts no more batches but can still be drained.
    pub async fn dispatch(
        &mut self,
        batch: TransferBatch,
        on_settled: &mut OnSettled<'_>,
    ) -> Result<()> {
        if self.halted {
            warn!(batch_id = %batch.id, "Dispatcher halted, batch not submitted");
            return Ok(());
        }
        self.record_pending_submissions().await?;
        while self.tasks.len() >= self.max_in_flight {
            self.reap_one(on_settled).await?;
        }

        info!(
            batch_id = %batch.id,
            kind = %batch.kind,
            records = batch.len(),
            "Dispatching batch"
        );
        let start = JobPhase::Submitting { attempt: 1 };
        self.spawn(
            batch.id.clone(),
            batch.kind,
            batch.record_keys(),
            Some(batch),
            false,
            0,
            start,
        );
        Ok(())
    }

    /// Resume jobs left unreconciled by an earlier run, oldest first
    pub async fn recover(
        &mut self,
        orphans: Vec<JobHandle>,
        on_settled: &mut OnSettled<'_>,
    ) -> Result<()> {
        for handle in orphans {
            if self.halted {
                break;
            }
            while self.tasks.len() >= self.max_in_flight {
                self.reap_one(on_settled).await?;
            }
            info!(
                batch_id = %handle.batch_id,
                job_id = %handle.job_id,
                "Re-polling job from an earlier run"
            );
            let start = self.runner.polling(handle.clone());
            self.spawn(
                handle.batch_id.clone(),
                handle.kind,
                handle.record_keys.clone(),
                None,
                true,
                0,
                start,
            );
        }
        Ok(())
    }

    /// Wait for every in-flight job
    ///
    /// Keeps reaping after a fatal error so running jobs are still recorded;
    /// returns the first fatal error seen.
    pub async fn drain(&mut self, on_settled: &mut OnSettled<'_>) -> Result<()> {
        let mut first_error = None;
        while !self.tasks.is_empty() {
            if let Err(e) = self.reap_one(on_settled).await {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    error!(error = %e, "Further fatal error while draining");
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn(
        &mut self,
        batch_id: String,
        kind: RecordKind,
        record_keys: Vec<String>,
        batch: Option<TransferBatch>,
        recovered: bool,
        refreshes: u32,
        start: JobPhase,
    ) {
        let runner = self.runner.clone();
        let credential = self.credential.clone();
        let events = self.events_tx.clone();
        let generation = self.generation;

        self.tasks.spawn(async move {
            let outcome = runner
                .run(&credential, batch.as_ref(), start, |handle| {
                    let events = events.clone();
                    async move {
                        let (ack, acked) = oneshot::channel();
                        if events
                            .send(JobEvent::Submitted { handle, ack })
                            .await
                            .is_err()
                        {
                            return false;
                        }
                        acked.await.unwrap_or(false)
                    }
                })
                .await;

            JobReport {
                batch_id,
                kind,
                record_keys,
                batch,
                recovered,
                generation,
                refreshes,
                outcome,
            }
        });
    }

    /// Commit submissions reported so far without waiting
    async fn record_pending_submissions(&mut self) -> Result<()> {
        while let Ok(event) = self.events_rx.try_recv() {
            self.on_event(event).await?;
        }
        Ok(())
    }

    async fn on_event(&mut self, event: JobEvent) -> Result<()> {
        match event {
            JobEvent::Submitted { handle, ack } => {
                match self.ledger.record_submission(&self.run_id, &handle).await {
                    Ok(()) => {
                        let _ = ack.send(true);
                        Ok(())
                    }
                    Err(e) => {
                        let _ = ack.send(false);
                        self.halted = true;
                        error!(
                            batch_id = %handle.batch_id,
                            job_id = %handle.job_id,
                            error = %e,
                            "Could not record job submission"
                        );
                        Err(e)
                    }
                }
            }
        }
    }

    /// Handle the next event or finished job; callers ensure a task exists
    async fn reap_one(&mut self, on_settled: &mut OnSettled<'_>) -> Result<()> {
        tokio::select! {
            biased;
            Some(event) = self.events_rx.recv() => self.on_event(event).await,
            Some(joined) = self.tasks.join_next() => match joined {
                Ok(report) => self.on_report(report, on_settled).await,
                Err(e) => {
                    self.halted = true;
                    Err(SyncError::submission(format!("job task failed: {}", e)))
                }
            },
            else => Ok(()),
        }
    }

    async fn on_report(
        &mut self,
        report: JobReport,
        on_settled: &mut OnSettled<'_>,
    ) -> Result<()> {
        let JobReport {
            batch_id,
            kind,
            record_keys,
            batch,
            recovered,
            generation,
            refreshes,
            outcome,
        } = report;

        let (reconciliation, error, left_open) = match outcome {
            JobOutcome::Completed { handle, results } => {
                (BatchReconciliation::completed(&handle, results), None, false)
            }
            JobOutcome::FailedPermanent { handle, reason } => {
                warn!(batch_id = %batch_id, error = %reason, "Batch failed permanently");
                let reconciliation = BatchReconciliation::failed_permanent(
                    batch_id,
                    kind,
                    handle.map(|h| h.job_id),
                    record_keys,
                    reason.to_string(),
                );
                (reconciliation, Some(reason), false)
            }
            // A job from this run stays open so the next run re-polls it; a
            // recovered one had its second chance and is settled as failed
            JobOutcome::Unsettled { handle, reason } => {
                warn!(
                    batch_id = %batch_id,
                    job_id = %handle.job_id,
                    recovered,
                    error = %reason,
                    "Job outcome unknown"
                );
                let reconciliation = BatchReconciliation::failed_permanent(
                    batch_id,
                    kind,
                    Some(handle.job_id),
                    record_keys,
                    reason.to_string(),
                );
                (reconciliation, Some(reason), !recovered)
            }
            JobOutcome::Abandoned { handle } => {
                debug!(batch_id = %handle.batch_id, "Job abandoned after ledger failure");
                return Ok(());
            }
            JobOutcome::AuthExpired { handle, reason } => {
                return self
                    .on_auth_expired(
                        batch_id,
                        kind,
                        record_keys,
                        batch,
                        recovered,
                        generation,
                        refreshes,
                        handle,
                        reason,
                    )
                    .await;
            }
        };

        if !left_open {
            if let Err(e) = self.ledger.reconcile_batch(&self.run_id, &reconciliation).await {
                self.halted = true;
                error!(
                    batch_id = %reconciliation.batch_id,
                    error = %e,
                    "Could not reconcile batch"
                );
                return Err(e);
            }
        }

        on_settled(&SettledBatch {
            reconciliation,
            error,
            recovered,
            left_open,
        });
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_auth_expired(
        &mut self,
        batch_id: String,
        kind: RecordKind,
        record_keys: Vec<String>,
        batch: Option<TransferBatch>,
        recovered: bool,
        generation: u64,
        refreshes: u32,
        handle: Option<JobHandle>,
        reason: SyncError,
    ) -> Result<()> {
        if self.halted {
            warn!(
                batch_id = %batch_id,
                "Credential expired after halt, job left for the next run"
            );
            return Ok(());
        }

        // Another job already refreshed since this one started
        if generation < self.generation {
            debug!(batch_id = %batch_id, "Restarting job with refreshed credential");
            self.restart(
                batch_id,
                kind,
                record_keys,
                batch,
                recovered,
                refreshes,
                handle,
            );
            return Ok(());
        }

        if refreshes >= MAX_REFRESHES_PER_JOB {
            self.halted = true;
            return Err(reason);
        }

        match self.refresher.refresh(&self.credential).await {
            Some(credential) => {
                info!(batch_id = %batch_id, "Credential refreshed");
                self.credential = credential;
                self.generation += 1;
                self.restart(
                    batch_id,
                    kind,
                    record_keys,
                    batch,
                    recovered,
                    refreshes + 1,
                    handle,
                );
                Ok(())
            }
            None => {
                self.halted = true;
                error!(
                    batch_id = %batch_id,
                    error = %reason,
                    "Credential expired and could not be refreshed"
                );
                Err(reason)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn restart(
        &mut self,
        batch_id: String,
        kind: RecordKind,
        record_keys: Vec<String>,
        batch: Option<TransferBatch>,
        recovered: bool,
        refreshes: u32,
        handle: Option<JobHandle>,
    ) {
        let start = match handle {
            Some(handle) => self.runner.polling(handle),
            None => JobPhase::Submitting { attempt: 1 },
        };
        self.spawn(batch_id, kind, record_keys, batch, recovered, refreshes, start);
    }
}
