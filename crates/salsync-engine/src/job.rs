//! Per-job state machine
//!
//! One bulk job moves through `Submitting -> Polling -> Fetching -> Done`.
//! Each [`JobRunner::step`] performs exactly one remote call (plus any wait
//! before it) and returns the next phase, so a job can be resumed from
//! `Polling` after a restart or a credential refresh.

use salsync_common::types::TransferResult;
use salsync_common::SyncError;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::batcher::TransferBatch;
use crate::retry::{Clock, PollPolicy, RetryPolicy};
use crate::transfer::{BulkTransfer, Credential, JobHandle, JobStatus};

#[derive(Debug)]
pub enum JobPhase {
    Submitting { attempt: u32 },
    Polling {
        handle: JobHandle,
        polls: u32,
        started: Instant,
    },
    Fetching { handle: JobHandle, attempt: u32 },
    Done(JobOutcome),
}

/// How a job ended
#[derive(Debug)]
pub enum JobOutcome {
    /// Results fetched, one per submitted record
    Completed {
        handle: JobHandle,
        results: Vec<TransferResult>,
    },
    /// The batch is settled as failed; no record in it was applied
    FailedPermanent {
        handle: Option<JobHandle>,
        reason: SyncError,
    },
    /// The remote job exists but its outcome is unknown (poll timeout,
    /// results unavailable); it must be polled again by a later run
    Unsettled { handle: JobHandle, reason: SyncError },
    /// Credential rejected; resume from `Polling` when `handle` is set
    AuthExpired {
        handle: Option<JobHandle>,
        reason: SyncError,
    },
    /// The submission could not be recorded, so the job was not polled
    Abandoned { handle: JobHandle },
}

impl JobOutcome {
    pub fn handle(&self) -> Option<&JobHandle> {
        match self {
            JobOutcome::Completed { handle, .. }
            | JobOutcome::Unsettled { handle, .. }
            | JobOutcome::Abandoned { handle } => Some(handle),
            JobOutcome::FailedPermanent { handle, .. } | JobOutcome::AuthExpired { handle, .. } => {
                handle.as_ref()
            }
        }
    }
}

/// Drives jobs against a [`BulkTransfer`]
#[derive(Clone)]
pub struct JobRunner {
    transfer: Arc<dyn BulkTransfer>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    poll: PollPolicy,
}

impl JobRunner {
    pub fn new(
        transfer: Arc<dyn BulkTransfer>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        poll: PollPolicy,
    ) -> Self {
        Self {
            transfer,
            clock,
            retry,
            poll,
        }
    }

    /// Starting phase for a job that already exists remotely
    pub fn polling(&self, handle: JobHandle) -> JobPhase {
        JobPhase::Polling {
            handle,
            polls: 0,
            started: self.clock.now(),
        }
    }

    /// Advance one phase
    ///
    /// `batch` is only needed while `Submitting`; a recovered job has none.
    pub async fn step(
        &self,
        credential: &Credential,
        batch: Option<&TransferBatch>,
        phase: JobPhase,
    ) -> JobPhase {
        match phase {
            JobPhase::Submitting { attempt } => self.submit(credential, batch, attempt).await,
            JobPhase::Polling {
                handle,
                polls,
                started,
            } => self.poll_once(credential, handle, polls, started).await,
            JobPhase::Fetching { handle, attempt } => {
                self.fetch(credential, handle, attempt).await
            }
            done @ JobPhase::Done(_) => done,
        }
    }

    /// Run to completion
    ///
    /// `on_submit` is awaited once, right after the job is created and before
    /// the first poll; returning `false` abandons the job.
    pub async fn run<F, Fut>(
        &self,
        credential: &Credential,
        batch: Option<&TransferBatch>,
        mut phase: JobPhase,
        mut on_submit: F,
    ) -> JobOutcome
    where
        F: FnMut(JobHandle) -> Fut,
        Fut: Future<Output = bool>,
    {
        loop {
            let submitting = matches!(phase, JobPhase::Submitting { .. });
            phase = self.step(credential, batch, phase).await;
            match phase {
                JobPhase::Done(outcome) => return outcome,
                JobPhase::Polling { ref handle, .. } if submitting => {
                    if !on_submit(handle.clone()).await {
                        return JobOutcome::Abandoned {
                            handle: handle.clone(),
                        };
                    }
                }
                _ => {}
            }
        }
    }

    async fn submit(
        &self,
        credential: &Credential,
        batch: Option<&TransferBatch>,
        attempt: u32,
    ) -> JobPhase {
        let Some(batch) = batch else {
            return JobPhase::Done(JobOutcome::FailedPermanent {
                handle: None,
                reason: SyncError::submission("no batch payload to submit"),
            });
        };

        match self.transfer.submit(credential, batch).await {
            Ok(handle) => {
                debug!(batch_id = %batch.id, job_id = %handle.job_id, "Job submitted");
                self.polling(handle)
            }
            Err(e @ SyncError::AuthExpired(_)) => JobPhase::Done(JobOutcome::AuthExpired {
                handle: None,
                reason: e,
            }),
            Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                let delay = self.retry.backoff(attempt);
                warn!(
                    batch_id = %batch.id,
                    attempt,
                    delay_secs = delay.as_secs(),
                    error = %e,
                    "Submission failed, retrying"
                );
                self.clock.sleep(delay).await;
                JobPhase::Submitting {
                    attempt: attempt + 1,
                }
            }
            Err(e) => JobPhase::Done(JobOutcome::FailedPermanent {
                handle: None,
                reason: e,
            }),
        }
    }

    async fn poll_once(
        &self,
        credential: &Credential,
        handle: JobHandle,
        polls: u32,
        started: Instant,
    ) -> JobPhase {
        let timeout = self.poll.timeout();
        let elapsed = self.clock.now().saturating_duration_since(started);
        if elapsed >= timeout {
            return JobPhase::Done(JobOutcome::Unsettled {
                reason: SyncError::JobTimeout {
                    job_id: handle.job_id.clone(),
                    waited: elapsed,
                },
                handle,
            });
        }

        self.clock
            .sleep(self.poll.interval(polls).min(timeout - elapsed))
            .await;

        match self.transfer.poll(credential, &handle).await {
            Ok(JobStatus::Completed) => JobPhase::Fetching { handle, attempt: 1 },
            Ok(JobStatus::Failed { message }) => JobPhase::Done(JobOutcome::FailedPermanent {
                reason: SyncError::JobFailed {
                    job_id: handle.job_id.clone(),
                    message,
                },
                handle: Some(handle),
            }),
            Ok(JobStatus::Queued | JobStatus::InProgress) => JobPhase::Polling {
                handle,
                polls: polls + 1,
                started,
            },
            Err(e @ SyncError::AuthExpired(_)) => JobPhase::Done(JobOutcome::AuthExpired {
                handle: Some(handle),
                reason: e,
            }),
            Err(e) if e.is_retryable() => {
                warn!(job_id = %handle.job_id, error = %e, "Poll failed, will poll again");
                JobPhase::Polling {
                    handle,
                    polls: polls + 1,
                    started,
                }
            }
            Err(e) => JobPhase::Done(JobOutcome::FailedPermanent {
                handle: Some(handle),
                reason: e,
            }),
        }
    }

    async fn fetch(&self, credential: &Credential, handle: JobHandle, attempt: u32) -> JobPhase {
        match self.transfer.fetch_results(credential, &handle).await {
            Ok(results) => JobPhase::Done(JobOutcome::Completed { handle, results }),
            Err(e @ SyncError::AuthExpired(_)) => JobPhase::Done(JobOutcome::AuthExpired {
                handle: Some(handle),
                reason: e,
            }),
            Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                let delay = self.retry.backoff(attempt);
                warn!(
                    job_id = %handle.job_id,
                    attempt,
                    error = %e,
                    "Fetching results failed, retrying"
                );
                self.clock.sleep(delay).await;
                JobPhase::Fetching {
                    handle,
                    attempt: attempt + 1,
                }
            }
            Err(e) => JobPhase::Done(JobOutcome::Unsettled { handle, reason: e }),
        }
    }
}
