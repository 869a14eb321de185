use std::sync::Arc;

use indicatif::ProgressBar;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::SyncResult;
use crate::record::{FailureRecord, FailureTier, WriteMode};
use crate::remote::{RemoteStore, WriteOutcome};
use crate::scheduler::{Batch, BatchEntry};

pub const DEFAULT_MAX_CONSECUTIVE_FAILED_BATCHES: usize = 50;

#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub batch_index: usize,
    /// `(input row, internal key)` for every record the remote accepted.
    pub succeeded: Vec<(usize, i64)>,
    pub failures: Vec<FailureRecord>,
    /// Records that only went through on the record-by-record retry.
    pub rescued: usize,
}

impl BatchOutcome {
    pub fn success_count(&self) -> usize {
        self.succeeded.len()
    }

    /// Nothing in the batch made it, even one record at a time.
    pub fn is_failed_batch(&self) -> bool {
        self.succeeded.is_empty() && !self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PassOutcome {
    pub batches: usize,
    pub succeeded: Vec<(usize, i64)>,
    pub failures: Vec<FailureRecord>,
    pub rescued: usize,
    pub aborted: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub workers: usize,
    /// Stop scheduling after this many batches in a row fail outright.
    pub max_consecutive_failed_batches: Option<usize>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            max_consecutive_failed_batches: Some(DEFAULT_MAX_CONSECUTIVE_FAILED_BATCHES),
        }
    }
}

/// Writes batches of one pass.
#[derive(Clone)]
pub struct TransferExecutor {
    store: Arc<dyn RemoteStore>,
    model: Arc<str>,
    mode: WriteMode,
    pass: usize,
}

impl TransferExecutor {
    pub fn new(store: Arc<dyn RemoteStore>, model: &str, mode: WriteMode, pass: usize) -> Self {
        Self {
            store,
            model: Arc::from(model),
            mode,
            pass,
        }
    }

    /// Writes one batch: the whole batch in one call first, then record by
    /// record for whatever the batch call did not settle.
    pub async fn execute(&self, batch: Batch) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            batch_index: batch.index,
            ..Default::default()
        };

        let (sendable, unkeyed): (Vec<BatchEntry>, Vec<BatchEntry>) = batch
            .entries
            .into_iter()
            .partition(|entry| self.mode == WriteMode::Upsert || entry.record.has_key());
        for entry in unkeyed {
            outcome.failures.push(self.failure(entry, "record has no key to update".into()));
        }
        if sendable.is_empty() {
            return outcome;
        }

        let records: Vec<_> = sendable.iter().map(|e| e.record.clone()).collect();
        let retry = match self.store.bulk_write(&self.model, &records, self.mode).await {
            Ok(results) if results.len() == sendable.len() => {
                let mut retry = Vec::new();
                for (entry, result) in sendable.into_iter().zip(results) {
                    match result {
                        WriteOutcome::Written(id) => outcome.succeeded.push((entry.row, id)),
                        WriteOutcome::Rejected(reason) => {
                            debug!(model = %self.model, row = entry.row, %reason, "record rejected in batch");
                            retry.push(entry);
                        }
                    }
                }
                retry
            }
            Ok(results) => {
                warn!(
                    model = %self.model,
                    batch = batch.index,
                    expected = sendable.len(),
                    got = results.len(),
                    "batch write returned a mismatched result count, retrying record by record"
                );
                sendable
            }
            Err(err) => {
                warn!(
                    model = %self.model,
                    batch = batch.index,
                    records = sendable.len(),
                    error = %err,
                    "batch write failed, retrying record by record"
                );
                sendable
            }
        };

        for entry in retry {
            match self.store.single_write(&self.model, &entry.record, self.mode).await {
                Ok(id) => {
                    outcome.succeeded.push((entry.row, id));
                    outcome.rescued += 1;
                }
                Err(err) => {
                    let reason = err.reason();
                    outcome.failures.push(self.failure(entry, reason));
                }
            }
        }
        outcome
    }

    /// Runs every batch on at most `options.workers` concurrent tasks.
    ///
    /// A batch stays on the task that picked it up until it is done. Outcomes
    /// are gathered in completion order.
    pub async fn run_batches(
        &self,
        batches: Vec<Batch>,
        options: PoolOptions,
        progress: &ProgressBar,
    ) -> SyncResult<PassOutcome> {
        let worker_count = options.workers.max(1);
        let mut pass = PassOutcome {
            batches: batches.len(),
            ..Default::default()
        };
        let mut queue = batches.into_iter();
        let mut join_set: JoinSet<BatchOutcome> = JoinSet::new();
        let mut consecutive_failed = 0usize;

        loop {
            while pass.aborted.is_none() && join_set.len() < worker_count {
                let Some(batch) = queue.next() else {
                    break;
                };
                let executor = self.clone();
                join_set.spawn(async move { executor.execute(batch).await });
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            let outcome = joined?;
            progress.inc((outcome.succeeded.len() + outcome.failures.len()) as u64);

            if outcome.is_failed_batch() {
                consecutive_failed += 1;
            } else {
                consecutive_failed = 0;
            }
            if pass.aborted.is_none() {
                if let Some(limit) = options.max_consecutive_failed_batches {
                    if consecutive_failed >= limit {
                        let message = format!(
                            "aborted pass {} of {} after {consecutive_failed} consecutive failed batches",
                            self.pass + 1,
                            self.model
                        );
                        warn!("{message}");
                        pass.aborted = Some(message);
                    }
                }
            }

            pass.rescued += outcome.rescued;
            pass.succeeded.extend(outcome.succeeded);
            pass.failures.extend(outcome.failures);
        }

        if let Some(reason) = &pass.aborted {
            for batch in queue {
                for entry in batch.entries {
                    pass.failures.push(FailureRecord {
                        row: entry.row,
                        record: entry.record,
                        reason: reason.clone(),
                        tier: FailureTier::Batch,
                        pass: self.pass,
                    });
                }
            }
        }
        Ok(pass)
    }

    fn failure(&self, entry: BatchEntry, reason: String) -> FailureRecord {
        FailureRecord {
            row: entry.row,
            record: entry.record,
            reason,
            tier: FailureTier::Record,
            pass: self.pass,
        }
    }
}
