// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of completed batches to the configured backends.
//!
//! ```text
//!   export queue ──▶ [permit] ──▶ delivery task ──┬──▶ backend A (retry/backoff)
//!                                                 └──▶ backend B (retry/backoff)
//! ```
//!
//! A fan-out permit is acquired before a batch is dequeued, so when every permit is
//! taken the queue fills up and the batcher blocks on it. Each backend gets every
//! batch and retries on its own; a failing backend never holds back the others
//! beyond the permit it occupies.

use crate::backend::{Backend, ExportOutcome};
use crate::record::Batch;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retry_max: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (starting at 1).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExportStatsSnapshot {
    /// Batches accepted by at least one backend.
    pub delivered_batches: u64,
    pub delivered_records: u64,
    /// Records of batches no backend accepted.
    pub dropped_records: u64,
    /// Transient failed attempts, across backends.
    pub transient_failures: u64,
    pub retries_exhausted: u64,
    /// Permanent refusals, across backends.
    pub rejected: u64,
}

#[derive(Debug, Default)]
pub struct ExportStats {
    delivered_batches: AtomicU64,
    delivered_records: AtomicU64,
    dropped_records: AtomicU64,
    transient_failures: AtomicU64,
    retries_exhausted: AtomicU64,
    rejected: AtomicU64,
}

impl ExportStats {
    pub fn snapshot(&self) -> ExportStatsSnapshot {
        ExportStatsSnapshot {
            delivered_batches: self.delivered_batches.load(Ordering::Relaxed),
            delivered_records: self.delivered_records.load(Ordering::Relaxed),
            dropped_records: self.dropped_records.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

pub struct ExporterService {
    rx: Receiver<Batch>,
    backends: Vec<Arc<dyn Backend>>,
    policy: RetryPolicy,
    fanout_limit: usize,
    stats: Arc<ExportStats>,
    abort: CancellationToken,
}

impl ExporterService {
    pub fn new(
        rx: Receiver<Batch>,
        backends: Vec<Arc<dyn Backend>>,
        policy: RetryPolicy,
        fanout_limit: usize,
        stats: Arc<ExportStats>,
        abort: CancellationToken,
    ) -> Self {
        Self {
            rx,
            backends,
            policy,
            fanout_limit: fanout_limit.max(1),
            stats,
            abort,
        }
    }

    /// Runs until the export queue is closed and every in-flight delivery is done.
    pub async fn run(mut self) {
        debug!(
            "EXPORT | Service started with {} backends, fan-out {}",
            self.backends.len(),
            self.fanout_limit
        );
        let semaphore = Arc::new(Semaphore::new(self.fanout_limit));
        let mut in_flight = JoinSet::new();

        loop {
            let permit = tokio::select! {
                biased;
                Some(joined) = in_flight.join_next() => {
                    if let Err(e) = joined {
                        error!("EXPORT | Delivery task failed: {e}");
                    }
                    continue;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let Some(batch) = self.rx.recv().await else {
                break;
            };

            let backends = self.backends.clone();
            let stats = Arc::clone(&self.stats);
            let abort = self.abort.clone();
            let policy = self.policy;
            in_flight.spawn(async move {
                deliver_batch(Arc::new(batch), backends, policy, stats, abort).await;
                drop(permit);
            });
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("EXPORT | Delivery task failed: {e}");
            }
        }
        debug!("EXPORT | Service stopped");
    }
}

/// Delivers one batch to every backend and settles its records once all of them
/// are done.
pub async fn deliver_batch(
    batch: Arc<Batch>,
    backends: Vec<Arc<dyn Backend>>,
    policy: RetryPolicy,
    stats: Arc<ExportStats>,
    abort: CancellationToken,
) {
    let mut deliveries = JoinSet::new();
    for backend in backends {
        deliveries.spawn(deliver(
            backend,
            Arc::clone(&batch),
            policy,
            Arc::clone(&stats),
            abort.clone(),
        ));
    }

    let mut delivered = false;
    while let Some(joined) = deliveries.join_next().await {
        delivered |= joined.unwrap_or(false);
    }

    let records = batch.len() as u64;
    if delivered {
        stats.delivered_batches.fetch_add(1, Ordering::Relaxed);
        stats.delivered_records.fetch_add(records, Ordering::Relaxed);
    } else {
        stats.dropped_records.fetch_add(records, Ordering::Relaxed);
    }
}

/// Delivers a batch to a single backend, retrying transient failures. Returns
/// whether the backend accepted it.
async fn deliver(
    backend: Arc<dyn Backend>,
    batch: Arc<Batch>,
    policy: RetryPolicy,
    stats: Arc<ExportStats>,
    abort: CancellationToken,
) -> bool {
    let mut retries = 0;
    loop {
        match backend.send(&batch).await {
            ExportOutcome::Success => {
                debug!(
                    "EXPORT | Delivered batch {} ({} records) to {}",
                    batch.sequence,
                    batch.len(),
                    backend.name()
                );
                return true;
            }
            ExportOutcome::Permanent(reason) => {
                stats.rejected.fetch_add(1, Ordering::Relaxed);
                error!(
                    "EXPORT | {} refused batch {}, dropping {} records: {reason}",
                    backend.name(),
                    batch.sequence,
                    batch.len()
                );
                return false;
            }
            ExportOutcome::Transient(reason) => {
                stats.transient_failures.fetch_add(1, Ordering::Relaxed);
                if retries >= policy.retry_max {
                    stats.retries_exhausted.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "EXPORT | Giving up on batch {} for {} after {} attempts: {reason}",
                        batch.sequence,
                        backend.name(),
                        retries + 1
                    );
                    return false;
                }
                retries += 1;
                let delay = policy.backoff(retries);
                warn!(
                    "EXPORT | Attempt {retries} of batch {} to {} failed, retrying in {delay:?}: {reason}",
                    batch.sequence,
                    backend.name()
                );
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = abort.cancelled() => {
                        debug!(
                            "EXPORT | Abandoning batch {} for {}",
                            batch.sequence,
                            backend.name()
                        );
                        return false;
                    }
                }
            }
        }
    }
}
