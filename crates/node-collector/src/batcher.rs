// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Count- and time-triggered batching.
//!
//! The [`Batcher`] accumulates enriched records into the batch in progress and
//! releases it when either `max_records` is reached or `max_interval` has elapsed
//! since the first record of the batch arrived, whichever comes first. The
//! [`BatcherService`] owns the batcher on a single task, so releasing a batch and
//! starting the next one happen in the same step with respect to incoming records.
//!
//! Completed batches are handed to the bounded export queue. The service waits only
//! for room in that queue, never for an export to finish. On shutdown the partial
//! batch is flushed before the service ends.

use crate::admission::AdmissionController;
use crate::record::{Batch, Entry, Record};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error};

/// Upper bound on the records reserved up front for a batch in progress.
const MAX_PREALLOCATED_RECORDS: usize = 1024;

pub struct Batcher {
    max_records: usize,
    max_interval: Duration,
    records: Vec<Record>,
    bytes: usize,
    first_arrival: Option<Instant>,
    next_sequence: u64,
}

impl Batcher {
    pub fn new(max_records: usize, max_interval: Duration) -> Self {
        let max_records = max_records.max(1);
        Self {
            max_records,
            max_interval,
            records: Vec::with_capacity(max_records.min(MAX_PREALLOCATED_RECORDS)),
            bytes: 0,
            first_arrival: None,
            next_sequence: 0,
        }
    }

    /// Appends a record. Returns the completed batch when the count trigger fires.
    pub fn push(&mut self, entry: Entry) -> Option<Batch> {
        if self.records.is_empty() {
            self.first_arrival = Some(Instant::now());
        }
        self.records.push(entry.record);
        self.bytes += entry.bytes;
        if self.records.len() >= self.max_records {
            return self.take();
        }
        None
    }

    /// Releases the batch in progress, if any, and starts an empty one.
    pub fn take(&mut self) -> Option<Batch> {
        if self.records.is_empty() {
            return None;
        }
        let capacity = self.max_records.min(MAX_PREALLOCATED_RECORDS);
        let records = std::mem::replace(&mut self.records, Vec::with_capacity(capacity));
        let batch = Batch {
            sequence: self.next_sequence,
            records,
            estimated_bytes: std::mem::take(&mut self.bytes),
        };
        self.first_arrival = None;
        self.next_sequence += 1;
        Some(batch)
    }

    /// When the time trigger fires for the batch in progress.
    pub fn deadline(&self) -> Option<Instant> {
        self.first_arrival.map(|first| first + self.max_interval)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BatcherStatsSnapshot {
    pub batches_emitted: u64,
    pub records_emitted: u64,
    pub size_triggered: u64,
    pub time_triggered: u64,
    pub shutdown_flushes: u64,
}

#[derive(Debug, Default)]
pub struct BatcherStats {
    batches_emitted: AtomicU64,
    records_emitted: AtomicU64,
    size_triggered: AtomicU64,
    time_triggered: AtomicU64,
    shutdown_flushes: AtomicU64,
}

impl BatcherStats {
    pub fn snapshot(&self) -> BatcherStatsSnapshot {
        BatcherStatsSnapshot {
            batches_emitted: self.batches_emitted.load(Ordering::Relaxed),
            records_emitted: self.records_emitted.load(Ordering::Relaxed),
            size_triggered: self.size_triggered.load(Ordering::Relaxed),
            time_triggered: self.time_triggered.load(Ordering::Relaxed),
            shutdown_flushes: self.shutdown_flushes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Size,
    Time,
    Shutdown,
}

pub struct BatcherService {
    batcher: Batcher,
    rx: Receiver<Entry>,
    tx: Sender<Batch>,
    admission: Arc<AdmissionController>,
    stats: Arc<BatcherStats>,
}

impl BatcherService {
    pub fn new(
        batcher: Batcher,
        rx: Receiver<Entry>,
        tx: Sender<Batch>,
        admission: Arc<AdmissionController>,
        stats: Arc<BatcherStats>,
    ) -> Self {
        Self {
            batcher,
            rx,
            tx,
            admission,
            stats,
        }
    }

    pub async fn run(mut self) {
        debug!("BATCHER | Service started");

        loop {
            let deadline = self.batcher.deadline();
            tokio::select! {
                entry = self.rx.recv() => {
                    let Some(entry) = entry else {
                        if let Some(batch) = self.batcher.take() {
                            self.emit(batch, Trigger::Shutdown).await;
                        }
                        break;
                    };
                    if let Some(batch) = self.batcher.push(entry) {
                        if !self.emit(batch, Trigger::Size).await {
                            break;
                        }
                    }
                }
                _ = async {
                    match deadline {
                        Some(deadline) => sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    if let Some(batch) = self.batcher.take() {
                        if !self.emit(batch, Trigger::Time).await {
                            break;
                        }
                    }
                }
            }
        }

        debug!("BATCHER | Service stopped");
    }

    /// Hands a completed batch to the export queue, waiting for room if it is full.
    /// Returns false when the exporter is gone.
    async fn emit(&mut self, batch: Batch, trigger: Trigger) -> bool {
        let bytes = batch.estimated_bytes;
        let records = batch.len() as u64;
        debug!(
            "BATCHER | Releasing batch {} with {records} records ({trigger:?} trigger)",
            batch.sequence
        );

        let sent = self.tx.send(batch).await;
        // the batch has left the accounted stages either way
        self.admission.release(bytes);
        if sent.is_err() {
            error!("BATCHER | Export queue closed, {records} records dropped");
            return false;
        }

        self.stats.batches_emitted.fetch_add(1, Ordering::Relaxed);
        self.stats.records_emitted.fetch_add(records, Ordering::Relaxed);
        let counter = match trigger {
            Trigger::Size => &self.stats.size_triggered,
            Trigger::Time => &self.stats.time_triggered,
            Trigger::Shutdown => &self.stats.shutdown_flushes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        true
    }
}
