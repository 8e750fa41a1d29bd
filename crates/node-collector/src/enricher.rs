// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metadata enrichment stage.
//!
//! Admitted batches are split by [`ResourceIdentity`] across a fixed set of workers,
//! so every identity is always handled by the same worker and its records keep their
//! arrival order. Each worker joins records against the [`MetadataCache`] snapshot,
//! stamps the static attributes and forwards the record to the batcher.

use crate::constants::{
    CONTAINER_NAME_ATTRIBUTE, NODE_NAME_ATTRIBUTE, POD_LABEL_PREFIX, POD_NAME_ATTRIBUTE,
};
use crate::intake::AdmittedBatch;
use crate::metadata::MetadataCache;
use crate::record::{AttributeValue, Entry, Record, ResourceIdentity};
use crate::stamper::StaticAttributes;
use fnv::FnvHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{Receiver, Sender};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct EnricherStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub passthrough: u64,
}

#[derive(Debug, Default)]
struct EnricherStats {
    hits: AtomicU64,
    misses: AtomicU64,
    passthrough: AtomicU64,
}

pub struct Enricher {
    cache: MetadataCache,
    static_attributes: StaticAttributes,
    stats: EnricherStats,
}

impl Enricher {
    pub fn new(cache: MetadataCache, static_attributes: StaticAttributes) -> Self {
        Self {
            cache,
            static_attributes,
            stats: EnricherStats::default(),
        }
    }

    /// Attaches cached workload metadata to `record`.
    ///
    /// Records without an identity pass through untouched, and a cache miss leaves
    /// the record as it is; neither waits for the cache to be populated. Under
    /// pressure, optional workload labels are not applied.
    pub fn enrich(&self, mut record: Record, under_pressure: bool) -> Record {
        let Some(identity) = record.resource.clone() else {
            self.stats.passthrough.fetch_add(1, Ordering::Relaxed);
            return record;
        };
        let Some(cached) = self.cache.lookup(&identity) else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            trace!("ENRICH | No metadata cached for {identity}");
            return record;
        };
        self.stats.hits.fetch_add(1, Ordering::Relaxed);

        record.insert_attribute(NODE_NAME_ATTRIBUTE, &AttributeValue::from(identity.node.as_str()));
        record.insert_attribute(POD_NAME_ATTRIBUTE, &AttributeValue::from(identity.pod.as_str()));
        record.insert_attribute(
            CONTAINER_NAME_ATTRIBUTE,
            &AttributeValue::from(identity.container.as_str()),
        );
        for (key, value) in &cached.entry.attributes {
            record.insert_attribute(key, value);
        }
        if !under_pressure {
            for (key, value) in &cached.entry.labels {
                record.insert_attribute(
                    &format!("{POD_LABEL_PREFIX}{key}"),
                    &AttributeValue::from(value.as_str()),
                );
            }
        }
        record
    }

    /// Full per-record processing of the stage: enrichment, then static attributes.
    pub fn process(&self, record: Record, under_pressure: bool) -> Record {
        let mut record = self.enrich(record, under_pressure);
        self.static_attributes.stamp(&mut record);
        record
    }

    pub fn stats(&self) -> EnricherStatsSnapshot {
        EnricherStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            passthrough: self.stats.passthrough.load(Ordering::Relaxed),
        }
    }
}

/// Worker a record is routed to. Records without identity all go to worker 0.
pub fn worker_index(identity: Option<&ResourceIdentity>, workers: usize) -> usize {
    match identity {
        Some(identity) if workers > 1 => {
            let mut hasher = FnvHasher::default();
            identity.hash(&mut hasher);
            usize::try_from(hasher.finish() % workers as u64).unwrap_or(0)
        }
        _ => 0,
    }
}

/// Splits admitted batches across the worker queues. Ends when the intake queue is
/// closed, which in turn closes every worker queue.
pub async fn run_dispatcher(mut rx: Receiver<AdmittedBatch>, workers: Vec<Sender<AdmittedBatch>>) {
    let n = workers.len().max(1);
    while let Some(batch) = rx.recv().await {
        let mut shards: Vec<Vec<Entry>> = (0..n).map(|_| Vec::new()).collect();
        for entry in batch.entries {
            shards[worker_index(entry.record.resource.as_ref(), n)].push(entry);
        }
        for (worker, entries) in workers.iter().zip(shards) {
            if entries.is_empty() {
                continue;
            }
            let shard = AdmittedBatch {
                entries,
                under_pressure: batch.under_pressure,
            };
            if worker.send(shard).await.is_err() {
                debug!("ENRICH | Worker queue closed, dispatcher stopping");
                return;
            }
        }
    }
    debug!("ENRICH | Intake queue closed, dispatcher stopped");
}

pub async fn run_worker(
    id: usize,
    enricher: Arc<Enricher>,
    mut rx: Receiver<AdmittedBatch>,
    tx: Sender<Entry>,
) {
    while let Some(batch) = rx.recv().await {
        for entry in batch.entries {
            let record = enricher.process(entry.record, batch.under_pressure);
            if tx
                .send(Entry {
                    record,
                    bytes: entry.bytes,
                })
                .await
                .is_err()
            {
                debug!("ENRICH | Batcher queue closed, worker {id} stopping");
                return;
            }
        }
    }
    debug!("ENRICH | Worker {id} stopped");
}
