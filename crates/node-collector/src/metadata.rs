// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Workload metadata cache fed by a background watch.
//!
//! The cache has exactly one writer, the watch task, and any number of readers (the
//! enrichment workers). The writer keeps the authoritative map and publishes an
//! immutable snapshot after every change:
//!
//! ```text
//!   MetadataSource ──events──> MetadataWriter ──publish──> ArcSwap<Snapshot>
//!                                    │                          │
//!                               tombstones,                 lookup() (lock-free)
//!                               idle eviction                   │
//!                                                          Enricher workers
//! ```
//!
//! Update delivery is at-least-once and may be reordered, so events are applied by
//! revision: an event never replaces state carrying the same or a newer revision.

use crate::record::{Attributes, ResourceIdentity};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cached attribute set for one workload identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    /// Core resource attributes, always applied on a cache hit.
    #[serde(default)]
    pub attributes: Attributes,
    /// Optional workload labels, skipped for batches admitted under pressure.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// One notification from the platform's metadata source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEvent {
    pub identity: ResourceIdentity,
    #[serde(default)]
    pub entry: MetadataEntry,
    pub revision: u64,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug)]
pub struct CachedEntry {
    pub entry: MetadataEntry,
    pub revision: u64,
    /// Milliseconds since the cache epoch of the last lookup (or insertion).
    last_lookup_ms: AtomicU64,
}

impl CachedEntry {
    fn touch(&self, now_ms: u64) {
        self.last_lookup_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    fn last_lookup_ms(&self) -> u64 {
        self.last_lookup_ms.load(Ordering::Relaxed)
    }
}

type Snapshot = HashMap<ResourceIdentity, Arc<CachedEntry>>;

fn millis_since(epoch: Instant, now: Instant) -> u64 {
    u64::try_from(now.saturating_duration_since(epoch).as_millis()).unwrap_or(u64::MAX)
}

/// Read side of the cache. Cheap to clone.
#[derive(Clone)]
pub struct MetadataCache {
    snapshot: Arc<ArcSwap<Snapshot>>,
    epoch: Instant,
}

impl MetadataCache {
    /// Creates an empty cache and the single writer allowed to modify it.
    pub fn new(ttl: Duration) -> (MetadataCache, MetadataWriter) {
        let snapshot = Arc::new(ArcSwap::from_pointee(Snapshot::new()));
        let epoch = Instant::now();
        let cache = MetadataCache {
            snapshot: Arc::clone(&snapshot),
            epoch,
        };
        let writer = MetadataWriter {
            snapshot,
            epoch,
            ttl,
            entries: Snapshot::new(),
            tombstones: HashMap::new(),
        };
        (cache, writer)
    }

    /// Non-blocking lookup against the current snapshot. A hit refreshes the entry's
    /// idle timer.
    pub fn lookup(&self, identity: &ResourceIdentity) -> Option<Arc<CachedEntry>> {
        let snapshot = self.snapshot.load();
        let entry = snapshot.get(identity)?;
        entry.touch(millis_since(self.epoch, Instant::now()));
        Some(Arc::clone(entry))
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Tombstone {
    revision: u64,
    deleted_at_ms: u64,
}

/// Write side of the cache, owned by the watch task.
pub struct MetadataWriter {
    snapshot: Arc<ArcSwap<Snapshot>>,
    epoch: Instant,
    ttl: Duration,
    entries: Snapshot,
    tombstones: HashMap<ResourceIdentity, Tombstone>,
}

impl MetadataWriter {
    /// Applies one event to the authoritative map. Returns whether anything changed.
    /// Nothing becomes visible to readers until [`MetadataWriter::publish`].
    pub fn apply(&mut self, event: MetadataEvent) -> bool {
        let known_revision = self
            .entries
            .get(&event.identity)
            .map(|e| e.revision)
            .or_else(|| self.tombstones.get(&event.identity).map(|t| t.revision));
        if known_revision == Some(event.revision) {
            // repeated listing of a revision already held
            return false;
        }
        if known_revision.is_some_and(|known| event.revision < known) {
            debug!(
                "METADATA | Ignoring stale event for {} (revision {} < {:?})",
                event.identity, event.revision, known_revision
            );
            return false;
        }

        let now_ms = millis_since(self.epoch, Instant::now());
        if event.deleted {
            self.entries.remove(&event.identity);
            self.tombstones.insert(
                event.identity,
                Tombstone {
                    revision: event.revision,
                    deleted_at_ms: now_ms,
                },
            );
        } else {
            self.tombstones.remove(&event.identity);
            self.entries.insert(
                event.identity,
                Arc::new(CachedEntry {
                    entry: event.entry,
                    revision: event.revision,
                    last_lookup_ms: AtomicU64::new(now_ms),
                }),
            );
        }
        true
    }

    /// Drops entries idle for longer than the TTL, and tombstones older than it.
    /// Returns the number of evicted entries.
    pub fn evict_idle(&mut self) -> usize {
        let ttl_ms = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX);
        let now_ms = millis_since(self.epoch, Instant::now());
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now_ms.saturating_sub(e.last_lookup_ms()) <= ttl_ms);
        self.tombstones
            .retain(|_, t| now_ms.saturating_sub(t.deleted_at_ms) <= ttl_ms);
        before - self.entries.len()
    }

    /// Makes the current map visible to readers.
    pub fn publish(&self) {
        self.snapshot.store(Arc::new(self.entries.clone()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Owns the writer: applies incoming events and sweeps idle entries until the event
/// stream ends or `cancel` fires.
pub async fn run_metadata_watch(
    mut writer: MetadataWriter,
    mut rx: Receiver<MetadataEvent>,
    sweep_period: Duration,
    cancel: CancellationToken,
) {
    let mut sweep = interval(sweep_period);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    sweep.tick().await;

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    debug!("METADATA | Event stream closed, watch stopped");
                    return;
                };
                let mut changed = writer.apply(event);
                // coalesce whatever is already queued into one snapshot
                while let Ok(event) = rx.try_recv() {
                    changed |= writer.apply(event);
                }
                if changed {
                    writer.publish();
                    debug!("METADATA | Published snapshot with {} entries", writer.len());
                }
            }
            _ = sweep.tick() => {
                let evicted = writer.evict_idle();
                if evicted > 0 {
                    writer.publish();
                    debug!("METADATA | Evicted {evicted} idle entries");
                }
            }
            _ = cancel.cancelled() => {
                debug!("METADATA | Watch cancelled");
                return;
            }
        }
    }
}

/// Producer of metadata events for the watch task.
#[async_trait]
pub trait MetadataSource: Send {
    async fn run(self: Box<Self>, tx: Sender<MetadataEvent>, cancel: CancellationToken);
}

/// Forwards events pushed by an embedding application or a test.
pub struct ChannelMetadataSource {
    rx: Receiver<MetadataEvent>,
}

impl ChannelMetadataSource {
    pub fn new(capacity: usize) -> (Sender<MetadataEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

#[async_trait]
impl MetadataSource for ChannelMetadataSource {
    async fn run(mut self: Box<Self>, tx: Sender<MetadataEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                event = self.rx.recv() => event,
                _ = cancel.cancelled() => return,
            };
            let Some(event) = event else { return };
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileEntry {
    identity: ResourceIdentity,
    #[serde(default)]
    entry: MetadataEntry,
    revision: u64,
}

/// Polls a JSON snapshot of the node's workloads, as written by a platform sidecar.
///
/// Every poll re-lists each entry in the file so that identities the cache evicted
/// for idleness come back on the next poll. The writer drops revisions it already
/// holds, so an unchanged file costs no publish. Identities missing from the file
/// since the previous poll are turned into deletions.
pub struct FileMetadataSource {
    path: PathBuf,
    poll_period: Duration,
    known: HashMap<ResourceIdentity, u64>,
}

impl FileMetadataSource {
    pub fn new(path: impl Into<PathBuf>, poll_period: Duration) -> Self {
        Self {
            path: path.into(),
            poll_period,
            known: HashMap::new(),
        }
    }

    /// Reads the file once and returns an upsert for every listed entry plus a
    /// deletion for every identity gone since the previous successful poll.
    pub async fn poll(&mut self) -> Vec<MetadataEvent> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) => {
                debug!("METADATA | Could not read {}: {e}", self.path.display());
                return Vec::new();
            }
        };
        let entries: Vec<FileEntry> = match serde_json::from_str(&contents) {
            Ok(entries) => entries,
            Err(e) => {
                // keep the previous view rather than deleting everything
                warn!("METADATA | Failed to parse {}: {e}", self.path.display());
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        let mut seen = HashMap::with_capacity(entries.len());
        for file_entry in entries {
            seen.insert(file_entry.identity.clone(), file_entry.revision);
            events.push(MetadataEvent {
                identity: file_entry.identity,
                entry: file_entry.entry,
                revision: file_entry.revision,
                deleted: false,
            });
        }
        for (identity, revision) in &self.known {
            if !seen.contains_key(identity) {
                events.push(MetadataEvent {
                    identity: identity.clone(),
                    entry: MetadataEntry::default(),
                    revision: revision.saturating_add(1),
                    deleted: true,
                });
            }
        }
        self.known = seen;
        events
    }
}

#[async_trait]
impl MetadataSource for FileMetadataSource {
    async fn run(mut self: Box<Self>, tx: Sender<MetadataEvent>, cancel: CancellationToken) {
        info!(
            "METADATA | Polling {} every {:?}",
            self.path.display(),
            self.poll_period
        );
        let mut ticker = interval(self.poll_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => return,
            }
            for event in self.poll().await {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    }
}
