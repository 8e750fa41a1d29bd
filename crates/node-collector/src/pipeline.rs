// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wiring of the stages and their orderly shutdown.
//!
//! ```text
//!  IntakeHandle ─▶ dispatcher ─▶ enrichment workers ─▶ BatcherService ─▶ ExporterService
//!       │                             ▲                      │
//!  AdmissionController ◀──release─────┼──────────────────────┘
//!       ▲                             │
//!  reassessment task          MetadataCache ◀── watch task ◀── MetadataSource(s)
//! ```
//!
//! Shutdown drains front to back: intake stops first, and every later stage ends
//! when its input queue closes, so whatever was admitted flows to the exporter.

use crate::admission::{run_reassessment, AdmissionController};
use crate::backend::{Backend, HttpBackend};
use crate::batcher::{Batcher, BatcherService, BatcherStats};
use crate::config::Config;
use crate::enricher::{run_dispatcher, run_worker, Enricher, EnricherStatsSnapshot};
use crate::errors::PipelineError;
use crate::exporter::{ExportStats, ExporterService};
use crate::health::HealthReporter;
use crate::intake::IntakeHandle;
use crate::memory::{MemoryReader, ProcStatusMemoryReader};
use crate::metadata::{run_metadata_watch, FileMetadataSource, MetadataCache, MetadataSource};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const METADATA_EVENT_QUEUE_CAPACITY: usize = 1024;

/// Pluggable parts of a pipeline. [`Pipeline::start`] builds them from the
/// configuration; embedders and tests can supply their own.
pub struct PipelineComponents {
    pub backends: Vec<Arc<dyn Backend>>,
    pub metadata_sources: Vec<Box<dyn MetadataSource>>,
    pub memory_reader: Option<Arc<dyn MemoryReader>>,
}

impl PipelineComponents {
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let backends = config
            .backend_configs()
            .into_iter()
            .map(|backend| HttpBackend::new(backend).map(|b| Arc::new(b) as Arc<dyn Backend>))
            .collect::<Result<Vec<_>, _>>()?;

        let mut metadata_sources: Vec<Box<dyn MetadataSource>> = Vec::new();
        if let Some(path) = &config.metadata_file {
            metadata_sources.push(Box::new(FileMetadataSource::new(
                path.clone(),
                config.metadata_poll_interval,
            )));
        }

        let memory_reader: Option<Arc<dyn MemoryReader>> = if config.admission_use_rss {
            Some(Arc::new(ProcStatusMemoryReader::default()))
        } else {
            None
        };

        Ok(Self {
            backends,
            metadata_sources,
            memory_reader,
        })
    }
}

/// Outcome of [`Pipeline::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub admitted_records: u64,
    pub delivered_records: u64,
    pub dropped_records: u64,
    /// Admitted records neither delivered nor accounted as dropped when the drain ended.
    pub lost_records: u64,
    pub timed_out: bool,
    pub elapsed: Duration,
}

pub struct Pipeline {
    intake: IntakeHandle,
    health: HealthReporter,
    enricher: Arc<Enricher>,
    metadata: MetadataCache,
    export_stats: Arc<ExportStats>,
    batcher_stats: Arc<BatcherStats>,
    /// Stops the transports.
    intake_cancel: CancellationToken,
    /// Stops the metadata and reassessment tasks.
    background_cancel: CancellationToken,
    /// Cuts export retries short once the drain deadline has passed.
    export_abort: CancellationToken,
    dispatcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    batcher: JoinHandle<()>,
    exporter: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Starts a pipeline with the backends, metadata source and memory reader the
    /// configuration describes.
    pub fn start(config: &Config) -> Result<Pipeline, PipelineError> {
        let components = PipelineComponents::from_config(config)?;
        Ok(Self::start_with(config, components))
    }

    pub fn start_with(config: &Config, components: PipelineComponents) -> Pipeline {
        let admission = Arc::new(AdmissionController::new(config.admission_limits()));
        let export_stats = Arc::new(ExportStats::default());
        let batcher_stats = Arc::new(BatcherStats::default());
        let intake_cancel = CancellationToken::new();
        let background_cancel = CancellationToken::new();
        let export_abort = CancellationToken::new();

        let (intake_tx, intake_rx) = mpsc::channel(config.intake_queue_capacity.max(1));
        let (batch_tx, batch_rx) = mpsc::channel(config.batch_queue_capacity.max(1));
        let (export_tx, export_rx) = mpsc::channel(config.export_queue_capacity.max(1));

        let intake = IntakeHandle::new(Arc::clone(&admission), intake_tx);

        // metadata
        let (metadata, writer) = MetadataCache::new(config.enrich_cache_ttl);
        let (event_tx, event_rx) = mpsc::channel(METADATA_EVENT_QUEUE_CAPACITY);
        let mut background = Vec::new();
        background.push(tokio::spawn(run_metadata_watch(
            writer,
            event_rx,
            sweep_period(config.enrich_cache_ttl),
            background_cancel.clone(),
        )));
        for source in components.metadata_sources {
            background.push(tokio::spawn(
                source.run(event_tx.clone(), background_cancel.clone()),
            ));
        }
        drop(event_tx);

        if let Some(reader) = components.memory_reader {
            background.push(tokio::spawn(run_reassessment(
                Arc::clone(&admission),
                reader,
                config.admission_reassess_interval,
                background_cancel.clone(),
            )));
        }

        // enrichment
        let enricher = Arc::new(Enricher::new(
            metadata.clone(),
            config.static_attributes.clone(),
        ));
        let mut worker_txs = Vec::with_capacity(config.enrich_workers);
        let mut workers = Vec::with_capacity(config.enrich_workers);
        for id in 0..config.enrich_workers.max(1) {
            let (tx, rx) = mpsc::channel(config.intake_queue_capacity.max(1));
            worker_txs.push(tx);
            workers.push(tokio::spawn(run_worker(
                id,
                Arc::clone(&enricher),
                rx,
                batch_tx.clone(),
            )));
        }
        drop(batch_tx);
        let dispatcher = tokio::spawn(run_dispatcher(intake_rx, worker_txs));

        // batching and export
        let batcher = tokio::spawn(
            BatcherService::new(
                Batcher::new(config.batch_max_records, config.batch_max_interval),
                batch_rx,
                export_tx,
                Arc::clone(&admission),
                Arc::clone(&batcher_stats),
            )
            .run(),
        );
        let exporter = tokio::spawn(
            ExporterService::new(
                export_rx,
                components.backends,
                config.retry_policy(),
                config.export_fanout_limit,
                Arc::clone(&export_stats),
                export_abort.clone(),
            )
            .run(),
        );

        let health = HealthReporter::new(
            config.service_name.clone(),
            intake.clone(),
            Arc::clone(&export_stats),
            Arc::clone(&batcher_stats),
        );

        info!(
            "Pipeline started with {} enrichment workers, batches of up to {} records every {:?}",
            workers.len(),
            config.batch_max_records,
            config.batch_max_interval
        );

        Pipeline {
            intake,
            health,
            enricher,
            metadata,
            export_stats,
            batcher_stats,
            intake_cancel,
            background_cancel,
            export_abort,
            dispatcher,
            workers,
            batcher,
            exporter,
            background,
        }
    }

    pub fn intake(&self) -> IntakeHandle {
        self.intake.clone()
    }

    pub fn health(&self) -> HealthReporter {
        self.health.clone()
    }

    pub fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    pub fn enricher_stats(&self) -> EnricherStatsSnapshot {
        self.enricher.stats()
    }

    /// Token the transports stop on. Cancelled as the first step of shutdown.
    pub fn intake_cancellation(&self) -> CancellationToken {
        self.intake_cancel.clone()
    }

    /// Stops intake and drains every stage, giving up after `deadline`.
    pub async fn shutdown(self, deadline: Duration) -> ShutdownReport {
        let started = Instant::now();
        info!("Shutting down, draining pipeline for up to {deadline:?}");

        self.intake.close();
        self.intake_cancel.cancel();

        let mut abort_handles: Vec<AbortHandle> =
            self.workers.iter().map(JoinHandle::abort_handle).collect();
        abort_handles.push(self.dispatcher.abort_handle());
        abort_handles.push(self.batcher.abort_handle());
        abort_handles.push(self.exporter.abort_handle());

        let dispatcher = self.dispatcher;
        let workers = self.workers;
        let batcher = self.batcher;
        let exporter = self.exporter;
        let drain = async move {
            log_join("dispatcher", dispatcher.await);
            debug!("Intake drained");
            for worker in workers {
                log_join("enrichment worker", worker.await);
            }
            debug!("Enrichment drained");
            log_join("batcher", batcher.await);
            debug!("Batcher flushed");
            log_join("exporter", exporter.await);
            debug!("Exporter drained");
        };

        let timed_out = tokio::time::timeout(deadline, drain).await.is_err();
        if timed_out {
            warn!("Shutdown deadline of {deadline:?} expired, abandoning in-flight data");
            self.export_abort.cancel();
            for handle in &abort_handles {
                handle.abort();
            }
        }

        self.background_cancel.cancel();
        for task in self.background {
            task.abort();
        }

        let admitted_records = self.intake.stats().admitted_records;
        let export = self.export_stats.snapshot();
        let report = ShutdownReport {
            admitted_records,
            delivered_records: export.delivered_records,
            dropped_records: export.dropped_records,
            lost_records: admitted_records
                .saturating_sub(export.delivered_records)
                .saturating_sub(export.dropped_records),
            timed_out,
            elapsed: started.elapsed(),
        };
        debug!("Batcher stats at shutdown: {:?}", self.batcher_stats.snapshot());
        info!(
            "Shutdown complete: {} admitted, {} delivered, {} dropped, {} lost{}",
            report.admitted_records,
            report.delivered_records,
            report.dropped_records,
            report.lost_records,
            if timed_out { " (deadline expired)" } else { "" }
        );
        report
    }
}

fn sweep_period(ttl: Duration) -> Duration {
    (ttl / 4).max(Duration::from_secs(1))
}

fn log_join(stage: &str, result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!("{stage} task failed: {e}");
    }
}
