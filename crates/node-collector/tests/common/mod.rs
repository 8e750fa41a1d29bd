// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use async_trait::async_trait;
use node_collector::backend::{Backend, ExportOutcome};
use node_collector::config::Config;
use node_collector::metadata::MetadataSource;
use node_collector::pipeline::{Pipeline, PipelineComponents};
use node_collector::record::{Batch, Record, ResourceIdentity, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Keeps every batch it is given.
#[derive(Default)]
pub struct RecordingBackend {
    batches: Mutex<Vec<Batch>>,
}

impl RecordingBackend {
    pub fn records(&self) -> Vec<Record> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|batch| batch.records.clone())
            .collect()
    }

    /// Records of all batches, ordered by batch sequence rather than arrival.
    pub fn records_by_sequence(&self) -> Vec<Record> {
        let mut batches = self.batches.lock().unwrap().clone();
        batches.sort_by_key(|batch| batch.sequence);
        batches.into_iter().flat_map(|batch| batch.records).collect()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, batch: &Batch) -> ExportOutcome {
        self.batches.lock().unwrap().push(batch.clone());
        ExportOutcome::Success
    }
}

/// Never completes a delivery.
pub struct BlockedBackend;

#[async_trait]
impl Backend for BlockedBackend {
    fn name(&self) -> &str {
        "blocked"
    }

    async fn send(&self, _batch: &Batch) -> ExportOutcome {
        std::future::pending().await
    }
}

pub fn test_config() -> Config {
    Config {
        export_endpoints: vec!["http://127.0.0.1:9".to_string()],
        batch_max_records: 10,
        batch_max_interval: Duration::from_millis(100),
        admission_use_rss: false,
        intake_timeout: Duration::from_millis(500),
        export_backoff_base: Duration::from_millis(10),
        export_backoff_max: Duration::from_millis(50),
        ..Config::default()
    }
}

pub fn components(
    backends: Vec<Arc<dyn Backend>>,
    metadata_sources: Vec<Box<dyn MetadataSource>>,
) -> PipelineComponents {
    PipelineComponents {
        backends,
        metadata_sources,
        memory_reader: None,
    }
}

/// Starts a pipeline exporting to `backend` only, without metadata sources.
pub fn start_pipeline(config: &Config, backend: Arc<dyn Backend>) -> Pipeline {
    Pipeline::start_with(config, components(vec![backend], vec![]))
}

pub fn identity(pod: &str) -> ResourceIdentity {
    ResourceIdentity::new("node-1", pod, "app")
}

pub fn record(name: &str, pod: Option<&str>) -> Record {
    let record = Record::new(name, Value::Number(1.0)).with_attribute("endpoint", "/checkout");
    match pod {
        Some(pod) => record.with_resource(identity(pod)),
        None => record,
    }
}

/// Polls `condition` every 10ms until it holds, for at most two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
