// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::{
    components, identity, record, start_pipeline, test_config, wait_until, BlockedBackend,
    RecordingBackend,
};
use node_collector::backend::Backend;
use node_collector::constants::{CLUSTER_NAME_ATTRIBUTE, POD_LABEL_PREFIX, POD_NAME_ATTRIBUTE};
use node_collector::errors::IntakeError;
use node_collector::metadata::{
    ChannelMetadataSource, MetadataEntry, MetadataEvent, MetadataSource,
};
use node_collector::pipeline::Pipeline;
use node_collector::record::{AttributeValue, Attributes, Record, Value};
use node_collector::stamper::StaticAttributes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn pod_event(pod: &str, revision: u64) -> MetadataEvent {
    let mut attributes = Attributes::new();
    attributes.insert("k8s.namespace.name".to_string(), AttributeValue::from("shop"));
    let mut labels = BTreeMap::new();
    labels.insert("team".to_string(), "payments".to_string());
    MetadataEvent {
        identity: identity(pod),
        entry: MetadataEntry { attributes, labels },
        revision,
        deleted: false,
    }
}

#[cfg(test)]
#[tokio::test]
async fn test_known_and_unknown_pods_are_both_exported() {
    let backend = Arc::new(RecordingBackend::default());
    let (meta_tx, source) = ChannelMetadataSource::new(16);
    let config = node_collector::config::Config {
        static_attributes: StaticAttributes::from_env_string("k8s.cluster.name:prod-eu"),
        ..test_config()
    };
    let pipeline = Pipeline::start_with(
        &config,
        components(
            vec![backend.clone() as Arc<dyn Backend>],
            vec![Box::new(source) as Box<dyn MetadataSource>],
        ),
    );

    for pod in ["pod-1", "pod-2", "pod-3"] {
        meta_tx.send(pod_event(pod, 1)).await.unwrap();
    }
    wait_until(|| pipeline.metadata().len() == 3).await;

    let accepted = pipeline
        .intake()
        .submit(
            vec![
                record("http.requests", Some("pod-1")),
                record("http.requests", Some("pod-7")),
                record("node.load", None),
            ],
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert_eq!(accepted.records, 3);
    assert!(!accepted.under_pressure);

    let report = pipeline.shutdown(Duration::from_secs(5)).await;
    assert!(!report.timed_out);
    assert_eq!(report.admitted_records, 3);
    assert_eq!(report.delivered_records, 3);
    assert_eq!(report.lost_records, 0);

    let exported = backend.records();
    assert_eq!(exported.len(), 3);

    let known = exported
        .iter()
        .find(|r| r.resource.as_ref().is_some_and(|id| id.pod == "pod-1"))
        .unwrap();
    assert_eq!(known.attributes[POD_NAME_ATTRIBUTE], AttributeValue::from("pod-1"));
    assert_eq!(known.attributes["k8s.namespace.name"], AttributeValue::from("shop"));
    assert_eq!(
        known.attributes[&format!("{POD_LABEL_PREFIX}team")],
        AttributeValue::from("payments")
    );
    assert_eq!(known.attributes[CLUSTER_NAME_ATTRIBUTE], AttributeValue::from("prod-eu"));

    // a cache miss keeps the record's own attributes plus the static ones
    let unknown = exported
        .iter()
        .find(|r| r.resource.as_ref().is_some_and(|id| id.pod == "pod-7"))
        .unwrap();
    assert_eq!(unknown.attributes.len(), 2);
    assert_eq!(unknown.attributes["endpoint"], AttributeValue::from("/checkout"));
    assert_eq!(unknown.attributes[CLUSTER_NAME_ATTRIBUTE], AttributeValue::from("prod-eu"));

    let no_identity = exported.iter().find(|r| r.resource.is_none()).unwrap();
    assert_eq!(no_identity.name, "node.load");
    assert_eq!(no_identity.attributes.len(), 2);
}

#[cfg(test)]
#[tokio::test]
async fn test_shutdown_flushes_partial_batch() {
    let backend = Arc::new(RecordingBackend::default());
    let config = node_collector::config::Config {
        batch_max_records: 100,
        batch_max_interval: Duration::from_secs(3600),
        ..test_config()
    };
    let pipeline = start_pipeline(&config, backend.clone());

    let records = (0..25).map(|i| record(&format!("metric.{i}"), None)).collect();
    pipeline.intake().submit(records, Duration::from_secs(1)).await.unwrap();

    let report = pipeline.shutdown(Duration::from_secs(5)).await;
    assert!(!report.timed_out);
    assert_eq!(report.delivered_records, 25);
    assert_eq!(report.lost_records, 0);
    assert_eq!(backend.batch_count(), 1);
}

#[cfg(test)]
#[tokio::test]
async fn test_batches_released_by_size() {
    let backend = Arc::new(RecordingBackend::default());
    let config = node_collector::config::Config {
        batch_max_records: 10,
        batch_max_interval: Duration::from_secs(3600),
        ..test_config()
    };
    let pipeline = start_pipeline(&config, backend.clone());

    let records = (0..30).map(|i| record(&format!("metric.{i}"), None)).collect();
    pipeline.intake().submit(records, Duration::from_secs(1)).await.unwrap();

    wait_until(|| backend.batch_count() == 3).await;
    assert_eq!(backend.records().len(), 30);
    pipeline.shutdown(Duration::from_secs(5)).await;
}

#[cfg(test)]
#[tokio::test]
async fn test_shutdown_deadline_reports_lost_records() {
    let config = node_collector::config::Config {
        batch_max_records: 10,
        ..test_config()
    };
    let pipeline = start_pipeline(&config, Arc::new(BlockedBackend));

    let records = (0..20).map(|i| record(&format!("metric.{i}"), None)).collect();
    pipeline.intake().submit(records, Duration::from_secs(1)).await.unwrap();

    let report = pipeline.shutdown(Duration::from_millis(200)).await;
    assert!(report.timed_out);
    assert_eq!(report.admitted_records, 20);
    assert_eq!(report.delivered_records, 0);
    assert_eq!(report.lost_records, 20);
    assert!(report.elapsed < Duration::from_secs(2));
}

#[cfg(test)]
#[tokio::test]
async fn test_oversized_submission_leaves_collector_ready() {
    let backend = Arc::new(RecordingBackend::default());
    let size = record("metric.0", None).estimated_size();
    let config = node_collector::config::Config {
        lower_watermark_bytes: 2 * size,
        soft_limit_bytes: 4 * size,
        hard_limit_bytes: 6 * size,
        ..test_config()
    };
    let pipeline = start_pipeline(&config, backend.clone());
    let intake = pipeline.intake();

    let oversized = (0..10).map(|i| record(&format!("metric.{i}"), None)).collect();
    let err = intake.submit(oversized, Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, IntakeError::Overloaded));
    assert!(err.is_retryable());

    // nothing is held, so readiness does not change
    let health = pipeline.health().status();
    assert_eq!(health.pressure_bytes, 0);
    assert!(!health.rejecting);
    assert!(health.accepting);

    let accepted = intake
        .submit(vec![record("metric.0", None)], Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(accepted.records, 1);

    // real pressure above the hard limit does flip readiness until it drains
    intake.admission().reassess(7 * size);
    assert!(!pipeline.health().is_accepting());
    intake.admission().reassess(0);
    assert!(pipeline.health().is_accepting());

    let report = pipeline.shutdown(Duration::from_secs(5)).await;
    assert_eq!(report.admitted_records, 1);
    assert_eq!(report.delivered_records, 1);
    assert_eq!(intake.stats().overloaded_submissions, 1);
}

#[cfg(test)]
#[tokio::test]
async fn test_per_identity_order_survives_the_pipeline() {
    let backend = Arc::new(RecordingBackend::default());
    let config = node_collector::config::Config {
        enrich_workers: 4,
        batch_max_records: 7,
        ..test_config()
    };
    let pipeline = start_pipeline(&config, backend.clone());
    let intake = pipeline.intake();

    let pods = ["pod-a", "pod-b", "pod-c"];
    for chunk in 0..10u64 {
        let records = (0..6u64)
            .map(|i| {
                let seq = chunk * 6 + i;
                let pod = pods[usize::try_from(seq).unwrap() % pods.len()];
                Record::new("seq", Value::Number(seq as f64)).with_resource(identity(pod))
            })
            .collect();
        intake.submit(records, Duration::from_secs(1)).await.unwrap();
    }

    let report = pipeline.shutdown(Duration::from_secs(5)).await;
    assert_eq!(report.delivered_records, 60);

    let exported = backend.records_by_sequence();
    assert_eq!(exported.len(), 60);
    for pod in pods {
        let sequence: Vec<f64> = exported
            .iter()
            .filter(|r| r.resource.as_ref().is_some_and(|id| id.pod == pod))
            .map(|r| match r.value {
                Value::Number(n) => n,
                Value::Structured(_) => panic!("unexpected structured value"),
            })
            .collect();
        assert_eq!(sequence.len(), 20);
        assert!(
            sequence.windows(2).all(|pair| pair[0] < pair[1]),
            "{pod} left out of order: {sequence:?}"
        );
    }
}

#[cfg(test)]
#[tokio::test]
async fn test_submit_after_shutdown_is_refused() {
    let backend = Arc::new(RecordingBackend::default());
    let pipeline = start_pipeline(&test_config(), backend);
    let intake = pipeline.intake();
    let cancel = pipeline.intake_cancellation();

    pipeline.shutdown(Duration::from_secs(5)).await;
    assert!(cancel.is_cancelled());

    let err = intake
        .submit(vec![record("late", None)], Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, IntakeError::ShuttingDown));
}
