// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::{record, test_config, wait_until};
use mockito::Matcher;
use node_collector::pipeline::Pipeline;
use std::io::Write;
use std::time::Duration;

const METADATA_FILE: &str = r#"[
    {
        "identity": {"node": "node-1", "pod": "pod-1", "container": "app"},
        "entry": {"attributes": {"k8s.namespace.name": "shop"}},
        "revision": 4
    }
]"#;

#[cfg(test)]
#[tokio::test]
async fn test_enriched_batch_reaches_http_backend() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/records")
        .match_header("content-type", "application/json")
        .match_header("x-api-key", "test-key")
        .match_body(Matcher::PartialJsonString(
            r#"{"records":[
                {"name":"http.requests","attributes":{
                    "k8s.namespace.name":"shop",
                    "k8s.pod.name":"pod-1"
                }},
                {"name":"node.load"}
            ]}"#
            .to_string(),
        ))
        .with_status(202)
        .expect(1)
        .create_async()
        .await;

    let mut metadata_file = tempfile::NamedTempFile::new().unwrap();
    metadata_file.write_all(METADATA_FILE.as_bytes()).unwrap();

    let config = node_collector::config::Config {
        export_endpoints: vec![server.url()],
        export_api_key: Some("test-key".to_string()),
        metadata_file: Some(metadata_file.path().to_path_buf()),
        metadata_poll_interval: Duration::from_millis(20),
        batch_max_records: 2,
        ..test_config()
    };
    let pipeline = Pipeline::start(&config).unwrap();
    wait_until(|| pipeline.metadata().len() == 1).await;

    pipeline
        .intake()
        .submit(
            vec![record("http.requests", Some("pod-1")), record("node.load", None)],
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    let report = pipeline.shutdown(Duration::from_secs(5)).await;
    assert_eq!(report.delivered_records, 2);
    assert_eq!(report.lost_records, 0);
    mock.assert_async().await;
}

#[cfg(test)]
#[tokio::test]
async fn test_rejected_batch_is_dropped_not_retried() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/records")
        .with_status(400)
        .with_body(r#"{"error":"bad batch"}"#)
        .expect(1)
        .create_async()
        .await;

    let config = node_collector::config::Config {
        export_endpoints: vec![server.url()],
        batch_max_records: 3,
        ..test_config()
    };
    let pipeline = Pipeline::start(&config).unwrap();

    let records = (0..3).map(|i| record(&format!("metric.{i}"), None)).collect();
    pipeline.intake().submit(records, Duration::from_secs(1)).await.unwrap();

    let report = pipeline.shutdown(Duration::from_secs(5)).await;
    assert!(!report.timed_out);
    assert_eq!(report.delivered_records, 0);
    assert_eq!(report.dropped_records, 3);
    assert_eq!(report.lost_records, 0);
    mock.assert_async().await;
}

#[cfg(test)]
#[tokio::test]
async fn test_throttled_backend_is_retried() {
    let mut server = mockito::Server::new_async().await;
    let throttled = server
        .mock("POST", "/v1/records")
        .with_status(429)
        .expect_at_least(1)
        .create_async()
        .await;

    let config = node_collector::config::Config {
        export_endpoints: vec![server.url()],
        batch_max_records: 1,
        export_backoff_base: Duration::from_millis(500),
        export_backoff_max: Duration::from_secs(1),
        ..test_config()
    };
    let pipeline = Pipeline::start(&config).unwrap();
    pipeline
        .intake()
        .submit(vec![record("metric.0", None)], Duration::from_secs(1))
        .await
        .unwrap();

    wait_until(|| pipeline.health().status().export.transient_failures >= 1).await;
    throttled.assert_async().await;
    throttled.remove_async().await;
    let accepted = server
        .mock("POST", "/v1/records")
        .with_status(200)
        .create_async()
        .await;

    let report = pipeline.shutdown(Duration::from_secs(5)).await;
    assert_eq!(report.delivered_records, 1);
    accepted.assert_async().await;
}
