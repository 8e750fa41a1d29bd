// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::{start_pipeline, test_config, wait_until, RecordingBackend};
use node_collector::http_intake::{self, HttpIntake};
use node_collector::record::Signal;
use node_collector::stream_intake::{self, StreamIntake, StreamReply};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[cfg(test)]
#[tokio::test]
async fn test_http_intake_over_socket() {
    let backend = Arc::new(RecordingBackend::default());
    let config = test_config();
    let pipeline = start_pipeline(&config, backend.clone());

    let listener = http_intake::bind("127.0.0.1", 0).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(http_intake::serve(
        listener,
        HttpIntake::new(&config, pipeline.intake(), pipeline.health()),
        pipeline.intake_cancellation(),
    ));

    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let health = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);
    let health: Value = health.json().await.unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["accepting"], true);

    let accepted = client
        .post(format!("{base}/v1/traces"))
        .json(&json!({"records": [{"name": "span.duration", "value": 12.5}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), 200);
    let accepted: Value = accepted.json().await.unwrap();
    assert_eq!(accepted, json!({"accepted": 1, "under_pressure": false}));

    let malformed = client
        .post(format!("{base}/v1/metrics"))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status(), 400);
    let malformed: Value = malformed.json().await.unwrap();
    assert_eq!(malformed["retryable"], false);

    let report = pipeline.shutdown(Duration::from_secs(5)).await;
    server.await.unwrap().unwrap();

    assert_eq!(report.delivered_records, 1);
    let exported = backend.records();
    assert_eq!(exported[0].signal, Signal::Trace);
    assert_eq!(exported[0].name, "span.duration");
}

#[cfg(test)]
#[tokio::test]
async fn test_stream_intake_replies_in_order() {
    let backend = Arc::new(RecordingBackend::default());
    let config = node_collector::config::Config {
        batch_max_records: 2,
        ..test_config()
    };
    let pipeline = start_pipeline(&config, backend.clone());

    let listener = stream_intake::bind("127.0.0.1", 0).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(stream_intake::serve(
        listener,
        StreamIntake::new(&config, pipeline.intake()),
        pipeline.intake_cancellation(),
    ));

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut replies = BufReader::new(read).lines();

    let first = concat!(
        r#"{"signal":"log","records":[{"name":"app.log","value":{"message":"started"}}]}"#,
        "\n",
        "\n",
    );
    write.write_all(first.as_bytes()).await.unwrap();
    // not UTF-8
    write
        .write_all(b"{\"records\":[{\"name\":\"\xff\xfe\",\"value\":1}]}\n")
        .await
        .unwrap();
    let rest = concat!(
        r#"{"records":[{"name":"","value":1}]}"#,
        "\n",
        r#"{"records":[{"name":"cpu","value":0.4}]}"#,
        "\n",
    );
    write.write_all(rest.as_bytes()).await.unwrap();

    let mut parsed = Vec::new();
    for _ in 0..4 {
        let line = replies.next_line().await.unwrap().unwrap();
        parsed.push(serde_json::from_str::<StreamReply>(&line).unwrap());
    }
    assert_eq!(parsed[0], StreamReply::Accepted { records: 1 });
    for rejected in &parsed[1..3] {
        assert!(matches!(
            rejected,
            StreamReply::Rejected {
                retryable: false,
                ..
            }
        ));
    }
    assert_eq!(parsed[3], StreamReply::Accepted { records: 1 });

    wait_until(|| backend.records().len() == 2).await;
    let exported = backend.records();
    assert_eq!(exported[0].signal, Signal::Log);
    assert_eq!(exported[1].signal, Signal::Metric);

    drop(write);
    pipeline.shutdown(Duration::from_secs(5)).await;
    server.await.unwrap().unwrap();
}

#[cfg(test)]
#[tokio::test]
async fn test_stream_intake_rejects_oversized_line() {
    let backend = Arc::new(RecordingBackend::default());
    let config = node_collector::config::Config {
        max_request_content_length: 64,
        ..test_config()
    };
    let pipeline = start_pipeline(&config, backend);

    let listener = stream_intake::bind("127.0.0.1", 0).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(stream_intake::serve(
        listener,
        StreamIntake::new(&config, pipeline.intake()),
        pipeline.intake_cancellation(),
    ));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let oversized = format!("{{\"records\":[{{\"name\":\"{}\",\"value\":1}}]}}\n", "x".repeat(128));
    stream.write_all(oversized.as_bytes()).await.unwrap();

    let mut replies = BufReader::new(stream).lines();
    let line = replies.next_line().await.unwrap().unwrap();
    match serde_json::from_str::<StreamReply>(&line).unwrap() {
        StreamReply::Rejected { reason, retryable } => {
            assert!(reason.contains("64 bytes"));
            assert!(!retryable);
        }
        other => panic!("unexpected reply {other:?}"),
    }
    // the server closes the connection after an oversized line
    assert!(replies.next_line().await.unwrap().is_none());

    pipeline.shutdown(Duration::from_secs(5)).await;
    server.await.unwrap().unwrap();
}
