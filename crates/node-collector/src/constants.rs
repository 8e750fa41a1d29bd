// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub const MIB: usize = 1024 * 1024;

pub const DEFAULT_SOFT_LIMIT_BYTES: usize = 400 * MIB;
pub const DEFAULT_HARD_LIMIT_BYTES: usize = 512 * MIB;
pub const DEFAULT_LOWER_WATERMARK_BYTES: usize = 320 * MIB;

/// Default count trigger of the batcher.
pub const DEFAULT_BATCH_MAX_RECORDS: usize = 1024;
/// Default time trigger of the batcher, in milliseconds.
pub const DEFAULT_BATCH_MAX_INTERVAL_MS: u64 = 10_000;

pub const DEFAULT_ENRICH_CACHE_TTL_SECS: u64 = 300;
pub const DEFAULT_ENRICH_WORKERS: usize = 2;
pub const DEFAULT_METADATA_POLL_INTERVAL_MS: u64 = 5_000;

pub const DEFAULT_EXPORT_RETRY_MAX: u32 = 5;
pub const DEFAULT_EXPORT_BACKOFF_BASE_MS: u64 = 100;
pub const DEFAULT_EXPORT_BACKOFF_MAX_MS: u64 = 30_000;
pub const DEFAULT_EXPORT_FANOUT_LIMIT: usize = 4;
pub const DEFAULT_EXPORT_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_HTTP_PORT: u16 = 4318;
pub const DEFAULT_STREAM_PORT: u16 = 4319;
pub const DEFAULT_SERVICE_NAME: &str = "node-collector";

pub const DEFAULT_INTAKE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_INTAKE_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_BATCH_QUEUE_CAPACITY: usize = 4096;
pub const DEFAULT_EXPORT_QUEUE_CAPACITY: usize = 8;
pub const DEFAULT_SHUTDOWN_DEADLINE_SECS: u64 = 30;
pub const DEFAULT_ADMISSION_REASSESS_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_MAX_REQUEST_CONTENT_LENGTH: usize = 10 * MIB;

// Record validation limits
pub const MAX_RECORD_NAME_BYTES: usize = 1024;
pub const MAX_RECORD_ATTRIBUTES: usize = 128;

// Well-known attribute keys
pub const CLUSTER_NAME_ATTRIBUTE: &str = "k8s.cluster.name";
pub const ENVIRONMENT_ATTRIBUTE: &str = "deployment.environment";
pub const NODE_NAME_ATTRIBUTE: &str = "k8s.node.name";
pub const POD_NAME_ATTRIBUTE: &str = "k8s.pod.name";
pub const CONTAINER_NAME_ATTRIBUTE: &str = "k8s.container.name";
pub const POD_LABEL_PREFIX: &str = "k8s.pod.label.";

/// Path appended to an export endpoint that was configured without one.
pub const DEFAULT_EXPORT_PATH: &str = "/v1/records";
