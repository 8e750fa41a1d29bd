// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::admission::AdmissionLimits;
use crate::backend::HttpBackendConfig;
use crate::constants::*;
use crate::errors::ConfigError;
use crate::exporter::RetryPolicy;
use crate::record::AttributeValue;
use crate::stamper::StaticAttributes;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Collector configuration, read once at startup and immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub service_name: String,
    pub host: String,
    pub http_port: u16,
    pub stream_port: u16,
    pub max_request_content_length: usize,

    pub soft_limit_bytes: usize,
    pub hard_limit_bytes: usize,
    pub lower_watermark_bytes: usize,
    pub admission_reassess_interval: Duration,
    /// Correct the admission estimate with the process resident set size.
    pub admission_use_rss: bool,

    pub intake_timeout: Duration,
    pub intake_queue_capacity: usize,
    pub batch_queue_capacity: usize,
    pub export_queue_capacity: usize,

    pub enrich_cache_ttl: Duration,
    pub enrich_workers: usize,
    pub metadata_file: Option<PathBuf>,
    pub metadata_poll_interval: Duration,
    pub static_attributes: StaticAttributes,

    pub batch_max_records: usize,
    pub batch_max_interval: Duration,

    pub export_endpoints: Vec<String>,
    pub export_api_key: Option<String>,
    pub export_retry_max: u32,
    pub export_backoff_base: Duration,
    pub export_backoff_max: Duration,
    pub export_fanout_limit: usize,
    pub export_timeout: Duration,
    pub export_compression_level: Option<i32>,

    pub shutdown_deadline: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            host: DEFAULT_HOST.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            stream_port: DEFAULT_STREAM_PORT,
            max_request_content_length: DEFAULT_MAX_REQUEST_CONTENT_LENGTH,
            soft_limit_bytes: DEFAULT_SOFT_LIMIT_BYTES,
            hard_limit_bytes: DEFAULT_HARD_LIMIT_BYTES,
            lower_watermark_bytes: DEFAULT_LOWER_WATERMARK_BYTES,
            admission_reassess_interval: Duration::from_millis(
                DEFAULT_ADMISSION_REASSESS_INTERVAL_MS,
            ),
            admission_use_rss: true,
            intake_timeout: Duration::from_millis(DEFAULT_INTAKE_TIMEOUT_MS),
            intake_queue_capacity: DEFAULT_INTAKE_QUEUE_CAPACITY,
            batch_queue_capacity: DEFAULT_BATCH_QUEUE_CAPACITY,
            export_queue_capacity: DEFAULT_EXPORT_QUEUE_CAPACITY,
            enrich_cache_ttl: Duration::from_secs(DEFAULT_ENRICH_CACHE_TTL_SECS),
            enrich_workers: DEFAULT_ENRICH_WORKERS,
            metadata_file: None,
            metadata_poll_interval: Duration::from_millis(DEFAULT_METADATA_POLL_INTERVAL_MS),
            static_attributes: StaticAttributes::default(),
            batch_max_records: DEFAULT_BATCH_MAX_RECORDS,
            batch_max_interval: Duration::from_millis(DEFAULT_BATCH_MAX_INTERVAL_MS),
            export_endpoints: Vec::new(),
            export_api_key: None,
            export_retry_max: DEFAULT_EXPORT_RETRY_MAX,
            export_backoff_base: Duration::from_millis(DEFAULT_EXPORT_BACKOFF_BASE_MS),
            export_backoff_max: Duration::from_millis(DEFAULT_EXPORT_BACKOFF_MAX_MS),
            export_fanout_limit: DEFAULT_EXPORT_FANOUT_LIMIT,
            export_timeout: Duration::from_secs(DEFAULT_EXPORT_TIMEOUT_SECS),
            export_compression_level: None,
            shutdown_deadline: Duration::from_secs(DEFAULT_SHUTDOWN_DEADLINE_SECS),
        }
    }
}

impl Config {
    /// Reads the configuration from `COLLECTOR_*` environment variables and validates it.
    pub fn from_env() -> Result<Config, ConfigError> {
        let defaults = Config::default();

        let export_endpoints: Vec<String> = env::var("COLLECTOR_EXPORT_ENDPOINTS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
            .map(String::from)
            .collect();

        let mut static_attributes = env::var("COLLECTOR_STATIC_ATTRIBUTES")
            .map(|attributes| StaticAttributes::from_env_string(&attributes))
            .unwrap_or_default()
            .attributes()
            .clone();
        if let Some(cluster) = non_empty_var("COLLECTOR_CLUSTER_NAME") {
            static_attributes.insert(
                CLUSTER_NAME_ATTRIBUTE.to_string(),
                AttributeValue::from(cluster),
            );
        }
        if let Some(environment) = non_empty_var("COLLECTOR_ENVIRONMENT") {
            static_attributes.insert(
                ENVIRONMENT_ATTRIBUTE.to_string(),
                AttributeValue::from(environment),
            );
        }

        let config = Config {
            service_name: non_empty_var("COLLECTOR_SERVICE_NAME").unwrap_or(defaults.service_name),
            host: non_empty_var("COLLECTOR_HOST").unwrap_or(defaults.host),
            http_port: parse_var("COLLECTOR_HTTP_PORT", defaults.http_port)?,
            stream_port: parse_var("COLLECTOR_STREAM_PORT", defaults.stream_port)?,
            max_request_content_length: parse_var(
                "COLLECTOR_MAX_REQUEST_CONTENT_LENGTH",
                defaults.max_request_content_length,
            )?,
            soft_limit_bytes: parse_var("COLLECTOR_SOFT_LIMIT_BYTES", defaults.soft_limit_bytes)?,
            hard_limit_bytes: parse_var("COLLECTOR_HARD_LIMIT_BYTES", defaults.hard_limit_bytes)?,
            lower_watermark_bytes: parse_var(
                "COLLECTOR_LOWER_WATERMARK_BYTES",
                defaults.lower_watermark_bytes,
            )?,
            admission_reassess_interval: parse_millis_var(
                "COLLECTOR_ADMISSION_REASSESS_INTERVAL_MS",
                defaults.admission_reassess_interval,
            )?,
            admission_use_rss: parse_bool_var(
                "COLLECTOR_ADMISSION_USE_RSS",
                defaults.admission_use_rss,
            )?,
            intake_timeout: parse_millis_var(
                "COLLECTOR_INTAKE_TIMEOUT_MS",
                defaults.intake_timeout,
            )?,
            intake_queue_capacity: parse_var(
                "COLLECTOR_INTAKE_QUEUE_CAPACITY",
                defaults.intake_queue_capacity,
            )?,
            batch_queue_capacity: parse_var(
                "COLLECTOR_BATCH_QUEUE_CAPACITY",
                defaults.batch_queue_capacity,
            )?,
            export_queue_capacity: parse_var(
                "COLLECTOR_EXPORT_QUEUE_CAPACITY",
                defaults.export_queue_capacity,
            )?,
            enrich_cache_ttl: parse_secs_var(
                "COLLECTOR_ENRICH_CACHE_TTL_SECS",
                defaults.enrich_cache_ttl,
            )?,
            enrich_workers: parse_var("COLLECTOR_ENRICH_WORKERS", defaults.enrich_workers)?,
            metadata_file: non_empty_var("COLLECTOR_METADATA_FILE").map(PathBuf::from),
            metadata_poll_interval: parse_millis_var(
                "COLLECTOR_METADATA_POLL_INTERVAL_MS",
                defaults.metadata_poll_interval,
            )?,
            static_attributes: StaticAttributes::new(static_attributes),
            batch_max_records: parse_var(
                "COLLECTOR_BATCH_MAX_RECORDS",
                defaults.batch_max_records,
            )?,
            batch_max_interval: parse_millis_var(
                "COLLECTOR_BATCH_MAX_INTERVAL_MS",
                defaults.batch_max_interval,
            )?,
            export_endpoints,
            export_api_key: non_empty_var("COLLECTOR_EXPORT_API_KEY"),
            export_retry_max: parse_var("COLLECTOR_EXPORT_RETRY_MAX", defaults.export_retry_max)?,
            export_backoff_base: parse_millis_var(
                "COLLECTOR_EXPORT_BACKOFF_BASE_MS",
                defaults.export_backoff_base,
            )?,
            export_backoff_max: parse_millis_var(
                "COLLECTOR_EXPORT_BACKOFF_MAX_MS",
                defaults.export_backoff_max,
            )?,
            export_fanout_limit: parse_var(
                "COLLECTOR_EXPORT_FANOUT_LIMIT",
                defaults.export_fanout_limit,
            )?,
            export_timeout: parse_secs_var(
                "COLLECTOR_EXPORT_TIMEOUT_SECS",
                defaults.export_timeout,
            )?,
            export_compression_level: match non_empty_var("COLLECTOR_EXPORT_COMPRESSION_LEVEL") {
                Some(value) => Some(parse_value("COLLECTOR_EXPORT_COMPRESSION_LEVEL", &value)?),
                None => None,
            },
            shutdown_deadline: parse_secs_var(
                "COLLECTOR_SHUTDOWN_DEADLINE_SECS",
                defaults.shutdown_deadline,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lower_watermark_bytes >= self.soft_limit_bytes {
            return Err(ConfigError::Invalid(
                "lower_watermark_bytes must be below soft_limit_bytes".to_string(),
            ));
        }
        if self.soft_limit_bytes > self.hard_limit_bytes {
            return Err(ConfigError::Invalid(
                "soft_limit_bytes must not exceed hard_limit_bytes".to_string(),
            ));
        }
        if self.batch_max_records == 0 {
            return Err(ConfigError::Invalid("batch_max_records must be at least 1".to_string()));
        }
        if self.batch_max_interval.is_zero() {
            return Err(ConfigError::Invalid("batch_max_interval must be positive".to_string()));
        }
        if self.export_fanout_limit == 0 {
            return Err(ConfigError::Invalid("export_fanout_limit must be at least 1".to_string()));
        }
        if self.enrich_workers == 0 {
            return Err(ConfigError::Invalid("enrich_workers must be at least 1".to_string()));
        }
        if self.intake_queue_capacity == 0
            || self.batch_queue_capacity == 0
            || self.export_queue_capacity == 0
        {
            return Err(ConfigError::Invalid(
                "queue capacities must be at least 1".to_string(),
            ));
        }
        if self.export_endpoints.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one export endpoint is required (COLLECTOR_EXPORT_ENDPOINTS)".to_string(),
            ));
        }
        if let Some(level) = self.export_compression_level {
            if !(1..=22).contains(&level) {
                return Err(ConfigError::Invalid(format!(
                    "export_compression_level must be between 1 and 22, got {level}"
                )));
            }
        }
        Ok(())
    }

    pub fn admission_limits(&self) -> AdmissionLimits {
        AdmissionLimits {
            soft_limit_bytes: self.soft_limit_bytes,
            hard_limit_bytes: self.hard_limit_bytes,
            lower_watermark_bytes: self.lower_watermark_bytes,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_max: self.export_retry_max,
            backoff_base: self.export_backoff_base,
            backoff_max: self.export_backoff_max,
        }
    }

    pub fn backend_configs(&self) -> Vec<HttpBackendConfig> {
        self.export_endpoints
            .iter()
            .map(|endpoint| HttpBackendConfig {
                endpoint: endpoint.clone(),
                api_key: self.export_api_key.clone(),
                timeout: self.export_timeout,
                compression_level: self.export_compression_level,
            })
            .collect()
    }
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var).ok().filter(|value| !value.trim().is_empty())
}

fn parse_value<T: FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::Parse {
        var: var.to_string(),
        value: value.to_string(),
    })
}

fn parse_var<T: FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match non_empty_var(var) {
        Some(value) => parse_value(var, &value),
        None => Ok(default),
    }
}

fn parse_millis_var(var: &str, default: Duration) -> Result<Duration, ConfigError> {
    match non_empty_var(var) {
        Some(value) => parse_value(var, &value).map(Duration::from_millis),
        None => Ok(default),
    }
}

fn parse_secs_var(var: &str, default: Duration) -> Result<Duration, ConfigError> {
    match non_empty_var(var) {
        Some(value) => parse_value(var, &value).map(Duration::from_secs),
        None => Ok(default),
    }
}

fn parse_bool_var(var: &str, default: bool) -> Result<bool, ConfigError> {
    match non_empty_var(var).map(|value| value.trim().to_ascii_lowercase()) {
        Some(value) => match value.as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::Parse {
                var: var.to_string(),
                value,
            }),
        },
        None => Ok(default),
    }
}
