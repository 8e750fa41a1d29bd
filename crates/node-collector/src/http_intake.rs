// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Unary HTTP transport.
//!
//! | Route              | Result                                                  |
//! |--------------------|---------------------------------------------------------|
//! | `POST /v1/metrics` | submit records as metrics                               |
//! | `POST /v1/traces`  | submit records as traces                                |
//! | `POST /v1/logs`    | submit records as logs                                  |
//! | `GET /health`      | readiness, 200 while accepting and 503 otherwise        |
//! | `GET /info`        | endpoints and configuration summary                     |

use crate::config::Config;
use crate::errors::{IntakeError, PipelineError};
use crate::health::HealthReporter;
use crate::http_utils::{
    body_error_response, create_json_response, read_body, with_retry_after, HttpResponse,
};
use crate::intake::{IntakeHandle, Submission};
use crate::record::Signal;
use hyper::body::{Body, Incoming};
use hyper::service::service_fn;
use hyper::{http, Method, Request, Response, StatusCode};
use serde_json::json;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const METRICS_ENDPOINT_PATH: &str = "/v1/metrics";
pub const TRACES_ENDPOINT_PATH: &str = "/v1/traces";
pub const LOGS_ENDPOINT_PATH: &str = "/v1/logs";
pub const HEALTH_ENDPOINT_PATH: &str = "/health";
pub const INFO_ENDPOINT_PATH: &str = "/info";

/// Seconds a refused submitter is asked to wait before retrying.
const RETRY_AFTER_SECS: u64 = 1;
/// How long open connections get to finish once the server stops.
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct HttpIntake {
    intake: IntakeHandle,
    health: HealthReporter,
    submit_timeout: Duration,
    max_request_content_length: usize,
    info: Arc<serde_json::Value>,
}

impl HttpIntake {
    pub fn new(config: &Config, intake: IntakeHandle, health: HealthReporter) -> Self {
        Self {
            intake,
            health,
            submit_timeout: config.intake_timeout,
            max_request_content_length: config.max_request_content_length,
            info: Arc::new(info_json(config)),
        }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: Body,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        match (req.method(), req.uri().path()) {
            (&Method::POST, METRICS_ENDPOINT_PATH) => self.submit(req, Signal::Metric).await,
            (&Method::POST, TRACES_ENDPOINT_PATH) => self.submit(req, Signal::Trace).await,
            (&Method::POST, LOGS_ENDPOINT_PATH) => self.submit(req, Signal::Log).await,
            (&Method::GET, HEALTH_ENDPOINT_PATH) => {
                let status = self.health.status();
                let code = if status.accepting {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                create_json_response(&status, code)
            }
            (&Method::GET, INFO_ENDPOINT_PATH) => {
                create_json_response(self.info.as_ref(), StatusCode::OK)
            }
            _ => {
                let mut not_found = Response::default();
                *not_found.status_mut() = StatusCode::NOT_FOUND;
                Ok(not_found)
            }
        }
    }

    async fn submit<B>(&self, req: Request<B>, signal: Signal) -> http::Result<HttpResponse>
    where
        B: Body,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let (parts, body) = req.into_parts();
        let payload =
            match read_body(&parts.headers, body, self.max_request_content_length).await {
                Ok(payload) => payload,
                Err(e) => return body_error_response(&e),
            };

        let result = match Submission::decode(&payload) {
            Ok(submission) => {
                self.intake
                    .submit(submission.into_records(Some(signal)), self.submit_timeout)
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(accepted) => create_json_response(
                &json!({
                    "accepted": accepted.records,
                    "under_pressure": accepted.under_pressure,
                }),
                StatusCode::OK,
            ),
            Err(e) => error_response(&e),
        }
    }
}

/// Maps a refused submission to its HTTP answer: client errors are final, anything
/// else asks the submitter to come back later.
pub fn error_response(error: &IntakeError) -> http::Result<HttpResponse> {
    debug!("INTAKE | Submission refused: {error}");
    let body = json!({
        "message": error.to_string(),
        "retryable": error.is_retryable(),
    });
    match error {
        IntakeError::Malformed(_) => create_json_response(&body, StatusCode::BAD_REQUEST),
        IntakeError::Overloaded | IntakeError::Timeout(_) | IntakeError::ShuttingDown => {
            create_json_response(&body, StatusCode::SERVICE_UNAVAILABLE)
                .map(|response| with_retry_after(response, RETRY_AFTER_SECS))
        }
    }
}

fn info_json(config: &Config) -> serde_json::Value {
    json!({
        "service": config.service_name,
        "endpoints": [
            METRICS_ENDPOINT_PATH,
            TRACES_ENDPOINT_PATH,
            LOGS_ENDPOINT_PATH,
            HEALTH_ENDPOINT_PATH,
            INFO_ENDPOINT_PATH
        ],
        "config": {
            "http_port": config.http_port,
            "stream_port": config.stream_port,
            "soft_limit_bytes": config.soft_limit_bytes,
            "hard_limit_bytes": config.hard_limit_bytes,
            "lower_watermark_bytes": config.lower_watermark_bytes,
            "batch_max_records": config.batch_max_records,
            "batch_max_interval_ms":
                u64::try_from(config.batch_max_interval.as_millis()).unwrap_or(u64::MAX),
            "enrich_workers": config.enrich_workers,
            "export_backends": config.export_endpoints.len(),
            "export_compression": config.export_compression_level.is_some(),
        }
    })
}

pub async fn bind(host: &str, port: u16) -> Result<TcpListener, PipelineError> {
    Ok(TcpListener::bind((host, port)).await?)
}

/// Serves HTTP/1 connections on `listener` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    intake: HttpIntake,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    let local_addr: Option<SocketAddr> = listener.local_addr().ok();
    info!("INTAKE | HTTP intake listening on {local_addr:?}");

    let service = service_fn(move |req: Request<Incoming>| {
        let intake = intake.clone();
        async move { intake.handle(req).await }
    });
    let server = hyper::server::conn::http1::Builder::new();
    let mut joinset = tokio::task::JoinSet::new();

    loop {
        let conn = tokio::select! {
            con_res = listener.accept() => match con_res {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("INTAKE | HTTP server error: {e}");
                    return Err(e.into());
                }
                Ok((conn, _)) => conn,
            },
            finished = async {
                match joinset.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => match finished {
                Err(e) if e.is_panic() => {
                    error!("INTAKE | Connection handler panicked: {e:?}");
                    continue;
                },
                Ok(()) | Err(_) => continue,
            },
            () = cancel.cancelled() => break,
        };
        let conn = hyper_util::rt::TokioIo::new(conn);
        let server = server.clone();
        let service = service.clone();
        joinset.spawn(async move {
            if let Err(e) = server.serve_connection(conn, service).await {
                debug!("INTAKE | Connection error: {e}");
            }
        });
    }

    drop(listener);
    let drained = tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, async {
        while joinset.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        joinset.abort_all();
    }
    info!("INTAKE | HTTP intake stopped");
    Ok(())
}
