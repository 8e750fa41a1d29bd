// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming TCP transport.
//!
//! Newline-delimited JSON: every line is one submission and is answered with exactly
//! one line, in order.
//!
//! ```text
//! > {"signal":"metric","records":[{"name":"cpu","value":0.4}]}
//! < {"status":"accepted","records":1}
//! > {"records":[{"name":"","value":1}]}
//! < {"status":"rejected","reason":"malformed payload: record 0: empty name","retryable":false}
//! ```

use crate::config::Config;
use crate::errors::{IntakeError, PipelineError};
use crate::intake::{Accepted, IntakeHandle, Submission};
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StreamReply {
    Accepted { records: usize },
    Rejected { reason: String, retryable: bool },
}

impl From<Result<Accepted, IntakeError>> for StreamReply {
    fn from(result: Result<Accepted, IntakeError>) -> Self {
        match result {
            Ok(accepted) => StreamReply::Accepted {
                records: accepted.records,
            },
            Err(e) => StreamReply::Rejected {
                reason: e.to_string(),
                retryable: e.is_retryable(),
            },
        }
    }
}

#[derive(Clone)]
pub struct StreamIntake {
    intake: IntakeHandle,
    submit_timeout: Duration,
    max_line_bytes: usize,
}

impl StreamIntake {
    pub fn new(config: &Config, intake: IntakeHandle) -> Self {
        Self {
            intake,
            submit_timeout: config.intake_timeout,
            max_line_bytes: config.max_request_content_length,
        }
    }

    /// Answers submissions on one connection until EOF, an I/O error, an oversized
    /// line or cancellation.
    pub async fn handle_connection(
        &self,
        stream: TcpStream,
        cancel: CancellationToken,
    ) -> io::Result<()> {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        let limit = self.max_line_bytes as u64 + 1;
        let mut line = Vec::new();

        loop {
            line.clear();
            let mut limited = (&mut reader).take(limit);
            let read = tokio::select! {
                read = limited.read_until(b'\n', &mut line) => read?,
                () = cancel.cancelled() => break,
            };
            if read == 0 {
                break;
            }
            if line.last() != Some(&b'\n') && read as u64 >= limit {
                let reply = StreamReply::Rejected {
                    reason: format!("line longer than {} bytes", self.max_line_bytes),
                    retryable: false,
                };
                write_reply(&mut write, &reply).await?;
                break;
            }
            let payload = line.trim_ascii();
            if payload.is_empty() {
                continue;
            }

            // invalid UTF-8 is caught by the JSON decoder and answered like any
            // other malformed line
            let result = match Submission::decode(payload) {
                Ok(submission) => {
                    self.intake
                        .submit(submission.into_records(None), self.submit_timeout)
                        .await
                }
                Err(e) => Err(e),
            };
            write_reply(&mut write, &StreamReply::from(result)).await?;
        }

        write.shutdown().await
    }
}

async fn write_reply<W: AsyncWrite + Unpin>(write: &mut W, reply: &StreamReply) -> io::Result<()> {
    let mut out = serde_json::to_vec(reply)?;
    out.push(b'\n');
    write.write_all(&out).await
}

pub async fn bind(host: &str, port: u16) -> Result<TcpListener, PipelineError> {
    Ok(TcpListener::bind((host, port)).await?)
}

/// Accepts streaming connections on `listener` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    intake: StreamIntake,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    info!(
        "INTAKE | Stream intake listening on {:?}",
        listener.local_addr().ok()
    );
    let mut joinset = tokio::task::JoinSet::new();

    loop {
        let (stream, peer) = tokio::select! {
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
                    error!("INTAKE | Stream server error: {e}");
                    return Err(e.into());
                }
                Ok(accepted) => accepted,
            },
            finished = async {
                match joinset.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => match finished {
                Err(e) if e.is_panic() => {
                    error!("INTAKE | Stream connection handler panicked: {e:?}");
                    continue;
                },
                Ok(()) | Err(_) => continue,
            },
            () = cancel.cancelled() => break,
        };

        let intake = intake.clone();
        let cancel = cancel.clone();
        joinset.spawn(async move {
            debug!("INTAKE | Stream connection from {peer}");
            if let Err(e) = intake.handle_connection(stream, cancel).await {
                debug!("INTAKE | Stream connection from {peer} ended: {e}");
            }
        });
    }

    drop(listener);
    while joinset.join_next().await.is_some() {}
    info!("INTAKE | Stream intake stopped");
    Ok(())
}
