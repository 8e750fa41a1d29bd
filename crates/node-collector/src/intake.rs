// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entry point of the pipeline shared by every transport.
//!
//! A submission is validated as a whole, admitted as a whole and forwarded as a
//! whole; there is no partial acceptance. The bytes reserved at admission travel
//! with each record and are released by the batcher once the record has left the
//! accounted stages, or right here if the submission never makes it into the
//! enrichment queue.

use crate::admission::{Admission, AdmissionController};
use crate::constants::{MAX_RECORD_ATTRIBUTES, MAX_RECORD_NAME_BYTES};
use crate::errors::IntakeError;
use crate::record::{Entry, Record, Signal, Value};
use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tracing::{debug, warn};

/// Wire form of a submission, shared by the transports.
///
/// `{"signal": "metric", "records": [...]}`; `signal` is optional and, when present,
/// applies to every record of the submission.
#[derive(Debug, Deserialize)]
pub struct Submission {
    #[serde(default)]
    pub signal: Option<Signal>,
    pub records: Vec<Record>,
}

impl Submission {
    pub fn decode(payload: &[u8]) -> Result<Submission, IntakeError> {
        serde_json::from_slice(payload)
            .map_err(|e| IntakeError::Malformed(format!("invalid payload: {e}")))
    }

    /// Returns the records, with `signal` (or the submission's own signal) applied.
    pub fn into_records(self, signal: Option<Signal>) -> Vec<Record> {
        let mut records = self.records;
        if let Some(signal) = signal.or(self.signal) {
            for record in &mut records {
                record.signal = signal;
            }
        }
        records
    }
}

/// Records admitted together, on their way to the enrichment stage.
#[derive(Debug)]
pub struct AdmittedBatch {
    pub entries: Vec<Entry>,
    pub under_pressure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Accepted {
    pub records: usize,
    pub under_pressure: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IntakeStatsSnapshot {
    pub admitted_records: u64,
    pub malformed_submissions: u64,
    pub overloaded_submissions: u64,
    pub timed_out_submissions: u64,
}

#[derive(Debug, Default)]
struct IntakeStats {
    admitted_records: AtomicU64,
    malformed_submissions: AtomicU64,
    overloaded_submissions: AtomicU64,
    timed_out_submissions: AtomicU64,
}

struct IntakeInner {
    admission: Arc<AdmissionController>,
    sender: ArcSwapOption<Sender<AdmittedBatch>>,
    shutting_down: AtomicBool,
    stats: IntakeStats,
}

/// Cloneable handle used by the transports to submit records.
#[derive(Clone)]
pub struct IntakeHandle {
    inner: Arc<IntakeInner>,
}

impl IntakeHandle {
    pub fn new(admission: Arc<AdmissionController>, sender: Sender<AdmittedBatch>) -> Self {
        Self {
            inner: Arc::new(IntakeInner {
                admission,
                sender: ArcSwapOption::from_pointee(sender),
                shutting_down: AtomicBool::new(false),
                stats: IntakeStats::default(),
            }),
        }
    }

    pub async fn submit(
        &self,
        records: Vec<Record>,
        timeout: Duration,
    ) -> Result<Accepted, IntakeError> {
        if self.is_shutting_down() {
            return Err(IntakeError::ShuttingDown);
        }
        if let Err(e) = validate(&records) {
            self.inner
                .stats
                .malformed_submissions
                .fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        if records.is_empty() {
            return Ok(Accepted {
                records: 0,
                under_pressure: false,
            });
        }

        let entries: Vec<Entry> = records
            .into_iter()
            .map(|record| {
                let bytes = record.estimated_size();
                Entry { record, bytes }
            })
            .collect();
        let bytes: usize = entries.iter().map(|e| e.bytes).sum();
        let count = entries.len();

        let under_pressure = match self.inner.admission.try_admit(bytes) {
            Admission::Admitted => false,
            Admission::UnderPressure => true,
            Admission::Rejected => {
                self.inner
                    .stats
                    .overloaded_submissions
                    .fetch_add(1, Ordering::Relaxed);
                debug!("INTAKE | Rejected {count} records ({bytes} bytes), pipeline overloaded");
                return Err(IntakeError::Overloaded);
            }
        };

        let Some(sender) = self.inner.sender.load_full() else {
            self.inner.admission.release(bytes);
            return Err(IntakeError::ShuttingDown);
        };
        let batch = AdmittedBatch {
            entries,
            under_pressure,
        };

        match tokio::time::timeout(timeout, sender.send(batch)).await {
            Ok(Ok(())) => {
                self.inner
                    .stats
                    .admitted_records
                    .fetch_add(count as u64, Ordering::Relaxed);
                Ok(Accepted {
                    records: count,
                    under_pressure,
                })
            }
            Ok(Err(_)) => {
                self.inner.admission.release(bytes);
                Err(IntakeError::ShuttingDown)
            }
            Err(_) => {
                self.inner.admission.release(bytes);
                self.inner
                    .stats
                    .timed_out_submissions
                    .fetch_add(1, Ordering::Relaxed);
                warn!("INTAKE | Enrichment queue full, gave up after {timeout:?}");
                Err(IntakeError::Timeout(timeout))
            }
        }
    }

    /// Stops accepting submissions and drops the handle's side of the enrichment
    /// queue. Submissions already waiting for queue space finish normally.
    pub fn close(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        self.inner.sender.store(None);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.inner.admission
    }

    pub fn stats(&self) -> IntakeStatsSnapshot {
        let stats = &self.inner.stats;
        IntakeStatsSnapshot {
            admitted_records: stats.admitted_records.load(Ordering::Relaxed),
            malformed_submissions: stats.malformed_submissions.load(Ordering::Relaxed),
            overloaded_submissions: stats.overloaded_submissions.load(Ordering::Relaxed),
            timed_out_submissions: stats.timed_out_submissions.load(Ordering::Relaxed),
        }
    }
}

/// Checks the structural constraints every record must satisfy.
pub fn validate(records: &[Record]) -> Result<(), IntakeError> {
    for (i, record) in records.iter().enumerate() {
        if record.name.is_empty() {
            return Err(IntakeError::Malformed(format!("record {i}: empty name")));
        }
        if record.name.len() > MAX_RECORD_NAME_BYTES {
            return Err(IntakeError::Malformed(format!(
                "record {i}: name longer than {MAX_RECORD_NAME_BYTES} bytes"
            )));
        }
        if let Value::Number(n) = record.value {
            if !n.is_finite() {
                return Err(IntakeError::Malformed(format!("record {i}: non-finite value")));
            }
        }
        if record.attributes.len() > MAX_RECORD_ATTRIBUTES {
            return Err(IntakeError::Malformed(format!(
                "record {i}: more than {MAX_RECORD_ATTRIBUTES} attributes"
            )));
        }
        if let Some(identity) = &record.resource {
            if identity.node.is_empty()
                || identity.pod.is_empty()
                || identity.container.is_empty()
            {
                return Err(IntakeError::Malformed(format!(
                    "record {i}: incomplete resource identity"
                )));
            }
        }
    }
    Ok(())
}
