// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::batcher::{BatcherStats, BatcherStatsSnapshot};
use crate::exporter::{ExportStats, ExportStatsSnapshot};
use crate::intake::IntakeHandle;
use serde::Serialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub const STATUS_HEALTHY: &str = "healthy";
pub const STATUS_UNAVAILABLE: &str = "unavailable";

/// Readiness of the collector, as served on the health endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub service: String,
    /// Unix time in milliseconds.
    pub timestamp: u64,
    pub accepting: bool,
    pub pressure_bytes: usize,
    pub rejecting: bool,
    pub shutting_down: bool,
    pub export: ExportStatsSnapshot,
    pub batcher: BatcherStatsSnapshot,
}

#[derive(Clone)]
pub struct HealthReporter {
    service: String,
    intake: IntakeHandle,
    export: Arc<ExportStats>,
    batcher: Arc<BatcherStats>,
}

impl HealthReporter {
    pub fn new(
        service: impl Into<String>,
        intake: IntakeHandle,
        export: Arc<ExportStats>,
        batcher: Arc<BatcherStats>,
    ) -> Self {
        Self {
            service: service.into(),
            intake,
            export,
            batcher,
        }
    }

    /// The collector accepts new data unless admission is rejecting or it is draining.
    pub fn is_accepting(&self) -> bool {
        !self.intake.is_shutting_down() && !self.intake.admission().is_rejecting()
    }

    pub fn status(&self) -> HealthStatus {
        let admission = self.intake.admission();
        let shutting_down = self.intake.is_shutting_down();
        let rejecting = admission.is_rejecting();
        let accepting = !shutting_down && !rejecting;
        HealthStatus {
            status: if accepting {
                STATUS_HEALTHY
            } else {
                STATUS_UNAVAILABLE
            },
            service: self.service.clone(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
                .unwrap_or_default(),
            accepting,
            pressure_bytes: admission.pressure(),
            rejecting,
            shutting_down,
            export: self.export.snapshot(),
            batcher: self.batcher.snapshot(),
        }
    }
}
