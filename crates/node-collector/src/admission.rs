// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Memory-pressure admission control.
//!
//! The controller keeps an estimate of the bytes held by the pipeline (intake buffer,
//! enrichment queue and the batch in progress) and decides, per submitted batch,
//! whether it may enter. Three thresholds give the decision hysteresis:
//!
//! ```text
//!   0 ──── lower_watermark ──── soft_limit ──── hard_limit ────>
//!          │ rejection stops     │ admitted,     │ whole batch
//!          │ at or below here    │ under pressure│ rejected above
//! ```
//!
//! Once rejecting, the controller keeps rejecting until the pressure falls to the
//! lower watermark, which stops admit/reject flapping around the hard limit.
//!
//! Incremental accounting drifts from what the process really holds, so a periodic
//! reassessment replaces the correction term with a fresh reading from a
//! [`MemoryReader`].

use crate::memory::MemoryReader;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    pub soft_limit_bytes: usize,
    pub hard_limit_bytes: usize,
    pub lower_watermark_bytes: usize,
}

/// Outcome of an admission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Admitted above the soft limit; downstream stages may skip optional work.
    UnderPressure,
    Rejected,
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        !matches!(self, Admission::Rejected)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct AdmissionStatsSnapshot {
    pub admitted_batches: u64,
    pub under_pressure_batches: u64,
    pub rejected_batches: u64,
}

#[derive(Debug)]
pub struct AdmissionController {
    limits: AdmissionLimits,
    /// Bytes admitted and not yet released.
    tracked: AtomicUsize,
    /// Correction applied by the last reassessment (observed - tracked).
    drift: AtomicI64,
    rejecting: AtomicBool,
    admitted_batches: AtomicU64,
    under_pressure_batches: AtomicU64,
    rejected_batches: AtomicU64,
}

impl AdmissionController {
    pub fn new(limits: AdmissionLimits) -> Self {
        Self {
            limits,
            tracked: AtomicUsize::new(0),
            drift: AtomicI64::new(0),
            rejecting: AtomicBool::new(false),
            admitted_batches: AtomicU64::new(0),
            under_pressure_batches: AtomicU64::new(0),
            rejected_batches: AtomicU64::new(0),
        }
    }

    pub fn limits(&self) -> AdmissionLimits {
        self.limits
    }

    /// Current estimate of bytes held by the pipeline.
    pub fn pressure(&self) -> usize {
        self.pressure_with(self.tracked.load(Ordering::Acquire))
    }

    fn pressure_with(&self, tracked: usize) -> usize {
        let drift = self.drift.load(Ordering::Acquire);
        let corrected = i64::try_from(tracked).unwrap_or(i64::MAX).saturating_add(drift);
        usize::try_from(corrected).unwrap_or(0)
    }

    pub fn is_rejecting(&self) -> bool {
        self.rejecting.load(Ordering::Acquire)
    }

    /// Asks to admit a batch of `bytes`. The batch is admitted or rejected as a whole.
    pub fn try_admit(&self, bytes: usize) -> Admission {
        loop {
            let tracked = self.tracked.load(Ordering::Acquire);
            let pressure = self.pressure_with(tracked);

            if self.rejecting.load(Ordering::Acquire) {
                if pressure > self.limits.lower_watermark_bytes {
                    self.rejected_batches.fetch_add(1, Ordering::Relaxed);
                    return Admission::Rejected;
                }
                if self
                    .rejecting
                    .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    info!("ADMISSION | Pressure at {pressure} bytes, admitting again");
                }
            }

            let projected = pressure.saturating_add(bytes);
            if projected > self.limits.hard_limit_bytes {
                // at or below the lower watermark the state would clear on the next
                // request, so only the batch itself is refused
                if pressure <= self.limits.lower_watermark_bytes {
                    debug!(
                        "ADMISSION | Batch of {bytes} bytes does not fit under the hard limit of {} bytes",
                        self.limits.hard_limit_bytes
                    );
                } else if !self.rejecting.swap(true, Ordering::AcqRel) {
                    warn!(
                        "ADMISSION | Hard limit of {} bytes exceeded ({projected} bytes projected), rejecting intake",
                        self.limits.hard_limit_bytes
                    );
                }
                self.rejected_batches.fetch_add(1, Ordering::Relaxed);
                return Admission::Rejected;
            }

            if self
                .tracked
                .compare_exchange_weak(
                    tracked,
                    tracked.saturating_add(bytes),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }

            self.admitted_batches.fetch_add(1, Ordering::Relaxed);
            if projected > self.limits.soft_limit_bytes {
                self.under_pressure_batches.fetch_add(1, Ordering::Relaxed);
                return Admission::UnderPressure;
            }
            return Admission::Admitted;
        }
    }

    /// Returns previously admitted bytes.
    pub fn release(&self, bytes: usize) {
        let mut current = self.tracked.load(Ordering::Acquire);
        loop {
            match self.tracked.compare_exchange_weak(
                current,
                current.saturating_sub(bytes),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Replaces the correction term with an observed reading and re-evaluates the
    /// rejecting state against it.
    pub fn reassess(&self, observed_bytes: usize) {
        let tracked = self.tracked.load(Ordering::Acquire);
        let drift = i64::try_from(observed_bytes)
            .unwrap_or(i64::MAX)
            .saturating_sub(i64::try_from(tracked).unwrap_or(i64::MAX));
        self.drift.store(drift, Ordering::Release);

        let pressure = self.pressure();
        if pressure > self.limits.hard_limit_bytes {
            if !self.rejecting.swap(true, Ordering::AcqRel) {
                warn!(
                    "ADMISSION | Reassessed pressure {pressure} bytes is above the hard limit, rejecting intake"
                );
            }
        } else if pressure <= self.limits.lower_watermark_bytes
            && self.rejecting.swap(false, Ordering::AcqRel)
        {
            info!(
                "ADMISSION | Reassessed pressure {pressure} bytes is below the lower watermark, admitting again"
            );
        }
        debug!(
            "ADMISSION | Reassessed: observed {observed_bytes} bytes, tracked {tracked} bytes, drift {drift}"
        );
    }

    pub fn stats(&self) -> AdmissionStatsSnapshot {
        AdmissionStatsSnapshot {
            admitted_batches: self.admitted_batches.load(Ordering::Relaxed),
            under_pressure_batches: self.under_pressure_batches.load(Ordering::Relaxed),
            rejected_batches: self.rejected_batches.load(Ordering::Relaxed),
        }
    }
}

/// Periodically corrects the controller's estimate with readings from `reader` until
/// `cancel` fires.
pub async fn run_reassessment(
    controller: Arc<AdmissionController>,
    reader: Arc<dyn MemoryReader>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // first tick is instantaneous

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match reader.resident_bytes() {
                    Some(observed) => controller.reassess(observed),
                    None => debug!("ADMISSION | Memory reading unavailable, skipping reassessment"),
                }
            }
            _ = cancel.cancelled() => {
                debug!("ADMISSION | Reassessment stopped");
                return;
            }
        }
    }
}
