// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Node-local telemetry pipeline.
//!
//! Records submitted by local workloads flow through a fixed, linear chain of stages:
//!
//! ```text
//!   Intake ──> Admission ──> Enricher ──> Stamper ──> Batcher ──> Exporter
//!     ^            │
//!     └────────────┘  backpressure
//! ```
//!
//! Every stage is connected to the next by a bounded queue, so memory held by the
//! pipeline is limited by the admission controller's envelope.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod admission;
pub mod backend;
pub mod batcher;
pub mod config;
pub mod constants;
pub mod enricher;
pub mod errors;
pub mod exporter;
pub mod health;
pub mod http_intake;
pub mod http_utils;
pub mod intake;
pub mod memory;
pub mod metadata;
pub mod pipeline;
pub mod record;
pub mod stamper;
pub mod stream_intake;
