// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Reasons a submission is refused at the intake boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntakeError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("pipeline overloaded, retry later")]
    Overloaded,
    #[error("pipeline did not accept the submission within {0:?}")]
    Timeout(Duration),
    #[error("pipeline is shutting down")]
    ShuttingDown,
}

impl IntakeError {
    /// Whether the submitter may retry the same payload later.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, IntakeError::Malformed(_))
    }
}

/// Errors raised while reading or validating configuration. Always fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Invalid value {value:?} for {var}")]
    Parse { var: String, value: String },
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),
    #[error("failed to build backend: {0}")]
    Backend(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
