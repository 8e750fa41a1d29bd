// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process memory readings used to correct the admission controller's estimate.

use std::fs;
use tracing::debug;

const PROC_SELF_STATUS_PATH: &str = "/proc/self/status";
const RSS_FIELD: &str = "VmRSS:";

pub trait MemoryReader: Send + Sync {
    /// Current resident memory of the process in bytes, if it can be determined.
    fn resident_bytes(&self) -> Option<usize>;
}

/// Reads `VmRSS` from `/proc/self/status`. Yields `None` where procfs is unavailable.
#[derive(Debug, Clone)]
pub struct ProcStatusMemoryReader {
    path: String,
}

impl Default for ProcStatusMemoryReader {
    fn default() -> Self {
        Self {
            path: PROC_SELF_STATUS_PATH.to_string(),
        }
    }
}

impl ProcStatusMemoryReader {
    pub fn with_path(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl MemoryReader for ProcStatusMemoryReader {
    fn resident_bytes(&self) -> Option<usize> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                debug!("Could not read memory usage from {}: {e}", self.path);
                return None;
            }
        };
        parse_vm_rss(&contents)
    }
}

/// Extracts `VmRSS` (reported in kB) from the contents of a procfs status file.
fn parse_vm_rss(contents: &str) -> Option<usize> {
    contents
        .lines()
        .find_map(|line| line.strip_prefix(RSS_FIELD))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<usize>().ok())
        .map(|kb| kb * 1024)
}
