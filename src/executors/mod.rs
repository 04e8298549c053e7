//! Remote command execution

pub mod ssh;

use crate::error::GossError;
use crate::models::MAX_OUTPUT_SIZE;
use std::time::Duration;

/// Result of one remote command
///
/// `output` is populated even when `error` is set: it then holds whatever was
/// captured before the failure (partial output on timeout, diagnostics on a
/// non-zero exit).
#[derive(Debug)]
pub struct CommandOutput {
    pub output: String,
    pub duration: Duration,
    pub error: Option<GossError>,
}

impl CommandOutput {
    pub fn success(output: String, duration: Duration) -> Self {
        Self {
            output,
            duration,
            error: None,
        }
    }

    pub fn failure(output: String, error: GossError, duration: Duration) -> Self {
        Self {
            output,
            duration,
            error: Some(error),
        }
    }
}

/// Truncate byte output to MAX_OUTPUT_SIZE
///
/// Returns (truncated_string, was_truncated)
pub(crate) fn truncate_output_bytes(data: &[u8]) -> (String, bool) {
    let truncated = data.len() > MAX_OUTPUT_SIZE;
    let bytes = if truncated {
        &data[..MAX_OUTPUT_SIZE]
    } else {
        data
    };

    let output = String::from_utf8_lossy(bytes).to_string();
    (output, truncated)
}
