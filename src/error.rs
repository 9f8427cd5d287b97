// ABOUTME: Error taxonomy for collection sync runs
// ABOUTME: Distinguishes transient source failures, write failures and configuration errors

use serde::Serialize;
use thiserror::Error;

/// Stage of a sync run at which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Validating the unit definition, before any extraction
    Configure,
    /// Reading bounds or pulling records from the source
    Extract,
    /// Writing records into the destination
    Load,
    /// Persisting the advanced watermark after a confirmed write
    Commit,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Configure => "configure",
            Stage::Extract => "extract",
            Stage::Load => "load",
            Stage::Commit => "commit",
        };
        f.write_str(name)
    }
}

/// Error returned by a [`Source`](crate::source::Source) query.
///
/// Transient errors (timeouts, connection resets, server selection) are
/// retried by the extractor; permanent ones fail the run immediately.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transient source error: {0:#}")]
    Transient(anyhow::Error),
    #[error("source error: {0:#}")]
    Permanent(anyhow::Error),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

/// Errors surfaced by the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The source stayed unreachable after the partition retry budget
    #[error("source unavailable for unit '{unit}' after {attempts} attempt(s)")]
    SourceUnavailable {
        unit: String,
        attempts: u32,
        #[source]
        source: SourceError,
    },

    /// The source rejected the query
    #[error("source query failed for unit '{unit}'")]
    SourceQuery {
        unit: String,
        #[source]
        source: SourceError,
    },

    /// The destination did not durably accept the batch
    #[error("write to table '{table}' failed")]
    WriteFailure {
        table: String,
        #[source]
        source: anyhow::Error,
    },

    /// A loaded table could not be read back from the destination
    #[error("read of table '{table}' failed")]
    ReadFailure {
        table: String,
        #[source]
        source: anyhow::Error,
    },

    /// Missing or invalid unit definition
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Watermark store could not be read or written
    #[error("watermark store error for unit '{unit}'")]
    WatermarkStore {
        unit: String,
        #[source]
        source: anyhow::Error,
    },

    /// Another writer advanced the watermark since it was read
    #[error("watermark for unit '{unit}' changed concurrently (expected version {expected}, found {found})")]
    ConcurrentUpdate {
        unit: String,
        expected: u64,
        found: u64,
    },
}

impl SyncError {
    /// Render the error with its full cause chain, for LoadInfo and logs.
    pub fn detail(&self) -> String {
        let mut detail = self.to_string();
        let mut cause = std::error::Error::source(self);
        while let Some(err) = cause {
            detail.push_str(": ");
            detail.push_str(&err.to_string());
            cause = err.source();
        }
        detail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_is_transient() {
        assert!(SourceError::Transient(anyhow::anyhow!("reset")).is_transient());
        assert!(!SourceError::Permanent(anyhow::anyhow!("bad filter")).is_transient());
    }

    #[test]
    fn test_detail_includes_cause_chain() {
        let err = SyncError::WriteFailure {
            table: "invoice".to_string(),
            source: anyhow::anyhow!("connection closed"),
        };
        assert_eq!(
            err.detail(),
            "write to table 'invoice' failed: connection closed"
        );
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::Configure.to_string(), "configure");
        assert_eq!(Stage::Commit.to_string(), "commit");
    }
}
