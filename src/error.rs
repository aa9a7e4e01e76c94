// src/error.rs
//! Error taxonomy for the scan pipeline.
//!
//! Network and blocked errors are retryable (the latter only after a forced
//! identity rotation); parse and classifier-config errors are isolated to a
//! single candidate or scoring call; persistence errors abort the current
//! cycle's writes but never the process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    /// Transport-level failure: timeout, connection refused, TLS, or a
    /// cancelled in-flight request during shutdown.
    #[error("network error: {reason}")]
    Network { reason: String, cancelled: bool },

    /// The remote site answered in a way that looks like blocking
    /// (status code on the configured list, or a suspiciously small body).
    #[error("blocked by site: {reason}")]
    Blocked { reason: String },

    /// A single candidate could not be extracted; skip it, keep the cycle.
    #[error("parse error: {0}")]
    Parse(String),

    /// Persisted classifier state was malformed; fall back to cold start.
    #[error("classifier state invalid: {0}")]
    ClassifierConfig(String),

    /// Repository write/read failed; the current cycle's writes are aborted.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl ScanError {
    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
            cancelled: false,
        }
    }

    pub fn cancelled() -> Self {
        Self::Network {
            reason: "cancelled".into(),
            cancelled: true,
        }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self::Blocked {
            reason: reason.into(),
        }
    }

    /// True for errors the coordinator may retry within one cycle.
    /// Cancelled requests are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { cancelled, .. } => !cancelled,
            Self::Blocked { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_matches_taxonomy() {
        assert!(ScanError::network("timeout").is_retryable());
        assert!(ScanError::blocked("403").is_retryable());
        assert!(!ScanError::cancelled().is_retryable());
        assert!(!ScanError::Parse("bad".into()).is_retryable());
        assert!(!ScanError::Persistence("db".into()).is_retryable());
    }
}
