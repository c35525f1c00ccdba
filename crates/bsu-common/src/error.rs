//! Error taxonomy for the bsu-csi-driver
//!
//! Every fallible operation in the core returns a [`DriverError`]. The
//! variants mirror the table in the design spec §7 one-to-one; the bin
//! crate's `error_map` module is the only place that knows how to turn a
//! variant into a `tonic::Status`, so this crate stays free of any gRPC
//! dependency.

use thiserror::Error;

/// Result type used throughout the core.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Driver error taxonomy (design spec §7).
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    /// Missing required field, unknown parameter key, unsupported access
    /// mode, or a capacity request outside the valid range. Non-retriable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Volume/snapshot/VM absent. Callers on the destroy path treat this as
    /// success; callers elsewhere propagate it.
    #[error("not found: {0}")]
    NotFound(String),

    /// Name collision with semantically different parameters. Non-retriable.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The resource exists but is in the wrong state for the requested
    /// operation. Caller decides whether to retry.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Snapshot in `error`, no free device slot, or a quota ceiling.
    /// Retriable only after the caller remediates.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Request coalescing observed a conflicting in-flight operation.
    #[error("aborted: {0}")]
    Aborted(String),

    /// The backoff engine exhausted its step count before converging.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// A cloud invariant was violated (e.g. more than one volume matched a
    /// unique name). Surfaced for operator attention.
    #[error("internal error: {0}")]
    Internal(String),

    /// Throttling, network failure, or a 5xx from the cloud. Retriable.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl DriverError {
    /// Wrap this error with operation/resource context, preserving kind.
    ///
    /// `bsu-coordinator` uses this to attach `(operation, volume_id)`
    /// without reinterpreting the underlying classification (§7
    /// "Propagation policy").
    #[must_use]
    pub fn with_context(self, context: impl Into<String>) -> Self {
        let context = context.into();
        match self {
            Self::InvalidArgument(m) => Self::InvalidArgument(format!("{context}: {m}")),
            Self::NotFound(m) => Self::NotFound(format!("{context}: {m}")),
            Self::AlreadyExists(m) => Self::AlreadyExists(format!("{context}: {m}")),
            Self::FailedPrecondition(m) => Self::FailedPrecondition(format!("{context}: {m}")),
            Self::ResourceExhausted(m) => Self::ResourceExhausted(format!("{context}: {m}")),
            Self::Aborted(m) => Self::Aborted(format!("{context}: {m}")),
            Self::DeadlineExceeded(m) => Self::DeadlineExceeded(format!("{context}: {m}")),
            Self::Internal(m) => Self::Internal(format!("{context}: {m}")),
            Self::Unavailable(m) => Self::Unavailable(format!("{context}: {m}")),
        }
    }

    /// True for `not-found` responses on idempotent destroy paths, where the
    /// caller treats absence as success rather than propagating the error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True for kinds the §7 table marks retriable without caller
    /// remediation (as opposed to `resource-exhausted`, which requires the
    /// caller to act first).
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Aborted(_) | Self::DeadlineExceeded(_) | Self::Unavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_preserves_kind() {
        let err = DriverError::NotFound("vol-1".into()).with_context("delete-volume");
        assert!(matches!(err, DriverError::NotFound(_)));
        assert!(err.to_string().contains("delete-volume"));
    }

    #[test]
    fn retriable_classification() {
        assert!(DriverError::Unavailable("throttled".into()).is_retriable());
        assert!(!DriverError::ResourceExhausted("no slots".into()).is_retriable());
        assert!(!DriverError::AlreadyExists("dup".into()).is_retriable());
    }
}
