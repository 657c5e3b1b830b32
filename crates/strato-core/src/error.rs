use thiserror::Error;

/// Error taxonomy shared by every strato component.
///
/// Synchronous verbs return the first error raised; asynchronous failures
/// are recovered locally (state revert + event-log append) and never reach
/// the original caller. Variants carry a human-readable subject so the API
/// layer can map them onto its own status codes without parsing messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Instance, block device, workload, tenant, or pool is missing.
    #[error("{0} not found")]
    NotFound(String),

    /// The entity belongs to another tenant.
    #[error("{0} is owned by another tenant")]
    Ownership(String),

    /// The entity is in the wrong state for the requested operation.
    #[error("{0}")]
    Precondition(String),

    /// A quota consume was denied.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The entity is referenced by something else (mapped IP, non-empty pool).
    #[error("{0}")]
    ResourceBusy(String),

    /// Malformed payload or illegal combination of fields.
    #[error("{0}")]
    BadRequest(String),

    /// Node unreachable, appliance launch failed; the caller may retry.
    #[error("{0}")]
    Transient(String),

    /// Store corruption or bootstrap failure; the process aborts.
    #[error("{0}")]
    Fatal(String),
}

impl CoreError {
    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{kind} {id}"))
    }

    pub fn ownership(kind: &str, id: impl std::fmt::Display) -> Self {
        Self::Ownership(format!("{kind} {id}"))
    }

    /// True for errors the caller may retry without changing the request.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = CoreError::not_found("instance", "i-123");
        assert_eq!(err.to_string(), "instance i-123 not found");
    }

    #[test]
    fn test_transient_predicate() {
        assert!(CoreError::Transient("node unreachable".into()).is_transient());
        assert!(!CoreError::BadRequest("bad".into()).is_transient());
    }
}
