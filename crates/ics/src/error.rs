//! Error taxonomy for synchronization requests

/// Errors surfaced to the RPC layer
///
/// Store implementations report failures as `anyhow::Error`; those are
/// wrapped as [`IcsError::Storage`] and are the only retryable kind.
#[derive(Debug, thiserror::Error)]
pub enum IcsError {
    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl IcsError {
    /// Whether the client may retry the identical request with the same cursor
    pub fn is_retryable(&self) -> bool {
        matches!(self, IcsError::Storage(_))
    }
}

pub type IcsResult<T> = Result<T, IcsError>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_storage_is_retryable() {
        let err: IcsError = anyhow::anyhow!("disk I/O error").into();
        assert!(err.is_retryable());
        assert!(!IcsError::NotSupported("unscoped initial sync".into()).is_retryable());
        assert!(!IcsError::InvalidState("bad row".into()).is_retryable());
    }

    #[test]
    fn test_storage_message_keeps_context() {
        let result: anyhow::Result<()> =
            Err(anyhow::anyhow!("locked")).context("Failed to load snapshot");
        let err = IcsError::from(result.unwrap_err());
        assert_eq!(err.to_string(), "Storage error: Failed to load snapshot: locked");
    }
}
