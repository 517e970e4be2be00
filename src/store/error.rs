//! Error kinds the store contract returns.

/// Error kinds returned by any [`super::Store`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Bad input, user-visible.
    #[error("parameter error: {0}")]
    Parameter(String),

    /// Transient backend connectivity failure.
    #[error("connection error: {0}")]
    Conn(String),

    #[error("storage get failed: {0}")]
    StorageGet(String),

    #[error("storage put failed: {0}")]
    StoragePut(String),

    #[error("storage delete failed: {0}")]
    StorageDelete(String),

    #[error("storage create failed: {0}")]
    StorageCreate(String),

    /// Internal invariant violated.
    #[error("internal bug: {0}")]
    Bug(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl StoreError {
    /// Whether a backend call failing with this error should be retried
    /// (the class of 408/429/5xx and service-specific Busy/Timeout/InternalError).
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            StoreError::Conn(_)
                | StoreError::StorageGet(_)
                | StoreError::StoragePut(_)
                | StoreError::StorageDelete(_)
                | StoreError::StorageCreate(_)
        )
    }
}
