use thiserror::Error;

/// Validation failures when constructing a [`LoadTest`](crate::LoadTest).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoadTestError {
    #[error("missing request id")]
    MissingRequestId,
    #[error("missing method or url")]
    MissingMethodOrUrl,
}
