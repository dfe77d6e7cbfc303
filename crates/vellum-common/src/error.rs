//! Error types for VellumDB.

use thiserror::Error;

/// Result type alias using VellumError.
pub type Result<T> = std::result::Result<T, VellumError>;

/// Errors that can occur in VellumDB operations.
#[derive(Debug, Error)]
pub enum VellumError {
    // I/O and backend errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend error: {0}")]
    Backend(String),

    // Storage errors
    #[error("page not found: {id}")]
    PageNotFound { id: u64 },

    #[error("page corrupted: {0}")]
    Corrupt(String),

    // Tree errors
    #[error("another operation is already in flight")]
    Busy,

    #[error("invalid key: {0}")]
    KeyInvalid(String),
}

impl VellumError {
    /// Builds a Corrupt error from anything displayable.
    pub fn corrupt(reason: impl Into<String>) -> Self {
        VellumError::Corrupt(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: VellumError = io_err.into();
        assert!(matches!(err, VellumError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_page_not_found_display() {
        let err = VellumError::PageNotFound { id: 42 };
        assert_eq!(err.to_string(), "page not found: 42");
    }

    #[test]
    fn test_corrupt_display() {
        let err = VellumError::corrupt("type tag 9 is not a page type");
        assert_eq!(err.to_string(), "page corrupted: type tag 9 is not a page type");
    }

    #[test]
    fn test_busy_display() {
        let err = VellumError::Busy;
        assert_eq!(err.to_string(), "another operation is already in flight");
    }

    #[test]
    fn test_backend_display() {
        let err = VellumError::Backend("connection reset".to_string());
        assert_eq!(err.to_string(), "backend error: connection reset");
    }

    #[test]
    fn test_key_invalid_display() {
        let err = VellumError::KeyInvalid("null separator in comparison".to_string());
        assert_eq!(err.to_string(), "invalid key: null separator in comparison");
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(VellumError::Busy)
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<VellumError>();
    }
}
