use thiserror::Error;

use crate::tensor::Shape;

/// Main error type for recoverable failures.
///
/// Programmer errors (wrong rank, index out of bounds, seed length, non-contiguous
/// buffers handed to a backend) are not represented here; they panic with a
/// `contract violation:` message instead.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CrucibleError {
    /// Operand shapes cannot be broadcast against each other
    #[error("{operation}: shapes {lhs} and {rhs} are not broadcastable")]
    Broadcast {
        operation: &'static str,
        lhs: Shape,
        rhs: Shape,
    },

    /// Inner or batch dimensions disagree (matmul and friends)
    #[error("{operation}: dimension mismatch between {lhs} and {rhs}")]
    DimensionMismatch {
        operation: &'static str,
        lhs: Shape,
        rhs: Shape,
    },

    /// The kernel has no rule for this rank combination
    #[error("{operation}: unsupported rank combination {lhs} x {rhs}")]
    UnsupportedRank {
        operation: &'static str,
        lhs: Shape,
        rhs: Shape,
    },

    /// Operands must share one shape
    #[error("{operation}: expected shape {expected}, got {got}")]
    ShapeMismatch {
        operation: &'static str,
        expected: Shape,
        got: Shape,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Backend construction errors
    #[error("Backend error: {0}")]
    BackendError(String),

    /// IO errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl CrucibleError {
    pub fn broadcast(operation: &'static str, lhs: &Shape, rhs: &Shape) -> Self {
        CrucibleError::Broadcast {
            operation,
            lhs: lhs.clone(),
            rhs: rhs.clone(),
        }
    }

    pub fn dimension_mismatch(operation: &'static str, lhs: &Shape, rhs: &Shape) -> Self {
        CrucibleError::DimensionMismatch {
            operation,
            lhs: lhs.clone(),
            rhs: rhs.clone(),
        }
    }

    pub fn unsupported_rank(operation: &'static str, lhs: &Shape, rhs: &Shape) -> Self {
        CrucibleError::UnsupportedRank {
            operation,
            lhs: lhs.clone(),
            rhs: rhs.clone(),
        }
    }

    pub fn shape_mismatch(operation: &'static str, expected: &Shape, got: &Shape) -> Self {
        CrucibleError::ShapeMismatch {
            operation,
            expected: expected.clone(),
            got: got.clone(),
        }
    }

    /// Name of the kernel that raised the error, for shape-class errors
    pub fn operation(&self) -> Option<&'static str> {
        match self {
            CrucibleError::Broadcast { operation, .. }
            | CrucibleError::DimensionMismatch { operation, .. }
            | CrucibleError::UnsupportedRank { operation, .. }
            | CrucibleError::ShapeMismatch { operation, .. } => Some(operation),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CrucibleError {
    fn from(err: std::io::Error) -> Self {
        CrucibleError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for CrucibleError {
    fn from(err: serde_json::Error) -> Self {
        CrucibleError::SerializationError(err.to_string())
    }
}

/// Result type for Crucible operations
pub type CrucibleResult<T> = Result<T, CrucibleError>;

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotBroadcastable,
    DimensionMismatch,
    UnsupportedRank,
    ShapeMismatch,
    ConfigInvalid,
    BackendUnavailable,
    IoFailed,
    SerializationFailed,
}

impl CrucibleError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            CrucibleError::Broadcast { .. } => ErrorCode::NotBroadcastable,
            CrucibleError::DimensionMismatch { .. } => ErrorCode::DimensionMismatch,
            CrucibleError::UnsupportedRank { .. } => ErrorCode::UnsupportedRank,
            CrucibleError::ShapeMismatch { .. } => ErrorCode::ShapeMismatch,
            CrucibleError::ConfigurationError(_) => ErrorCode::ConfigInvalid,
            CrucibleError::BackendError(_) => ErrorCode::BackendUnavailable,
            CrucibleError::IoError(_) => ErrorCode::IoFailed,
            CrucibleError::SerializationError(_) => ErrorCode::SerializationFailed,
        }
    }

    /// Shape-class errors can be fixed by the caller and retried
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::NotBroadcastable
                | ErrorCode::DimensionMismatch
                | ErrorCode::UnsupportedRank
                | ErrorCode::ShapeMismatch
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_error_message() {
        let error = CrucibleError::broadcast("add", &Shape::from(vec![3, 2]), &Shape::from(vec![3]));
        assert_eq!(error.to_string(), "add: shapes [3, 2] and [3] are not broadcastable");
        assert_eq!(error.operation(), Some("add"));
    }

    #[test]
    fn test_error_codes() {
        let error = CrucibleError::dimension_mismatch("matmul", &Shape::from(vec![2, 3]), &Shape::from(vec![4, 2]));
        assert_eq!(error.code(), ErrorCode::DimensionMismatch);
        assert!(error.is_recoverable());

        let config_error = CrucibleError::ConfigurationError("block_size".to_string());
        assert_eq!(config_error.code(), ErrorCode::ConfigInvalid);
        assert!(!config_error.is_recoverable());
        assert_eq!(config_error.operation(), None);
    }

    #[test]
    fn test_only_shape_errors_are_recoverable() {
        let shape = Shape::from(vec![2]);
        let recoverable = [
            CrucibleError::broadcast("add", &shape, &shape),
            CrucibleError::dimension_mismatch("matmul", &shape, &shape),
            CrucibleError::unsupported_rank("matmul", &shape, &shape),
            CrucibleError::shape_mismatch("mse_loss", &shape, &shape),
        ];
        assert!(recoverable.iter().all(|e| e.is_recoverable() && e.operation().is_some()));

        let fatal = [
            CrucibleError::ConfigurationError("block_size".to_string()),
            CrucibleError::BackendError("pool".to_string()),
            CrucibleError::IoError("missing".to_string()),
            CrucibleError::SerializationError("eof".to_string()),
        ];
        assert!(fatal.iter().all(|e| !e.is_recoverable() && e.operation().is_none()));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let error: CrucibleError = io.into();
        assert_eq!(error.code(), ErrorCode::IoFailed);
    }
}
