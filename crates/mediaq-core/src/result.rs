//! Convenience result type alias for mediaq.

use crate::error::AppError;

/// A specialized `Result` type for synchronous scheduler operations.
pub type AppResult<T> = Result<T, AppError>;
