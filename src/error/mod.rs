//! Error handling for aggregation and cursor operations.
//!
//! This module provides:
//! - The error taxonomy surfaced by the aggregate driver and batch cursor
//! - Classification of MongoDB driver errors into that taxonomy
//! - Consistent JSON error formatting for the CLI and logging
//!
//! # Example
//!
//! ```rust
//! use aggcursor::error::{AggError, TransportError};
//! use aggcursor::error::mongo::extract_error_info;
//!
//! let err = AggError::from(TransportError::retryable("connection reset"));
//! assert!(err.is_retryable());
//! println!("{}", extract_error_info(&err).to_json().unwrap());
//! ```

pub mod kinds;
pub mod mongo;

// Re-export commonly used types
pub use kinds::{
    AggError, CURSOR_NOT_FOUND, CommandError, ConfigError, Result, TransportError,
};
pub use mongo::{ErrorInfo, extract_error_info};
