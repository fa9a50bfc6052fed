//! Utility modules.

pub mod file;
pub mod retry;
pub mod text;

pub use file::{calculate_bytes_checksum, calculate_checksum, calculate_file_checksum, write_atomic};
pub use retry::{RetryConfig, RetryResult, Retryable, with_retry};
