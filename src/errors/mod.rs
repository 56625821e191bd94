//! Centralized error handling for the crawl scheduler
//!
//! # Error Categories
//!
//! - **Validation Errors**: malformed requests, rejected with no side effect
//! - **Store Errors**: the durable store is unreachable or rejected a command
//! - **Upstream Errors**: the extraction worker failed a dispatched task
//!
//! # Usage
//!
//! ```rust
//! use spiderbot_scheduler::errors::{AppError, AppResult};
//!
//! fn require_url(url: Option<&str>) -> AppResult<&str> {
//!     url.ok_or_else(|| AppError::validation("URL is required"))
//! }
//! ```

pub mod types;

pub use types::*;

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Convenience type alias for store Results
pub type StoreResult<T> = Result<T, StoreError>;

/// Convenience type alias for extraction worker Results
pub type UpstreamResult<T> = Result<T, UpstreamError>;
