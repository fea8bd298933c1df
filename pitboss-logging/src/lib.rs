//! Logging infrastructure for Pitboss
//!
//! This crate provides:
//! - Tracing subscriber setup driven by `LoggingConfig`
//! - Structured reporting of errors surfaced by the pool

pub mod error_info;
pub mod init;

// Re-export main types for convenience
pub use error_info::{log_classified, ErrorInfo, ErrorSuggestions};
pub use init::{
    build_env_filter, init_logging_from_config, init_simple_tracing, init_stderr_tracing,
};
