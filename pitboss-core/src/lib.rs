//! Core types for Pitboss
//!
//! This crate holds the failure taxonomy shared by every other Pitboss crate:
//! raw failure signals, the category/severity/strategy enums, the error
//! context attached to each failure, and the pure classifier that maps one to
//! the other.

pub mod classify;
pub mod error;

// Re-export commonly used types
pub use classify::{classify, ErrorClassifier};
pub use error::{
    ClassifiedError, ErrorCategory, ErrorContext, ErrorReason, ErrorRecord, FailureSignal,
    RecoveryStrategy, Severity, StrategyOverride,
};
