// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication harness.
//!
//! Errors are split in two layers:
//!
//! - [`CouchError`]: what the document-database collaborator reports
//!   (HTTP status, transport failure, missing resource, revision conflict).
//! - [`HarnessError`]: what the harness itself raises. Collaborator errors
//!   are wrapped via `#[from]`.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Couch` | Depends | Transport errors, 5xx, 408/429 are transient |
//! | `Config` | No | Invalid prefix, range, settings, or filter request |
//! | `Topology` | No | Range cardinalities don't fit the pattern |
//! | `BulkWrite` | No | Synthetic fill was rejected by the database |
//! | `RetryTimeoutExceeded` | No | A polled condition never became true |
//! | `Cluster` | No | Local cluster manager failure |
//!
//! # Retry Behavior
//!
//! The retry combinator in [`crate::resilience`] swallows *every* attempt
//! failure until its deadline. [`HarnessError::is_retryable()`] exists for
//! callers that want to decide for themselves (e.g. connection setup).

use std::time::Duration;
use thiserror::Error;

/// Result type alias for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Result type for document-database collaborator operations.
pub type CouchResult<T> = std::result::Result<T, CouchError>;

/// Errors reported by a document-database collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CouchError {
    /// Database or document does not exist.
    #[error("not found: {resource}")]
    NotFound { resource: String },

    /// Stale or missing `_rev` on a write, or resource already exists.
    #[error("conflict: {resource}")]
    Conflict { resource: String },

    /// Any other non-success HTTP status.
    #[error("HTTP {status} ({error}): {reason}")]
    Http {
        status: u16,
        error: String,
        reason: String,
    },

    /// Connection refused, reset, timed out, etc.
    #[error("transport error: {0}")]
    Transport(String),

    /// Response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// URL could not be parsed or built.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl CouchError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn conflict(resource: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
        }
    }

    /// Transient failures worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::NotFound { .. } => false,
            Self::Conflict { .. } => false,
            Self::Decode(_) => false,
            Self::InvalidUrl(_) => false,
        }
    }
}

/// Errors raised by the harness.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Invalid or inconsistent configuration.
    ///
    /// Raised before any I/O: malformed prefix, bad range, more than one
    /// filter kind, malformed cluster settings, missing cluster.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source/target ranges don't satisfy the topology's cardinality rules.
    #[error("Invalid {pattern} topology: {reason}")]
    Topology { pattern: String, reason: String },

    /// Document-database collaborator failure.
    #[error("Database error: {0}")]
    Couch(#[from] CouchError),

    /// Synthetic document fill was rejected for one or more documents.
    #[error("Bulk write to {db} failed for {} document(s): {}", failures.len(), summarize(failures))]
    BulkWrite {
        db: String,
        failures: Vec<crate::couch::BulkFailure>,
    },

    /// A retried operation never satisfied its success check.
    #[error("Retry timeout exceeded for {operation}: {timeout:?}")]
    RetryTimeoutExceeded { operation: String, timeout: Duration },

    /// Local cluster manager failure.
    #[error("Cluster error: {0}")]
    Cluster(String),
}

fn summarize(failures: &[crate::couch::BulkFailure]) -> String {
    failures
        .iter()
        .take(3)
        .map(|f| format!("{} ({})", f.id, f.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

impl HarnessError {
    /// Create a topology validation error.
    pub fn topology(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Topology {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Couch(e) => e.is_transient(),
            Self::Config(_) => false,
            Self::Topology { .. } => false,
            Self::BulkWrite { .. } => false,
            Self::RetryTimeoutExceeded { .. } => false,
            Self::Cluster(_) => false,
        }
    }

    /// The configured timeout, if this is a retry timeout.
    pub fn retry_timeout(&self) -> Option<Duration> {
        match self {
            Self::RetryTimeoutExceeded { timeout, .. } => Some(*timeout),
            _ => None,
        }
    }
}
