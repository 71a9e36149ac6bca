//! # Engrammar
//!
//! A personal lesson-memory engine for an AI coding assistant.
//!
//! Engrammar extracts short, reusable "lessons" (*engrams*) from past
//! coding sessions, stores them with provenance and environmental
//! prerequisites, retrieves the most relevant ones when a new prompt or
//! tool-use event occurs, and continuously refines which lessons are
//! surfaced where by scoring their outcomes.
//!
//! The four core subsystems are the [`storage`] layer's [`EngramStore`]
//! trait, the dense/lexical hybrid retriever in [`services::retriever`],
//! the EMA-driven [`services::evaluator`], and the LLM-assisted
//! [`services::dedup`] engine. [`context`] supplies the environment probe
//! they all gate against.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// multiple_crate_versions is inherently crate-level (duplicate transitive deps
// pulled in by fastembed's ort backend).
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

pub mod cli;
pub mod config;
pub mod context;
pub mod embedding;
pub mod hooks;
pub mod llm;
pub mod models;
pub mod observability;
pub mod services;
pub mod storage;

pub use config::EngrammarConfig;
pub use context::{Environment, EnvironmentProbe};
pub use embedding::Embedder;
pub use storage::{EngramStore, VectorIndex};

/// Error type for engrammar operations.
///
/// A `thiserror`-based error enum covering a generic caller-input error,
/// a generic operation failure, and two additions that let retry and
/// validation logic match on a specific class instead of string-sniffing
/// an `OperationFailed` cause.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Caller supplied invalid input: empty text, a category that
    /// normalizes to empty, an id that does not exist, and similar.
    /// Tools surface this with a non-zero exit and a short message;
    /// internal reads instead default to lenient behavior per §7.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An operation failed for reasons outside the caller's input:
    /// storage I/O, a poisoned lock, a malformed on-disk index.
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// The transient-external error class (§7): an LLM subprocess
    /// timed out, exited non-zero, or returned unparsable output; a
    /// transcript file could not be read. Recovered by marking the
    /// affected session or batch failed and incrementing a retry
    /// counter, never by failing the whole operation.
    #[error("transient failure in '{operation}': {cause}")]
    Transient {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// The invariant-violation error class (§7): an LLM response failed
    /// structured validation. Valid groups or entries within the same
    /// response are still applied; only the invalid parts are dropped.
    #[error("validation failed: {detail}")]
    Validation {
        /// What failed validation.
        detail: String,
    },
}

/// Result type alias for engrammar operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages_are_short_and_actionable() {
        let err = Error::InvalidInput("text must not be empty".to_string());
        assert_eq!(err.to_string(), "invalid input: text must not be empty");

        let err = Error::OperationFailed { operation: "add".to_string(), cause: "disk full".to_string() };
        assert_eq!(err.to_string(), "operation 'add' failed: disk full");

        let err = Error::Transient { operation: "evaluate".to_string(), cause: "timeout".to_string() };
        assert_eq!(err.to_string(), "transient failure in 'evaluate': timeout");

        let err = Error::Validation { detail: "group too small".to_string() };
        assert_eq!(err.to_string(), "validation failed: group too small");
    }
}
