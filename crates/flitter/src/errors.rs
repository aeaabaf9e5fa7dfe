//! Typed errors crossing the engine boundary.
//!
//! Program-level failures (unbound names, bad builtin calls) are not Rust
//! errors: they accumulate as strings in the evaluation context. The types
//! here cover the parser interface, renderer workers and the scheduler.

use thiserror::Error;

/// A source-location-tagged parse failure, produced by the external parser.
#[derive(Debug, Clone, Error)]
#[error("parse error at line {line} column {column}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl ParseError {
    #[must_use]
    pub fn new(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("renderer failed: {0}")]
    Failed(String),
    #[error("no renderer available for '{kind}'")]
    Unavailable { kind: String },
    #[error("renderer worker stopped")]
    WorkerStopped,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no program pages loaded")]
    NoPages,
    #[error("state file error: {0}")]
    StateFile(String),
}
