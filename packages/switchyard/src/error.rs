//! Structured error types for switchyard.
//!
//! Two families live here:
//! - [`ActionError`] is what a supplied operation returns when it does not
//!   produce a value. The orchestrator converts it into an
//!   [`Outcome`](crate::Outcome) at its boundary; it never reaches the UI.
//! - [`SwitchyardError`] covers infrastructure failures of the pipeline
//!   itself (configuration, trace sink), returned as ordinary `Result`s.
//!
//! # The Boundary Rule
//!
//! > **No `anyhow::Error` ever crosses `Orchestrator::run`.**
//!
//! - `anyhow` is internal transport (ergonomic for operations)
//! - the returned `Outcome` is the only externalized result
//!
//! # Example
//!
//! ```ignore
//! use switchyard::{ActionError, ActionOutput};
//!
//! let outcome = orchestrator
//!     .run("backup_db", RunOptions::new(), || async {
//!         let path = store.backup().await?; // anyhow::Error -> ActionError
//!         if path.is_none() {
//!             return Err(ActionError::Cancelled);
//!         }
//!         Ok(ActionOutput::raw(path))
//!     })
//!     .await;
//! ```

use std::path::PathBuf;

use thiserror::Error;

/// Failure returned by an action operation.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The operation observed a cancellation request and stopped early.
    #[error("action cancelled")]
    Cancelled,

    /// The operation failed. The message becomes the user-facing outcome
    /// message; the full chain is kept in the trace only.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl ActionError {
    /// Build a failure from a plain message.
    pub fn msg(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        Self::Failed(anyhow::Error::msg(message))
    }

    /// Returns true if this is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ActionError::Cancelled)
    }
}

/// Structured error type for pipeline infrastructure.
#[derive(Debug, Error)]
pub enum SwitchyardError {
    /// The JSONL trace sink could not be opened.
    #[error("failed to open trace sink at {}: {source}", path.display())]
    SinkOpen {
        /// Path that was requested.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The trace sink writer thread could not be started.
    #[error("failed to start trace sink writer: {source}")]
    SinkSpawn {
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration value could not be parsed or was out of range.
    #[error("invalid value {value:?} for {key}")]
    InvalidConfig {
        /// Environment variable name.
        key: &'static str,
        /// Raw value as found.
        value: String,
    },
}
