//! # Switchyard
//!
//! Action execution and observability pipeline for interactive tools: every
//! user-triggered action runs through one orchestrator that traces it, tracks
//! busy state, normalizes its result and fans the result out to listeners.
//!
//! ## Architecture
//!
//! ```text
//! UI callback
//!     │
//!     ▼ run(name, options, op)
//! Orchestrator
//!     ├─► SelectionTracker / provider   (VALIDATING)
//!     ├─► TraceHub        ACTION_START  (STARTED)
//!     ├─► BusyCounter     start         (busy guard)
//!     ├─► op().await                    (EXECUTING)
//!     ├─► TraceHub        ACTION_END | ACTION_ERROR
//!     ├─► OutcomeBus      publish ──► toast, status bar, logger ...
//!     └─► BusyCounter     stop
//!     │
//!     ▼
//! Outcome
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One outcome per action** - `run` never returns an error; failures,
//!    panics and cancellation all become an [`Outcome`]
//! 2. **Paired trace** - every `ACTION_START` has exactly one closing
//!    `ACTION_END` or `ACTION_ERROR` with the same [`CorrelationId`]
//! 3. **Busy never stranded** - the busy reference is released on every exit
//!    path, including a dropped future
//! 4. **Isolated listeners** - a failing listener or callback becomes a
//!    diagnostic trace event and never affects its siblings
//! 5. **Clean messages** - error chains and panic payloads live only in trace
//!    meta, never in the outcome message
//!
//! ## Example
//!
//! ```ignore
//! use switchyard::{ActionError, ConfirmOptions, Orchestrator, Outcome, PipelineConfig, RunOptions};
//!
//! switchyard::telemetry::init_tracing();
//!
//! let orchestrator = Orchestrator::builder()
//!     .with_config(PipelineConfig::from_env()?)
//!     .build()?;
//!
//! orchestrator.bus().subscribe(|outcome: &Outcome| -> anyhow::Result<()> {
//!     println!("[{}] {}", outcome.severity(), outcome.message());
//!     Ok(())
//! });
//!
//! orchestrator.selections().update_selection("clients", ["c-17", "c-42"]);
//!
//! let outcome = orchestrator
//!     .run_with_confirmation(
//!         "disconnect clients",
//!         ConfirmOptions::new()
//!             .text("Disconnect the selected clients?")
//!             .trigger_data_change(true)
//!             .run_options(
//!                 RunOptions::new()
//!                     .selection(orchestrator.selections().provider("clients"))
//!                     .require_selection(true),
//!             ),
//!         || async {
//!             disconnect_all().await?;
//!             Ok::<_, ActionError>(Outcome::success("CLIENT_DISCONNECT_OK", "Disconnected"))
//!         },
//!     )
//!     .await;
//!
//! for event in orchestrator.trace().export_recent(20, None, outcome.correlation_id()) {
//!     println!("{} {:?}", event.kind, event.message);
//! }
//! ```

// Core modules
mod bus;
mod busy;
mod confirm;
mod core;
mod engine;
mod error;
mod outcome;
mod request;
mod selection;
mod sink;
mod trace;

pub mod config;
pub mod telemetry;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export identifiers
pub use crate::core::{CorrelationId, SubscriptionId};

// Re-export error types
pub use crate::error::{ActionError, SwitchyardError};

// Re-export outcome types
pub use crate::outcome::{codes, ActionOutput, LegacyStatus, Outcome, PartialFailure, Severity};

// Re-export trace types
pub use crate::trace::{
    EventKind, TraceDraft, TraceEvent, TraceHub, TraceLevel, DEFAULT_META_MAX_BYTES,
    DEFAULT_TRACE_CAPACITY,
};
pub use crate::sink::DEFAULT_SINK_QUEUE;

// Re-export busy types
pub use busy::{BusyCounter, BusyGuard};

// Re-export selection types
pub use selection::{SelectionDiff, SelectionListener, SelectionTracker, TableSelection};

// Re-export bus types
pub use bus::{OutcomeBus, OutcomeListener};

// Re-export confirmation types
pub use confirm::{ConfirmRequest, ConfirmationDialog, ConfirmationGate};

// Re-export request options
pub use request::{CancelToken, ConfirmOptions, RunOptions, SelectionProvider};

// Re-export engine types (primary entry point)
pub use engine::{InvocationState, Orchestrator, OrchestratorBuilder};

pub use config::PipelineConfig;

// Re-export commonly used external types
pub use async_trait::async_trait;
