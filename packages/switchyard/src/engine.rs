//! Orchestrator: the one entry point every UI callback goes through.
//!
//! ```text
//! run(name, options, op)
//!   VALIDATING  selection provider (optional)  ──► warn outcome, stop
//!   STARTED     ACTION_START
//!               busy guard acquired
//!   EXECUTING   op().await  (raced against CancelToken, panics caught)
//!   FINALIZED   ACTION_END | ACTION_ERROR
//!               OutcomeBus::publish
//!               busy guard released
//! ```
//!
//! Whatever the operation does (returns, fails, panics, is cancelled) the
//! caller gets exactly one [`Outcome`] back and never an error. Technical
//! detail (error chains, panic payloads) goes to the trace hub only.
//!
//! # Usage
//!
//! ```ignore
//! let orchestrator = Orchestrator::builder()
//!     .with_config(PipelineConfig::from_env()?)
//!     .with_dialog(MyDialog::new(window))
//!     .with_busy_callbacks(|| spinner.show(), || spinner.hide())
//!     .build()?;
//!
//! let outcome = orchestrator
//!     .run(
//!         "delete files",
//!         RunOptions::new()
//!             .selection(orchestrator.selections().provider("files"))
//!             .require_selection(true),
//!         || async move {
//!             let removed = store.delete(&ids).await?;
//!             Ok(Outcome::success("FILE_DELETE_OK", format!("Deleted {removed} files")))
//!         },
//!     )
//!     .await;
//! ```
//!
//! # Pairing
//!
//! Every `ACTION_START` gets exactly one closing `ACTION_END` or
//! `ACTION_ERROR` with the same correlation id. If the `run` future is
//! dropped mid-flight the invocation guard writes an `ACTION_ERROR`
//! ("aborted") and the busy guard releases.

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::bus::OutcomeBus;
use crate::busy::BusyCounter;
use crate::config::PipelineConfig;
use crate::confirm::{ConfirmRequest, ConfirmationDialog, ConfirmationGate};
use crate::core::{action_scope, panic_message, truncate_text, CorrelationId, SubscriptionId};
use crate::error::{ActionError, SwitchyardError};
use crate::outcome::{codes, ActionOutput, Outcome, Severity};
use crate::request::{ConfirmOptions, RunOptions};
use crate::selection::SelectionTracker;
use crate::trace::{EventKind, TraceDraft, TraceHub, TraceLevel};

/// Cap on the error chain / panic summary stored in `ACTION_ERROR` meta.
const ERROR_SUMMARY_MAX_BYTES: usize = 2048;

type DataChangeCallback = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type BusyCallback = Arc<dyn Fn() + Send + Sync>;

// =============================================================================
// Invocation State
// =============================================================================

/// Lifecycle of one invocation, recorded as `state` in trace meta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationState {
    Validating,
    Started,
    Executing,
    Succeeded,
    Warned,
    Failed,
    Cancelled,
    Finalized,
}

impl InvocationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationState::Validating => "validating",
            InvocationState::Started => "started",
            InvocationState::Executing => "executing",
            InvocationState::Succeeded => "succeeded",
            InvocationState::Warned => "warned",
            InvocationState::Failed => "failed",
            InvocationState::Cancelled => "cancelled",
            InvocationState::Finalized => "finalized",
        }
    }

    /// Terminal state for an outcome the operation produced itself.
    fn of(outcome: &Outcome) -> Self {
        if outcome.is_cancelled() {
            InvocationState::Cancelled
        } else if outcome.is_success() {
            InvocationState::Succeeded
        } else if outcome.severity() == Severity::Error {
            InvocationState::Failed
        } else {
            InvocationState::Warned
        }
    }
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Invocation Guard (RAII)
// =============================================================================

/// Writes the closing trace event for one started invocation.
///
/// `finish` records `ACTION_END` / `ACTION_ERROR` explicitly; dropping an
/// unfinished guard (future dropped, panic unwinding through `protect`)
/// records `ACTION_ERROR` with reason `aborted`.
struct InvocationGuard {
    trace: Arc<TraceHub>,
    cid: CorrelationId,
    action: String,
    started: Instant,
    finished: bool,
}

impl InvocationGuard {
    fn start(trace: Arc<TraceHub>, cid: CorrelationId, action: &str, meta: Map<String, Value>) -> Self {
        trace.emit(
            TraceDraft::new(EventKind::ActionStart, TraceLevel::Info)
                .correlation_id(cid)
                .action(action)
                .message(format!("{} started", action))
                .meta(&meta),
        );
        Self {
            trace,
            cid,
            action: action.to_string(),
            started: Instant::now(),
            finished: false,
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn finish(&mut self, kind: EventKind, level: TraceLevel, message: &str, mut meta: Map<String, Value>) {
        self.finished = true;
        meta.insert("elapsed_ms".into(), Value::from(self.elapsed_ms()));
        self.trace.emit(
            TraceDraft::new(kind, level)
                .correlation_id(self.cid)
                .action(self.action.clone())
                .message(message)
                .meta(&meta),
        );
    }
}

impl Drop for InvocationGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(cid = %self.cid, action = %self.action, "invocation dropped before completion");
        let mut meta = Map::new();
        meta.insert("state".into(), Value::from(InvocationState::Finalized.as_str()));
        meta.insert("reason".into(), Value::from("aborted"));
        let message = format!("{} aborted", self.action);
        self.finish(EventKind::ActionError, TraceLevel::Error, &message, meta);
    }
}

// =============================================================================
// Execution Result
// =============================================================================

/// What the awaited operation produced, before normalization.
enum Execution<O> {
    Returned(O),
    Cancelled { by_token: bool },
    Failed { message: String, chain: String },
    Panicked(String),
}

// =============================================================================
// Orchestrator
// =============================================================================

struct Inner {
    trace: Arc<TraceHub>,
    busy: Arc<BusyCounter>,
    bus: Arc<OutcomeBus>,
    selections: Arc<SelectionTracker>,
    gate: ConfirmationGate,
    data_change: RwLock<Vec<(SubscriptionId, DataChangeCallback)>>,
    next_id: AtomicU64,
}

/// Runs user operations through the traced, busy-tracked pipeline.
///
/// Cheap to clone; all clones share the same components.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Orchestrator with default limits, no sink and no dialog.
    pub fn new() -> Self {
        Self::assemble(Arc::new(TraceHub::new()), None)
    }

    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    fn assemble(trace: Arc<TraceHub>, dialog: Option<Arc<dyn ConfirmationDialog>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                busy: Arc::new(BusyCounter::new(trace.clone())),
                bus: Arc::new(OutcomeBus::new(trace.clone())),
                selections: Arc::new(SelectionTracker::new(trace.clone())),
                gate: ConfirmationGate::new(trace.clone(), dialog),
                data_change: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                trace,
            }),
        }
    }

    pub fn trace(&self) -> &Arc<TraceHub> {
        &self.inner.trace
    }

    pub fn busy(&self) -> &Arc<BusyCounter> {
        &self.inner.busy
    }

    pub fn bus(&self) -> &Arc<OutcomeBus> {
        &self.inner.bus
    }

    pub fn selections(&self) -> &Arc<SelectionTracker> {
        &self.inner.selections
    }

    pub fn confirmation(&self) -> &ConfirmationGate {
        &self.inner.gate
    }

    // -------------------------------------------------------------------------
    // run
    // -------------------------------------------------------------------------

    /// Run `operation` as the action `action_name` and return its outcome.
    ///
    /// Never fails: errors, panics and cancellation all become outcomes.
    pub async fn run<F, Fut, O>(&self, action_name: &str, options: RunOptions, operation: F) -> Outcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<O, ActionError>>,
        O: Into<ActionOutput>,
    {
        let inner = &self.inner;
        let scope = action_scope(action_name);
        let cid = options
            .correlation_id
            .unwrap_or_else(|| inner.trace.new_correlation_id());

        // VALIDATING
        let selection = match self.validate(action_name, &options, cid) {
            Ok(selection) => selection,
            Err(outcome) => {
                inner.bus.publish(&outcome);
                return outcome;
            }
        };

        // STARTED
        let mut start_meta = options.meta.clone();
        start_meta.insert("state".into(), Value::from(InvocationState::Started.as_str()));
        if let Some(ids) = &selection {
            start_meta.insert("selection_size".into(), Value::from(ids.len()));
        }
        let mut guard = InvocationGuard::start(inner.trace.clone(), cid, action_name, start_meta);
        let busy = inner.busy.scope();

        // EXECUTING
        debug!(%cid, action = %action_name, state = %InvocationState::Executing, "awaiting operation");
        let execution = Self::execute(operation, options.cancel.as_ref()).await;

        // FINALIZED
        let outcome = match execution {
            Execution::Returned(output) => {
                let outcome = output.into().into_outcome(action_name, &scope);
                let state = InvocationState::of(&outcome);
                let (kind, level) = if outcome.severity() == Severity::Error {
                    (EventKind::ActionError, TraceLevel::Error)
                } else {
                    (EventKind::ActionEnd, TraceLevel::Info)
                };
                guard.finish(
                    kind,
                    level,
                    outcome.message(),
                    final_meta(state, json!({ "code": outcome.code() })),
                );
                outcome
            }
            Execution::Cancelled { by_token } => {
                guard.finish(
                    EventKind::ActionEnd,
                    TraceLevel::Warn,
                    &format!("{} cancelled", action_name),
                    final_meta(InvocationState::Cancelled, json!({ "by_token": by_token })),
                );
                Outcome::warn(codes::ACTION_CANCELLED, format!("{} was cancelled", action_name))
            }
            Execution::Failed { message, chain } => {
                guard.finish(
                    EventKind::ActionError,
                    TraceLevel::Error,
                    &message,
                    final_meta(
                        InvocationState::Failed,
                        json!({ "error_chain": truncate_text(&chain, ERROR_SUMMARY_MAX_BYTES) }),
                    ),
                );
                let code = format!("{}_ERROR", scope);
                Outcome::error(code.clone(), message, code, None)
            }
            Execution::Panicked(panic_msg) => {
                guard.finish(
                    EventKind::ActionError,
                    TraceLevel::Error,
                    &format!("{} panicked: {}", action_name, panic_msg),
                    final_meta(
                        InvocationState::Failed,
                        json!({ "panic": truncate_text(&panic_msg, ERROR_SUMMARY_MAX_BYTES) }),
                    ),
                );
                let code = format!("{}_ERROR", scope);
                Outcome::error(code.clone(), format!("{} failed unexpectedly", action_name), code, None)
            }
        };

        let mut outcome = outcome
            .with_duration(guard.elapsed_ms())
            .with_correlation_id(cid);
        if outcome.selection().is_none() {
            if let Some(ids) = selection {
                outcome = outcome.with_selection(ids);
            }
        }

        inner.bus.publish(&outcome);
        drop(busy);
        outcome
    }

    /// Invoke the selection provider, if any.
    ///
    /// `Ok(None)` means no provider was supplied; `Err` carries the warn
    /// outcome that ends the invocation.
    fn validate(
        &self,
        action_name: &str,
        options: &RunOptions,
        cid: CorrelationId,
    ) -> Result<Option<Vec<String>>, Outcome> {
        let Some(provider) = &options.selection_provider else {
            if options.require_selection {
                return Err(Outcome::warn(codes::EMPTY_SELECTION, "Select at least one item first")
                    .with_selection(Vec::new())
                    .with_correlation_id(cid));
            }
            return Ok(None);
        };

        let failure = match catch_unwind(AssertUnwindSafe(|| provider())) {
            Ok(Ok(ids)) => {
                if options.require_selection && ids.is_empty() {
                    debug!(%cid, action = %action_name, "empty selection, operation skipped");
                    return Err(Outcome::warn(codes::EMPTY_SELECTION, "Select at least one item first")
                        .with_selection(ids)
                        .with_correlation_id(cid));
                }
                return Ok(Some(ids));
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(panic_info) => format!("selection provider panicked: {}", panic_message(panic_info.as_ref())),
        };

        self.inner.trace.emit(
            TraceDraft::new(EventKind::CallbackError, TraceLevel::Warn)
                .correlation_id(cid)
                .action(action_name)
                .message("selection provider failed")
                .meta(&json!({
                    "state": InvocationState::Validating.as_str(),
                    "error": truncate_text(&failure, ERROR_SUMMARY_MAX_BYTES),
                })),
        );
        Err(Outcome::warn(codes::SELECTION_PROVIDER_ERROR, "Could not read the current selection")
            .with_correlation_id(cid))
    }

    async fn execute<F, Fut, O>(operation: F, cancel: Option<&crate::request::CancelToken>) -> Execution<O>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<O, ActionError>>,
    {
        // The operation is called inside the future so a panic while building
        // it is caught too.
        let caught = AssertUnwindSafe(async move { operation().await }).catch_unwind();

        let result = match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Execution::Cancelled { by_token: true },
                    result = caught => result,
                }
            }
            None => caught.await,
        };

        match result {
            Ok(Ok(output)) => Execution::Returned(output),
            Ok(Err(ActionError::Cancelled)) => Execution::Cancelled { by_token: false },
            Ok(Err(ActionError::Failed(e))) => Execution::Failed {
                message: e.to_string(),
                chain: format!("{:?}", e),
            },
            Err(panic_info) => Execution::Panicked(panic_message(panic_info.as_ref())),
        }
    }

    // -------------------------------------------------------------------------
    // run_with_confirmation
    // -------------------------------------------------------------------------

    /// Ask first, then [`run`](Self::run).
    ///
    /// A declined prompt publishes and returns the `CANCELLED` outcome without
    /// touching the selection provider or the operation. A successful run with
    /// `trigger_data_change` set awaits every data-change callback.
    pub async fn run_with_confirmation<F, Fut, O>(
        &self,
        action_name: &str,
        options: ConfirmOptions,
        operation: F,
    ) -> Outcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<O, ActionError>>,
        O: Into<ActionOutput>,
    {
        let ConfirmOptions {
            title,
            text,
            cancel_message,
            trigger_data_change,
            run,
        } = options;

        let cid = run
            .correlation_id
            .unwrap_or_else(|| self.inner.trace.new_correlation_id());
        let scope = action_scope(action_name);

        let mut request = ConfirmRequest::new(
            title.unwrap_or_else(|| "Confirm".to_string()),
            text.unwrap_or_else(|| format!("Are you sure you want to {}?", action_name)),
            format!("{}_CONFIRMED", scope),
            format!("Proceeding with {}", action_name),
        )
        .correlation_id(cid);
        request.cancel_message = cancel_message;

        let decision = self.inner.gate.confirm(&request).await;
        if decision.is_cancelled() {
            info!(%cid, action = %action_name, "confirmation declined");
            self.inner.bus.publish(&decision);
            return decision;
        }

        let outcome = self.run(action_name, run.correlation_id(cid), operation).await;

        if trigger_data_change && outcome.is_success() {
            self.fire_data_change(Some(cid)).await;
        }
        outcome
    }

    // -------------------------------------------------------------------------
    // Data-change callbacks
    // -------------------------------------------------------------------------

    /// Register an async callback fired after successful mutating actions.
    pub fn on_data_change<F, Fut>(&self, callback: F) -> SubscriptionId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_data_change(Arc::new(move || callback().boxed()))
    }

    /// Register a synchronous data-change callback.
    pub fn on_data_change_sync<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_data_change(Arc::new(move || {
            let result = callback();
            async move { result }.boxed()
        }))
    }

    /// Remove a data-change callback. Returns false if it was not registered.
    pub fn remove_data_change(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self
            .inner
            .data_change
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = callbacks.len();
        callbacks.retain(|(sid, _)| *sid != id);
        before != callbacks.len()
    }

    /// Await every data-change callback in registration order.
    ///
    /// Returns how many completed without error.
    pub async fn notify_data_changed(&self) -> usize {
        self.fire_data_change(None).await
    }

    fn register_data_change(&self, callback: DataChangeCallback) -> SubscriptionId {
        let id = SubscriptionId::from_counter(&self.inner.next_id);
        self.inner
            .data_change
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, callback));
        id
    }

    async fn fire_data_change(&self, cid: Option<CorrelationId>) -> usize {
        let snapshot: Vec<(SubscriptionId, DataChangeCallback)> = self
            .inner
            .data_change
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let mut succeeded = 0;
        for (id, callback) in snapshot {
            let result = AssertUnwindSafe(async move { callback().await })
                .catch_unwind()
                .await;
            let failure = match result {
                Ok(Ok(())) => {
                    succeeded += 1;
                    continue;
                }
                Ok(Err(e)) => format!("{:#}", e),
                Err(panic_info) => format!("callback panicked: {}", panic_message(panic_info.as_ref())),
            };
            self.inner.trace.emit(
                TraceDraft::new(EventKind::CallbackError, TraceLevel::Error)
                    .maybe_correlation_id(cid)
                    .message(format!("data-change callback {} failed: {}", id, failure))
                    .meta(&json!({ "subscription": id.to_string(), "error": failure })),
            );
        }
        succeeded
    }

    // -------------------------------------------------------------------------
    // protect
    // -------------------------------------------------------------------------

    /// Trace and busy-track `fut` like a run, but hand its result back
    /// unchanged, error included.
    pub async fn protect<T, Fut>(&self, action_name: &str, fut: Fut) -> anyhow::Result<T>
    where
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let cid = self.inner.trace.new_correlation_id();
        let mut start_meta = Map::new();
        start_meta.insert("state".into(), Value::from(InvocationState::Started.as_str()));
        start_meta.insert("protected".into(), Value::Bool(true));

        let mut guard = InvocationGuard::start(self.inner.trace.clone(), cid, action_name, start_meta);
        let _busy = self.inner.busy.scope();

        let result = fut.await;
        match &result {
            Ok(_) => guard.finish(
                EventKind::ActionEnd,
                TraceLevel::Info,
                &format!("{} completed", action_name),
                final_meta(InvocationState::Succeeded, json!({ "protected": true })),
            ),
            Err(e) => guard.finish(
                EventKind::ActionError,
                TraceLevel::Error,
                &e.to_string(),
                final_meta(
                    InvocationState::Failed,
                    json!({
                        "protected": true,
                        "error_chain": truncate_text(&format!("{:?}", e), ERROR_SUMMARY_MAX_BYTES),
                    }),
                ),
            ),
        }
        result
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("trace_len", &self.inner.trace.len())
            .field("busy", &self.inner.busy.count())
            .field("subscribers", &self.inner.bus.subscriber_count())
            .field("interactive", &self.inner.gate.is_interactive())
            .finish()
    }
}

/// Closing-event meta: `{ state, terminal, ...extra }`.
fn final_meta(terminal: InvocationState, extra: Value) -> Map<String, Value> {
    let mut meta = match extra {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    meta.insert("state".into(), Value::from(InvocationState::Finalized.as_str()));
    meta.insert("terminal".into(), Value::from(terminal.as_str()));
    meta
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Orchestrator`].
///
/// ```ignore
/// let orchestrator = Orchestrator::builder()
///     .with_config(config)
///     .with_dialog(dialog)
///     .build()?;
/// ```
pub struct OrchestratorBuilder {
    config: PipelineConfig,
    trace: Option<Arc<TraceHub>>,
    dialog: Option<Arc<dyn ConfirmationDialog>>,
    busy_callbacks: Option<(BusyCallback, BusyCallback)>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            trace: None,
            dialog: None,
            busy_callbacks: None,
        }
    }

    /// Trace limits and sink path.
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing trace hub; the config's limits are then ignored.
    pub fn with_trace(mut self, trace: Arc<TraceHub>) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Prompt through `dialog` in `run_with_confirmation`.
    pub fn with_dialog<D: ConfirmationDialog>(mut self, dialog: D) -> Self {
        self.dialog = Some(Arc::new(dialog));
        self
    }

    /// Show/hide the busy indicator.
    pub fn with_busy_callbacks<S, H>(mut self, show: S, hide: H) -> Self
    where
        S: Fn() + Send + Sync + 'static,
        H: Fn() + Send + Sync + 'static,
    {
        self.busy_callbacks = Some((Arc::new(show), Arc::new(hide)));
        self
    }

    /// Build the orchestrator. Fails only if the configured sink cannot be
    /// opened.
    pub fn build(self) -> Result<Orchestrator, SwitchyardError> {
        let trace = match self.trace {
            Some(trace) => trace,
            None => Arc::new(TraceHub::with_limits(
                self.config.trace_capacity,
                self.config.meta_max_bytes,
            )),
        };

        if let Some(path) = &self.config.trace_sink {
            trace.enable_file_sink_with_queue(path, self.config.sink_queue)?;
        }

        let orchestrator = Orchestrator::assemble(trace, self.dialog);
        if let Some((show, hide)) = self.busy_callbacks {
            orchestrator
                .busy()
                .attach(move || show(), move || hide());
        }
        Ok(orchestrator)
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
