//! Per-invocation options for [`Orchestrator::run`](crate::Orchestrator::run)
//! and [`Orchestrator::run_with_confirmation`](crate::Orchestrator::run_with_confirmation).
//!
//! # Example
//!
//! ```ignore
//! let cancel = CancelToken::new();
//!
//! let options = RunOptions::new()
//!     .selection(selections.provider("files"))
//!     .require_selection(true)
//!     .meta("source", json!("toolbar"))
//!     .cancel_token(cancel.clone());
//!
//! let outcome = orchestrator.run("delete files", options, || async { ... }).await;
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::Notify;

use crate::core::CorrelationId;

/// Returns the ids the action should act on. Called at most once per run.
pub type SelectionProvider = Arc<dyn Fn() -> anyhow::Result<Vec<String>> + Send + Sync>;

// =============================================================================
// Cancel Token
// =============================================================================

/// Cooperative cancellation signal shared between a caller and a running
/// invocation.
///
/// Cloning yields a handle to the same signal. Once cancelled it stays
/// cancelled.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal, waking every waiter.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking so a concurrent cancel is not missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// =============================================================================
// Run Options
// =============================================================================

/// Options for one `run` call. Everything is optional.
#[derive(Clone, Default)]
pub struct RunOptions {
    pub(crate) selection_provider: Option<SelectionProvider>,
    pub(crate) require_selection: bool,
    pub(crate) correlation_id: Option<CorrelationId>,
    pub(crate) meta: Map<String, Value>,
    pub(crate) cancel: Option<CancelToken>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Supply the ids this action operates on.
    pub fn selection<F>(mut self, provider: F) -> Self
    where
        F: Fn() -> anyhow::Result<Vec<String>> + Send + Sync + 'static,
    {
        self.selection_provider = Some(Arc::new(provider));
        self
    }

    /// Refuse to run with an empty selection (`EMPTY_SELECTION`).
    pub fn require_selection(mut self, required: bool) -> Self {
        self.require_selection = required;
        self
    }

    /// Trace under an existing correlation id instead of a fresh one.
    pub fn correlation_id(mut self, cid: CorrelationId) -> Self {
        self.correlation_id = Some(cid);
        self
    }

    /// Add one key to the `ACTION_START` trace meta.
    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("has_selection_provider", &self.selection_provider.is_some())
            .field("require_selection", &self.require_selection)
            .field("correlation_id", &self.correlation_id)
            .field("meta", &self.meta)
            .field("cancel", &self.cancel)
            .finish()
    }
}

// =============================================================================
// Confirm Options
// =============================================================================

/// Options for `run_with_confirmation`.
///
/// Unset prompt texts fall back to wording derived from the action name.
#[derive(Debug, Clone, Default)]
pub struct ConfirmOptions {
    pub(crate) title: Option<String>,
    pub(crate) text: Option<String>,
    pub(crate) cancel_message: Option<String>,
    pub(crate) trigger_data_change: bool,
    pub(crate) run: RunOptions,
}

impl ConfirmOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// The question shown to the user.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn cancel_message(mut self, message: impl Into<String>) -> Self {
        self.cancel_message = Some(message.into());
        self
    }

    /// Fire the data-change callbacks after a successful run.
    pub fn trigger_data_change(mut self, trigger: bool) -> Self {
        self.trigger_data_change = trigger;
        self
    }

    /// Options forwarded to the underlying `run`.
    pub fn run_options(mut self, run: RunOptions) -> Self {
        self.run = run;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_already_cancelled_resolves_immediately() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("should not wait");
    }

    #[test]
    fn test_run_options_builder() {
        let cid = CorrelationId::new();
        let options = RunOptions::new()
            .selection(|| Ok(vec!["a".into()]))
            .require_selection(true)
            .correlation_id(cid)
            .meta("source", Value::from("toolbar"));

        assert!(options.require_selection);
        assert_eq!(options.correlation_id, Some(cid));
        assert_eq!(options.meta["source"], "toolbar");
        let provider = options.selection_provider.unwrap();
        assert_eq!(provider().unwrap(), vec!["a"]);
    }
}
