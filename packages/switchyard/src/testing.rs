//! Test doubles for code built on the pipeline.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! switchyard = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use switchyard::testing::{CallCounter, RecordingListener, ScriptedDialog};
//!
//! let orchestrator = Orchestrator::builder()
//!     .with_dialog(ScriptedDialog::new([true, false]))
//!     .build()?;
//!
//! let toasts = RecordingListener::new();
//! orchestrator.bus().subscribe(toasts.clone());
//!
//! let calls = CallCounter::new();
//! // ... run actions ...
//!
//! assert_eq!(toasts.codes(), vec!["EXPORT_OK", "CANCELLED"]);
//! assert!(unpaired_invocations(orchestrator.trace()).is_empty());
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;

use crate::bus::OutcomeListener;
use crate::confirm::ConfirmationDialog;
use crate::core::CorrelationId;
use crate::outcome::Outcome;
use crate::trace::{EventKind, TraceHub};

// =============================================================================
// Recording Listener
// =============================================================================

/// Outcome listener that keeps every outcome it receives.
///
/// Clones share the same record, so subscribe a clone and assert on the
/// original.
#[derive(Debug, Clone, Default)]
pub struct RecordingListener {
    outcomes: Arc<Mutex<Vec<Outcome>>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcomes(&self) -> Vec<Outcome> {
        self.outcomes.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn codes(&self) -> Vec<String> {
        self.outcomes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|o| o.code().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.outcomes.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last(&self) -> Option<Outcome> {
        self.outcomes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .last()
            .cloned()
    }

    pub fn clear(&self) {
        self.outcomes.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

impl OutcomeListener for RecordingListener {
    fn on_outcome(&self, outcome: &Outcome) -> Result<()> {
        self.outcomes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(outcome.clone());
        Ok(())
    }
}

// =============================================================================
// Scripted Dialog
// =============================================================================

/// Confirmation dialog answering from a fixed script.
///
/// Once the script runs out every prompt is declined.
#[derive(Debug, Default)]
pub struct ScriptedDialog {
    answers: Mutex<VecDeque<bool>>,
    prompts: Mutex<Vec<(String, String)>>,
}

impl ScriptedDialog {
    pub fn new(answers: impl IntoIterator<Item = bool>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Every `(title, message)` shown so far.
    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl ConfirmationDialog for ScriptedDialog {
    async fn show_confirmation(&self, title: &str, message: &str) -> bool {
        self.prompts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((title.to_string(), message.to_string()));
        self.answers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or(false)
    }
}

// =============================================================================
// Call Counter
// =============================================================================

/// Shared invocation counter for operation and callback stubs.
#[derive(Debug, Clone, Default)]
pub struct CallCounter {
    calls: Arc<AtomicUsize>,
}

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hit(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Outcome Latch
// =============================================================================

/// Countdown latch released after `expected` outcomes.
///
/// Subscribe it to the bus, run the actions, then `await_zero()`.
///
/// # Timeout Safety
///
/// ```ignore
/// timeout(Duration::from_secs(5), latch.await_zero())
///     .await
///     .expect("latch timed out");
/// ```
#[derive(Debug, Clone)]
pub struct OutcomeLatch {
    inner: Arc<LatchInner>,
}

#[derive(Debug)]
struct LatchInner {
    remaining: AtomicUsize,
    notify: Notify,
}

impl OutcomeLatch {
    pub fn new(expected: usize) -> Self {
        Self {
            inner: Arc::new(LatchInner {
                remaining: AtomicUsize::new(expected),
                notify: Notify::new(),
            }),
        }
    }

    /// Count one outcome. Extra outcomes past zero are ignored.
    pub fn dec(&self) {
        let prev = self
            .inner
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if prev == Ok(1) {
            self.inner.notify.notify_waiters();
        }
    }

    pub async fn await_zero(&self) {
        loop {
            // Register before checking so the final dec is not missed.
            let notified = self.inner.notify.notified();
            if self.remaining() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn remaining(&self) -> usize {
        self.inner.remaining.load(Ordering::Acquire)
    }
}

impl OutcomeListener for OutcomeLatch {
    fn on_outcome(&self, _outcome: &Outcome) -> Result<()> {
        self.dec();
        Ok(())
    }
}

// =============================================================================
// Trace Assertions
// =============================================================================

/// Correlation ids whose `ACTION_START` count differs from their closing
/// `ACTION_END` + `ACTION_ERROR` count in the retained trace window.
pub fn unpaired_invocations(trace: &TraceHub) -> Vec<CorrelationId> {
    let mut balance: HashMap<CorrelationId, i64> = HashMap::new();
    for event in trace.export_recent(usize::MAX, None, None) {
        match event.kind {
            EventKind::ActionStart => *balance.entry(event.correlation_id).or_default() += 1,
            EventKind::ActionEnd | EventKind::ActionError => {
                *balance.entry(event.correlation_id).or_default() -= 1
            }
            _ => {}
        }
    }
    let mut unpaired: Vec<CorrelationId> = balance
        .into_iter()
        .filter(|(_, n)| *n != 0)
        .map(|(cid, _)| cid)
        .collect();
    unpaired.sort();
    unpaired
}
