//! Outcome fan-out: deliver every final [`Outcome`] to independent listeners.
//!
//! # Guarantees
//!
//! - **Trace first**: `publish` records one `OUTCOME` trace event before any
//!   listener runs, so the outcome is in the trace even if every listener fails
//! - **Isolated listeners**: an `Err` or a panic from one listener becomes a
//!   `LISTENER_ERROR` diagnostic; later listeners still run
//! - **Snapshot delivery**: listeners may subscribe or unsubscribe from inside
//!   a callback without affecting the delivery in progress
//!
//! Async consumers that prefer a channel can call [`OutcomeBus::watch`]; the
//! broadcast receiver is at-most-once, slow receivers see `Lagged`.
//!
//! # Example
//!
//! ```ignore
//! let bus = OutcomeBus::new(trace.clone());
//!
//! bus.subscribe(|outcome: &Outcome| -> anyhow::Result<()> {
//!     toast::show(outcome.severity(), outcome.message());
//!     Ok(())
//! });
//!
//! bus.publish(&Outcome::success("FILE_DELETE_OK", "Deleted 3 files"));
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::debug;

use crate::core::{panic_message, SubscriptionId};
use crate::outcome::{Outcome, Severity};
use crate::trace::{EventKind, TraceDraft, TraceHub, TraceLevel};

/// Default buffer of the broadcast channel behind [`OutcomeBus::watch`].
const DEFAULT_WATCH_CAPACITY: usize = 256;

/// Receives every published outcome.
///
/// Implemented for any `Fn(&Outcome) -> anyhow::Result<()>` closure.
pub trait OutcomeListener: Send + Sync + 'static {
    fn on_outcome(&self, outcome: &Outcome) -> Result<()>;
}

impl<F> OutcomeListener for F
where
    F: Fn(&Outcome) -> Result<()> + Send + Sync + 'static,
{
    fn on_outcome(&self, outcome: &Outcome) -> Result<()> {
        self(outcome)
    }
}

/// Publish/subscribe broadcaster of outcomes.
pub struct OutcomeBus {
    listeners: RwLock<Vec<(SubscriptionId, Arc<dyn OutcomeListener>)>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<Outcome>,
    trace: Arc<TraceHub>,
}

impl OutcomeBus {
    pub fn new(trace: Arc<TraceHub>) -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_WATCH_CAPACITY);
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            sender,
            trace,
        }
    }

    /// Register a listener; delivery follows subscription order.
    pub fn subscribe<L: OutcomeListener>(&self, listener: L) -> SubscriptionId {
        let id = SubscriptionId::from_counter(&self.next_id);
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = listeners.len();
        listeners.retain(|(sid, _)| *sid != id);
        before != listeners.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Receive published outcomes over a broadcast channel.
    ///
    /// Only outcomes published after this call are received.
    pub fn watch(&self) -> broadcast::Receiver<Outcome> {
        self.sender.subscribe()
    }

    /// Trace the outcome, then hand it to every listener.
    ///
    /// Returns the number of listeners that accepted it.
    pub fn publish(&self, outcome: &Outcome) -> usize {
        self.trace.emit(
            TraceDraft::new(EventKind::Outcome, outcome_level(outcome))
                .maybe_correlation_id(outcome.correlation_id())
                .message(outcome.message())
                .meta(&json!({
                    "code": outcome.code(),
                    "success": outcome.is_success(),
                    "severity": outcome.severity(),
                    "duration_ms": outcome.duration_ms(),
                    "selection_size": outcome.selection().map(<[String]>::len),
                })),
        );

        let snapshot: Vec<(SubscriptionId, Arc<dyn OutcomeListener>)> = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let mut delivered = 0;
        for (id, listener) in snapshot {
            let failure = match catch_unwind(AssertUnwindSafe(|| listener.on_outcome(outcome))) {
                Ok(Ok(())) => {
                    delivered += 1;
                    continue;
                }
                Ok(Err(e)) => format!("{:#}", e),
                Err(panic_info) => format!("listener panicked: {}", panic_message(panic_info.as_ref())),
            };
            self.trace.emit(
                TraceDraft::new(EventKind::ListenerError, TraceLevel::Error)
                    .maybe_correlation_id(outcome.correlation_id())
                    .message(format!("outcome listener {} failed: {}", id, failure))
                    .meta(&json!({
                        "subscription": id.to_string(),
                        "code": outcome.code(),
                        "error": failure,
                    })),
            );
        }

        // No receivers is the normal case.
        let watchers = self.sender.send(outcome.clone()).unwrap_or(0);
        debug!(code = outcome.code(), delivered, watchers, "outcome published");

        delivered
    }
}

impl std::fmt::Debug for OutcomeBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutcomeBus")
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

fn outcome_level(outcome: &Outcome) -> TraceLevel {
    match outcome.severity() {
        Severity::Success | Severity::Info => TraceLevel::Info,
        Severity::Warning => TraceLevel::Warn,
        Severity::Error => TraceLevel::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CorrelationId;
    use std::sync::Mutex;

    fn bus() -> (Arc<TraceHub>, Arc<OutcomeBus>) {
        let trace = Arc::new(TraceHub::new());
        let bus = Arc::new(OutcomeBus::new(trace.clone()));
        (trace, bus)
    }

    fn recorder(bus: &OutcomeBus, tag: &'static str, log: &Arc<Mutex<Vec<String>>>) -> SubscriptionId {
        let log = log.clone();
        bus.subscribe(move |o: &Outcome| -> Result<()> {
            log.lock().unwrap().push(format!("{}:{}", tag, o.code()));
            Ok(())
        })
    }

    #[test]
    fn test_publish_delivers_in_subscription_order() {
        let (_trace, bus) = bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, "toast", &log);
        recorder(&bus, "status", &log);

        let delivered = bus.publish(&Outcome::success("SAVE_OK", "Saved"));

        assert_eq!(delivered, 2);
        assert_eq!(*log.lock().unwrap(), vec!["toast:SAVE_OK", "status:SAVE_OK"]);
    }

    #[test]
    fn test_publish_records_outcome_event_even_without_listeners() {
        let (trace, bus) = bus();
        let cid = CorrelationId::new();
        let outcome = Outcome::warn("EMPTY_SELECTION", "Nothing selected")
            .with_selection(vec![])
            .with_correlation_id(cid);

        assert_eq!(bus.publish(&outcome), 0);

        let events = trace.export_recent(10, Some(&EventKind::Outcome), Some(cid));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, TraceLevel::Warn);
        assert_eq!(events[0].meta["code"], "EMPTY_SELECTION");
        assert_eq!(events[0].meta["success"], false);
        assert_eq!(events[0].meta["severity"], "warning");
        assert_eq!(events[0].meta["selection_size"], 0);
    }

    #[test]
    fn test_failing_listeners_do_not_stop_delivery() {
        let (trace, bus) = bus();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(|_: &Outcome| -> Result<()> { anyhow::bail!("toast queue full") });
        bus.subscribe(|_: &Outcome| -> Result<()> { panic!("status bar gone") });
        recorder(&bus, "logger", &log);

        let delivered = bus.publish(&Outcome::error("X_ERROR", "boom", "X_ERROR", None));

        assert_eq!(delivered, 1);
        assert_eq!(log.lock().unwrap().len(), 1);

        let errors = trace.export_recent(10, Some(&EventKind::ListenerError), None);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].meta["error"], "toast queue full");
        assert!(errors[1].message.as_deref().unwrap().contains("status bar gone"));
    }

    #[test]
    fn test_unsubscribe() {
        let (_trace, bus) = bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = recorder(&bus, "a", &log);
        assert_eq!(bus.subscriber_count(), 1);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish(&Outcome::info("PING", "ping"));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_subscribe_during_delivery_affects_next_publish_only() {
        let (_trace, bus) = bus();
        let calls = Arc::new(AtomicU64::new(0));

        let inner_bus = bus.clone();
        let inner_calls = calls.clone();
        bus.subscribe(move |_: &Outcome| -> Result<()> {
            let c = inner_calls.clone();
            inner_bus.subscribe(move |_: &Outcome| -> Result<()> {
                c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        });

        assert_eq!(bus.publish(&Outcome::info("A", "a")), 1);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);

        bus.publish(&Outcome::info("B", "b"));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_struct_listener() {
        struct Counter(Arc<AtomicU64>);
        impl OutcomeListener for Counter {
            fn on_outcome(&self, _outcome: &Outcome) -> Result<()> {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        }

        let (_trace, bus) = bus();
        let seen = Arc::new(AtomicU64::new(0));
        bus.subscribe(Counter(seen.clone()));
        bus.publish(&Outcome::info("A", "a"));
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_watch_receives_published_outcomes() {
        let (_trace, bus) = bus();
        let mut rx = bus.watch();

        bus.publish(&Outcome::success("EXPORT_OK", "Exported"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.code(), "EXPORT_OK");
    }
}
