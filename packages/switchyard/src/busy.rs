//! Busy counter: reference-counted "is anything running" flag.
//!
//! Overlapping invocations each take one reference; the UI indicator is shown
//! on the 0 → 1 transition and hidden on 1 → 0. The counter never goes
//! negative: a stray `stop()` is clamped and recorded as `BUSY_UNDERFLOW`.
//!
//! The count changes lock-free, but the indicator is driven by whichever
//! thread holds the indicator lock. That thread keeps firing show/hide until
//! the indicator matches the count, so a slow `show` racing a `stop` on
//! another thread still ends with the indicator hidden.
//!
//! # Pairing
//!
//! Correctness rests on every `start()` having exactly one `stop()`. Prefer
//! [`BusyCounter::scope`], whose [`BusyGuard`] releases on drop, so early
//! returns, `?`, panics and dropped futures all release the reference.
//!
//! ```ignore
//! let busy = Arc::new(BusyCounter::new(trace.clone()));
//! busy.attach(|| spinner.show(), || spinner.hide());
//!
//! {
//!     let _guard = busy.scope();
//!     do_io().await?; // released even if this fails
//! }
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, TryLockError};

use serde_json::json;
use tracing::{debug, error};

use crate::core::panic_message;
use crate::trace::{EventKind, TraceDraft, TraceHub, TraceLevel};

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
struct Callbacks {
    show: Callback,
    hide: Callback,
}

#[derive(Debug, Clone, Copy)]
enum Transition {
    Show,
    Hide,
}

impl Transition {
    fn name(self) -> &'static str {
        match self {
            Transition::Show => "show",
            Transition::Hide => "hide",
        }
    }
}

/// Shared busy flag with show/hide callbacks.
pub struct BusyCounter {
    count: AtomicUsize,
    callbacks: RwLock<Option<Callbacks>>,
    /// Indicator state as last driven by a callback. Held while callbacks run.
    indicator: Mutex<bool>,
    /// Mirror of `indicator` readable without the lock.
    shown: AtomicBool,
    trace: Option<Arc<TraceHub>>,
}

impl BusyCounter {
    /// Create a counter that reports underflow to `trace`.
    pub fn new(trace: Arc<TraceHub>) -> Self {
        Self {
            count: AtomicUsize::new(0),
            callbacks: RwLock::new(None),
            indicator: Mutex::new(false),
            shown: AtomicBool::new(false),
            trace: Some(trace),
        }
    }

    /// Create a counter with no trace hub; diagnostics go to `tracing` only.
    pub fn detached() -> Self {
        Self {
            count: AtomicUsize::new(0),
            callbacks: RwLock::new(None),
            indicator: Mutex::new(false),
            shown: AtomicBool::new(false),
            trace: None,
        }
    }

    /// Register the show/hide callbacks, replacing any previous pair.
    pub fn attach<S, H>(&self, show: S, hide: H)
    where
        S: Fn() + Send + Sync + 'static,
        H: Fn() + Send + Sync + 'static,
    {
        let mut guard = self
            .callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(Callbacks {
            show: Arc::new(show),
            hide: Arc::new(hide),
        });
    }

    /// Take one reference. Fires "show" on 0 → 1.
    pub fn start(&self) {
        let prev = self.count.fetch_add(1, Ordering::AcqRel);
        debug!(count = prev + 1, "busy start");
        if prev == 0 {
            self.sync_indicator();
        }
    }

    /// Release one reference. Fires "hide" on 1 → 0; clamps at zero.
    pub fn stop(&self) {
        match self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
        {
            Ok(prev) => {
                debug!(count = prev - 1, "busy stop");
                if prev == 1 {
                    self.sync_indicator();
                }
            }
            Err(_) => self.record_underflow(),
        }
    }

    /// Returns true while at least one reference is held.
    pub fn is_busy(&self) -> bool {
        self.count() > 0
    }

    /// Current reference count.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Take one reference for the lifetime of the returned guard.
    pub fn scope(self: &Arc<Self>) -> BusyGuard {
        self.start();
        BusyGuard {
            counter: self.clone(),
        }
    }

    /// Whether the indicator is currently shown.
    pub fn indicator_shown(&self) -> bool {
        self.shown.load(Ordering::Acquire)
    }

    /// Drive the indicator until it matches the count.
    ///
    /// Only one thread drives at a time. A thread that finds the lock taken
    /// returns at once; the holder re-checks the count before and after
    /// releasing, so the change is never lost. Callbacks may re-enter
    /// `start`/`stop` without deadlocking.
    fn sync_indicator(&self) {
        loop {
            let mut shown = match self.indicator.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };
            loop {
                let want = self.is_busy();
                if *shown == want {
                    break;
                }
                self.fire(if want { Transition::Show } else { Transition::Hide });
                *shown = want;
                self.shown.store(want, Ordering::Release);
            }
            drop(shown);

            if self.is_busy() == self.indicator_shown() {
                return;
            }
        }
    }

    fn fire(&self, transition: Transition) {
        let callbacks = self
            .callbacks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let Some(callbacks) = callbacks else {
            return;
        };
        let callback = match transition {
            Transition::Show => callbacks.show,
            Transition::Hide => callbacks.hide,
        };

        // Runs from BusyGuard::drop, possibly mid-unwind; must not panic.
        if let Err(panic_info) = catch_unwind(AssertUnwindSafe(|| callback())) {
            let panic_msg = panic_message(panic_info.as_ref());
            error!(transition = transition.name(), panic = %panic_msg, "busy callback panicked");
            if let Some(trace) = &self.trace {
                trace.emit(
                    TraceDraft::new(EventKind::CallbackError, TraceLevel::Error)
                        .message(format!("busy {} callback panicked", transition.name()))
                        .meta(&json!({ "panic": panic_msg })),
                );
            }
        }
    }

    fn record_underflow(&self) {
        match &self.trace {
            Some(trace) => {
                trace.emit(
                    TraceDraft::new(EventKind::BusyUnderflow, TraceLevel::Warn)
                        .message("busy stop() called with no active reference"),
                );
            }
            None => {
                tracing::warn!("busy stop() called with no active reference");
            }
        }
    }
}

impl Default for BusyCounter {
    fn default() -> Self {
        Self::detached()
    }
}

impl std::fmt::Debug for BusyCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusyCounter")
            .field("count", &self.count())
            .field("shown", &self.indicator_shown())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Busy Guard (RAII)
// =============================================================================

/// RAII guard holding one busy reference.
///
/// Releases on drop, including panic unwind and future cancellation.
#[must_use = "the busy reference is released as soon as the guard is dropped"]
pub struct BusyGuard {
    counter: Arc<BusyCounter>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.counter.stop();
    }
}

impl std::fmt::Debug for BusyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusyGuard").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn counter() -> (Arc<TraceHub>, Arc<BusyCounter>) {
        let trace = Arc::new(TraceHub::new());
        let busy = Arc::new(BusyCounter::new(trace.clone()));
        (trace, busy)
    }

    fn transitions(busy: &BusyCounter) -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let shows = Arc::new(AtomicUsize::new(0));
        let hides = Arc::new(AtomicUsize::new(0));
        let (s, h) = (shows.clone(), hides.clone());
        busy.attach(
            move || {
                s.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
        );
        (shows, hides)
    }

    #[test]
    fn test_nested_start_stop() {
        let (_trace, busy) = counter();
        busy.start();
        busy.start();
        busy.stop();
        assert!(busy.is_busy());
        assert_eq!(busy.count(), 1);

        busy.stop();
        assert!(!busy.is_busy());
    }

    #[test]
    fn test_stop_on_fresh_counter_records_underflow() {
        let (trace, busy) = counter();
        busy.stop();

        assert_eq!(busy.count(), 0);
        let underflows = trace.export_recent(10, Some(&EventKind::BusyUnderflow), None);
        assert_eq!(underflows.len(), 1);
    }

    #[test]
    fn test_callbacks_fire_only_on_transitions() {
        let (_trace, busy) = counter();
        let (shows, hides) = transitions(&busy);

        busy.start();
        busy.start();
        busy.start();
        busy.stop();
        busy.stop();
        assert_eq!(shows.load(Ordering::SeqCst), 1);
        assert_eq!(hides.load(Ordering::SeqCst), 0);

        busy.stop();
        assert_eq!(hides.load(Ordering::SeqCst), 1);

        // Underflow is not a transition.
        busy.stop();
        assert_eq!(hides.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let (_trace, busy) = counter();
        {
            let _guard = busy.scope();
            assert!(busy.is_busy());
        }
        assert!(!busy.is_busy());
    }

    #[test]
    fn test_guard_releases_on_early_return() {
        let (_trace, busy) = counter();

        fn work(busy: &Arc<BusyCounter>) -> anyhow::Result<()> {
            let _guard = busy.scope();
            anyhow::bail!("failed inside the protected region")
        }

        assert!(work(&busy).is_err());
        assert_eq!(busy.count(), 0);
    }

    #[test]
    fn test_guard_releases_on_panic() {
        let (_trace, busy) = counter();
        let (_shows, hides) = transitions(&busy);

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _guard = busy.scope();
            panic!("boom");
        }));

        assert!(result.is_err());
        assert_eq!(busy.count(), 0);
        assert_eq!(hides.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_guard_releases_when_future_is_dropped() {
        let (_trace, busy) = counter();

        let held = busy.clone();
        let task = tokio::spawn(async move {
            let _guard = held.scope();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(busy.is_busy());

        task.abort();
        let _ = task.await;
        assert!(!busy.is_busy());
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let (trace, busy) = counter();
        busy.attach(|| panic!("show exploded"), || {});

        busy.start();
        assert!(busy.is_busy());
        busy.stop();
        assert!(!busy.is_busy());

        let errors = trace.export_recent(10, Some(&EventKind::CallbackError), None);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].meta["panic"], "show exploded");
    }

    #[test]
    fn test_slow_show_racing_stop_ends_hidden() {
        let (_trace, busy) = counter();
        let visible = Arc::new(AtomicBool::new(false));
        let (on, off) = (visible.clone(), visible.clone());
        busy.attach(
            move || {
                std::thread::sleep(Duration::from_millis(50));
                on.store(true, Ordering::SeqCst);
            },
            move || off.store(false, Ordering::SeqCst),
        );

        let starter = busy.clone();
        let handle = std::thread::spawn(move || starter.start());
        std::thread::sleep(Duration::from_millis(10));
        busy.stop();
        handle.join().unwrap();

        assert_eq!(busy.count(), 0);
        assert!(!visible.load(Ordering::SeqCst), "indicator left on with count 0");
        assert!(!busy.indicator_shown());
    }

    #[test]
    fn test_callback_may_reenter_counter() {
        let (_trace, busy) = counter();
        let inner = Arc::downgrade(&busy);
        let hides = Arc::new(AtomicUsize::new(0));
        let h = hides.clone();
        busy.attach(
            move || {
                // Nested start/stop while the show callback is running.
                if let Some(busy) = inner.upgrade() {
                    busy.start();
                    busy.stop();
                }
            },
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
        );

        busy.start();
        assert!(busy.indicator_shown());
        busy.stop();
        assert!(!busy.indicator_shown());
        assert_eq!(hides.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_detached_counter_clamps_without_trace() {
        let busy = BusyCounter::detached();
        busy.stop();
        busy.stop();
        assert_eq!(busy.count(), 0);
        busy.start();
        assert!(busy.is_busy());
    }
}
