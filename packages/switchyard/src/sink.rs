//! Append-only JSONL file sink for the trace hub.
//!
//! The hub never touches the file itself. Each event is serialized on the
//! calling thread and pushed with `try_send` into a bounded queue; a dedicated
//! writer thread drains the queue, writes one line per event and flushes when
//! the queue runs dry.
//!
//! Failure policy:
//! - queue full: the line is dropped and counted, the sink stays up
//! - write/flush error or writer gone: the sink reports a [`SinkFailure`] on
//!   the next send and the hub detaches it for good

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::error::SwitchyardError;
use crate::trace::TraceEvent;

/// Default number of lines buffered between the hub and the writer thread.
pub const DEFAULT_SINK_QUEUE: usize = 1024;

/// Why a sink stopped accepting events.
#[derive(Debug, Clone)]
pub(crate) struct SinkFailure {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default)]
struct SinkState {
    failure: Mutex<Option<String>>,
    dropped: AtomicU64,
}

impl SinkState {
    fn failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record_failure(&self, reason: String) {
        let mut guard = self
            .failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_none() {
            *guard = Some(reason);
        }
    }
}

/// Handle to a running JSONL writer.
#[derive(Debug)]
pub(crate) struct JsonlSink {
    path: PathBuf,
    sender: Option<SyncSender<String>>,
    worker: Option<JoinHandle<()>>,
    state: Arc<SinkState>,
}

impl JsonlSink {
    /// Open (creating if needed) `path` for appending and start the writer.
    pub fn open(path: &Path, queue: usize) -> Result<Self, SwitchyardError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| SwitchyardError::SinkOpen {
                path: path.to_path_buf(),
                source,
            })?;

        let (sender, receiver) = mpsc::sync_channel(queue.max(1));
        let state = Arc::new(SinkState::default());
        let worker_state = state.clone();

        let worker = std::thread::Builder::new()
            .name("switchyard-trace-sink".into())
            .spawn(move || run_writer(file, receiver, worker_state))
            .map_err(|source| SwitchyardError::SinkSpawn { source })?;

        Ok(Self {
            path: path.to_path_buf(),
            sender: Some(sender),
            worker: Some(worker),
            state,
        })
    }

    /// Queue one event for writing. Never blocks.
    pub fn send(&self, event: &TraceEvent) -> Result<(), SinkFailure> {
        if let Some(reason) = self.state.failure() {
            return Err(self.failure(reason));
        }

        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                // Meta is sanitized before it gets here; skip the line.
                warn!(error = %e, "trace event could not be encoded for sink");
                return Ok(());
            }
        };

        let Some(sender) = self.sender.as_ref() else {
            return Err(self.failure("sink closed".into()));
        };

        match sender.try_send(line) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let dropped = self.state.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(path = %self.path.display(), dropped, "trace sink queue full, line dropped");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                let reason = self
                    .state
                    .failure()
                    .unwrap_or_else(|| "sink writer stopped".into());
                Err(self.failure(reason))
            }
        }
    }

    /// Number of lines dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting lines, let the writer drain and flush, and join it.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.sender.is_none() && self.worker.is_none() {
            return;
        }
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(path = %self.path.display(), "trace sink writer panicked");
            }
        }
        let dropped = self.dropped();
        if dropped > 0 {
            warn!(path = %self.path.display(), dropped, "trace sink closed with dropped lines");
        }
    }

    fn failure(&self, reason: String) -> SinkFailure {
        SinkFailure {
            path: self.path.clone(),
            reason,
        }
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_writer(file: File, receiver: Receiver<String>, state: Arc<SinkState>) {
    let mut writer = BufWriter::new(file);

    while let Ok(line) = receiver.recv() {
        if let Err(e) = writeln!(writer, "{}", line) {
            state.record_failure(e.to_string());
            return;
        }
        // Drain whatever else is queued, then flush once.
        while let Ok(line) = receiver.try_recv() {
            if let Err(e) = writeln!(writer, "{}", line) {
                state.record_failure(e.to_string());
                return;
            }
        }
        if let Err(e) = writer.flush() {
            state.record_failure(e.to_string());
            return;
        }
    }

    if let Err(e) = writer.flush() {
        state.record_failure(e.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{EventKind, TraceDraft, TraceHub, TraceLevel};

    fn read_lines(path: &Path) -> Vec<TraceEvent> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_sink_writes_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.jsonl");

        let hub = TraceHub::new();
        hub.enable_file_sink(&path).unwrap();
        assert!(hub.sink_active());

        for i in 0..5 {
            hub.emit(
                TraceDraft::new(EventKind::Custom("EXPORT".into()), TraceLevel::Info)
                    .action("export_logs")
                    .message(format!("line {}", i)),
            );
        }
        hub.close_file_sink();
        assert!(!hub.sink_active());

        let events = read_lines(&path);
        assert_eq!(events.len(), 5);
        assert_eq!(events[4].message.as_deref(), Some("line 4"));
        assert_eq!(events[0].kind, EventKind::Custom("EXPORT".into()));
        assert_eq!(events, hub.export_recent(10, None, None));
    }

    #[test]
    fn test_sink_appends_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.jsonl");

        for _ in 0..2 {
            let hub = TraceHub::new();
            hub.enable_file_sink(&path).unwrap();
            hub.emit(TraceDraft::new(EventKind::Outcome, TraceLevel::Info));
            hub.close_file_sink();
        }

        assert_eq!(read_lines(&path).len(), 2);
    }

    #[test]
    fn test_enable_sink_fails_for_unopenable_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("trace.jsonl");

        let hub = TraceHub::new();
        let err = hub.enable_file_sink(&path).unwrap_err();
        assert!(matches!(err, SwitchyardError::SinkOpen { .. }));
        assert!(!hub.sink_active());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_write_failure_disables_sink_once() {
        let dev_full = Path::new("/dev/full");
        if !dev_full.exists() {
            return;
        }

        let hub = TraceHub::new();
        if hub.enable_file_sink(dev_full).is_err() {
            return;
        }

        // The writer fails asynchronously; keep emitting until the hub notices.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while hub.sink_active() && std::time::Instant::now() < deadline {
            hub.emit(TraceDraft::new(EventKind::Outcome, TraceLevel::Info));
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(!hub.sink_active());

        for _ in 0..10 {
            hub.emit(TraceDraft::new(EventKind::Outcome, TraceLevel::Info));
        }
        let disabled = hub.export_recent(1000, Some(&EventKind::SinkDisabled), None);
        assert_eq!(disabled.len(), 1);
        assert_eq!(disabled[0].level, TraceLevel::Error);

        // The diagnostic follows the event whose write tripped it.
        let pair = hub.export_recent(10, None, Some(disabled[0].correlation_id));
        let kinds: Vec<&EventKind> = pair.iter().map(|e| &e.kind).collect();
        assert_eq!(kinds, vec![&EventKind::Outcome, &EventKind::SinkDisabled]);
    }

    #[test]
    fn test_sink_lines_use_compact_correlation_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.jsonl");

        let hub = TraceHub::new();
        hub.enable_file_sink(&path).unwrap();
        let cid = hub.emit(TraceDraft::new(EventKind::ActionStart, TraceLevel::Info));
        hub.close_file_sink();

        let raw = std::fs::read_to_string(&path).unwrap();
        let line: serde_json::Value = serde_json::from_str(raw.trim()).unwrap();
        assert_eq!(line["correlation_id"], cid.to_string().as_str());
        assert_eq!(line["correlation_id"].as_str().unwrap().len(), 32);
    }

    #[test]
    fn test_concurrent_emitters_write_in_ring_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.jsonl");

        let hub = Arc::new(TraceHub::with_capacity(10_000));
        hub.enable_file_sink_with_queue(&path, 10_000).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let hub = hub.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        hub.emit(
                            TraceDraft::new(EventKind::Custom("TICK".into()), TraceLevel::Debug)
                                .message(format!("{}-{}", t, i)),
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        hub.close_file_sink();

        let written = read_lines(&path);
        assert_eq!(written.len(), 1_600);
        assert_eq!(written, hub.export_recent(usize::MAX, None, None));
    }
}
