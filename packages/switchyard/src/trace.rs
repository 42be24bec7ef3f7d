//! Trace hub: bounded, correlated record of everything the pipeline does.
//!
//! Every invocation leaves a short trail here (`ACTION_START`, `OUTCOME`,
//! `ACTION_END` / `ACTION_ERROR`) plus the diagnostics that must never reach
//! the user (listener failures, busy underflow, sink failures).
//!
//! # Guarantees
//!
//! - **Bounded**: a fixed-capacity ring buffer, oldest event evicted first
//! - **Never fails the caller**: oversized or unserializable `meta` is
//!   replaced by a small sentinel object
//! - **Non-blocking sink**: the optional JSONL sink is fed through a bounded
//!   queue to a writer thread; a failing sink is switched off, not retried
//!
//! Each event is also mirrored to `tracing` at the matching level.
//!
//! # Example
//!
//! ```ignore
//! let hub = TraceHub::new();
//! let cid = hub.emit(
//!     TraceDraft::new(EventKind::Custom("CACHE_WARM".into()), TraceLevel::Info)
//!         .action("warm_cache")
//!         .meta(&json!({ "entries": 120 })),
//! );
//!
//! for event in hub.export_recent(50, None, Some(cid)) {
//!     println!("{} {}", event.kind, event.message.unwrap_or_default());
//! }
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::core::{now_ms, CorrelationId};
use crate::error::SwitchyardError;
use crate::sink::{JsonlSink, SinkFailure, DEFAULT_SINK_QUEUE};

/// Default number of events retained.
pub const DEFAULT_TRACE_CAPACITY: usize = 600;

/// Default cap on the serialized size of one event's `meta`.
pub const DEFAULT_META_MAX_BYTES: usize = 4096;

// =============================================================================
// Event Kind & Level
// =============================================================================

/// Type tag of a trace event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    ActionStart,
    ActionEnd,
    ActionError,
    Selection,
    BusyUnderflow,
    Outcome,
    ListenerError,
    CallbackError,
    Confirmation,
    SinkDisabled,
    /// Any application-defined type.
    Custom(String),
}

impl EventKind {
    /// Wire name (`ACTION_START`, ...).
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::ActionStart => "ACTION_START",
            EventKind::ActionEnd => "ACTION_END",
            EventKind::ActionError => "ACTION_ERROR",
            EventKind::Selection => "SELECTION",
            EventKind::BusyUnderflow => "BUSY_UNDERFLOW",
            EventKind::Outcome => "OUTCOME",
            EventKind::ListenerError => "LISTENER_ERROR",
            EventKind::CallbackError => "CALLBACK_ERROR",
            EventKind::Confirmation => "CONFIRMATION",
            EventKind::SinkDisabled => "SINK_DISABLED",
            EventKind::Custom(name) => name,
        }
    }
}

impl From<&str> for EventKind {
    fn from(name: &str) -> Self {
        match name {
            "ACTION_START" => EventKind::ActionStart,
            "ACTION_END" => EventKind::ActionEnd,
            "ACTION_ERROR" => EventKind::ActionError,
            "SELECTION" => EventKind::Selection,
            "BUSY_UNDERFLOW" => EventKind::BusyUnderflow,
            "OUTCOME" => EventKind::Outcome,
            "LISTENER_ERROR" => EventKind::ListenerError,
            "CALLBACK_ERROR" => EventKind::CallbackError,
            "CONFIRMATION" => EventKind::Confirmation,
            "SINK_DISABLED" => EventKind::SinkDisabled,
            other => EventKind::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(EventKind::from(name.as_str()))
    }
}

/// Severity of a trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    Debug,
    Info,
    Warn,
    Error,
}

// =============================================================================
// Trace Event
// =============================================================================

/// One immutable trace record. Also the JSONL line schema of the file sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Milliseconds since the Unix epoch.
    pub ts: i64,
    pub correlation_id: CorrelationId,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub level: TraceLevel,
    pub action: Option<String>,
    pub message: Option<String>,
    pub meta: Map<String, Value>,
}

/// Draft of an event, handed to [`TraceHub::emit`].
#[derive(Debug, Clone)]
pub struct TraceDraft {
    kind: EventKind,
    level: TraceLevel,
    message: Option<String>,
    action: Option<String>,
    correlation_id: Option<CorrelationId>,
    meta: DraftMeta,
}

#[derive(Debug, Clone)]
enum DraftMeta {
    Empty,
    Ready(Value),
    SerializationFailed,
}

impl TraceDraft {
    pub fn new(kind: impl Into<EventKind>, level: TraceLevel) -> Self {
        Self {
            kind: kind.into(),
            level,
            message: None,
            action: None,
            correlation_id: None,
            meta: DraftMeta::Empty,
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn correlation_id(mut self, cid: CorrelationId) -> Self {
        self.correlation_id = Some(cid);
        self
    }

    /// Set the correlation id if one is known.
    pub fn maybe_correlation_id(mut self, cid: Option<CorrelationId>) -> Self {
        self.correlation_id = cid;
        self
    }

    /// Attach structured metadata.
    ///
    /// Serialization happens here; a failure is remembered and turned into
    /// the `serialization_failure` sentinel on emit rather than reported.
    pub fn meta<T: Serialize + ?Sized>(mut self, meta: &T) -> Self {
        self.meta = match serde_json::to_value(meta) {
            Ok(value) => DraftMeta::Ready(value),
            Err(_) => DraftMeta::SerializationFailed,
        };
        self
    }
}

impl From<EventKind> for TraceDraft {
    fn from(kind: EventKind) -> Self {
        TraceDraft::new(kind, TraceLevel::Info)
    }
}

// =============================================================================
// Trace Hub
// =============================================================================

/// Process-wide bounded ring buffer of correlated trace events.
///
/// Thread-safe; share it as `Arc<TraceHub>`. Locks are only held for the
/// push/evict or the copy-out, never across IO or user code.
#[derive(Debug)]
pub struct TraceHub {
    events: Mutex<VecDeque<TraceEvent>>,
    capacity: usize,
    meta_max_bytes: usize,
    sink: Mutex<Option<JsonlSink>>,
}

impl TraceHub {
    /// Create a hub with the default capacity and meta cap.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_TRACE_CAPACITY, DEFAULT_META_MAX_BYTES)
    }

    /// Create a hub retaining at most `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_limits(capacity, DEFAULT_META_MAX_BYTES)
    }

    /// Create a hub with explicit limits. A zero capacity is raised to one.
    pub fn with_limits(capacity: usize, meta_max_bytes: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            meta_max_bytes,
            sink: Mutex::new(None),
        }
    }

    /// Acquire the events lock, recovering from poison if necessary.
    fn lock_events(&self) -> MutexGuard<'_, VecDeque<TraceEvent>> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_sink(&self) -> MutexGuard<'_, Option<JsonlSink>> {
        self.sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Generate a fresh correlation id.
    pub fn new_correlation_id(&self) -> CorrelationId {
        CorrelationId::new()
    }

    /// Record one event and return its correlation id (generated if the
    /// draft carried none).
    pub fn emit(&self, draft: impl Into<TraceDraft>) -> CorrelationId {
        let draft = draft.into();
        let cid = draft.correlation_id.unwrap_or_default();
        let meta = self.sanitize_meta(draft.meta);

        let event = TraceEvent {
            ts: now_ms(),
            correlation_id: cid,
            kind: draft.kind,
            level: draft.level,
            action: draft.action,
            message: draft.message,
            meta,
        };

        mirror_to_tracing(&event);

        // Ring push and sink hand-off happen under the events lock, so the
        // JSONL file sees events in ring order.
        let failed = {
            let mut events = self.lock_events();
            let failed = self.write_to_sink(&event);
            while events.len() >= self.capacity {
                events.pop_front();
            }
            events.push_back(event);
            failed
        };

        if let Some((failure, sink)) = failed {
            sink.close();
            // The sink is detached now, so this diagnostic cannot recurse into it.
            self.emit(sink_disabled_draft(failure).correlation_id(cid));
        }

        cid
    }

    fn sanitize_meta(&self, meta: DraftMeta) -> Map<String, Value> {
        let value = match meta {
            DraftMeta::Empty => return Map::new(),
            DraftMeta::SerializationFailed => return sentinel("serialization_failure"),
            DraftMeta::Ready(value) => value,
        };

        match serde_json::to_string(&value) {
            Ok(encoded) if encoded.len() > self.meta_max_bytes => sentinel("truncated"),
            Ok(_) => match value {
                Value::Object(map) => map,
                Value::Null => Map::new(),
                other => {
                    let mut map = Map::new();
                    map.insert("value".into(), other);
                    map
                }
            },
            Err(_) => sentinel("serialization_failure"),
        }
    }

    /// Hand `event` to the sink. On failure the sink is detached and
    /// returned with the failure, for the caller to close and record.
    ///
    /// Lock order is events then sink; nothing takes them the other way round.
    fn write_to_sink(&self, event: &TraceEvent) -> Option<(SinkFailure, JsonlSink)> {
        let mut guard = self.lock_sink();
        let failure = guard.as_ref()?.send(event).err()?;
        guard.take().map(|sink| (failure, sink))
    }

    /// Most recent `limit` events, oldest first / newest last, optionally
    /// filtered by type and correlation id.
    pub fn export_recent(
        &self,
        limit: usize,
        filter_type: Option<&EventKind>,
        correlation_id: Option<CorrelationId>,
    ) -> Vec<TraceEvent> {
        let events = self.lock_events();
        let mut selected: Vec<TraceEvent> = events
            .iter()
            .rev()
            .filter(|e| filter_type.map_or(true, |kind| &e.kind == kind))
            .filter(|e| correlation_id.map_or(true, |cid| e.correlation_id == cid))
            .take(limit)
            .cloned()
            .collect();
        selected.reverse();
        selected
    }

    /// Start appending every event as one JSON line to `path`.
    ///
    /// Replaces any active sink. Fails only if the file cannot be opened.
    pub fn enable_file_sink(&self, path: impl AsRef<Path>) -> Result<(), SwitchyardError> {
        self.enable_file_sink_with_queue(path, DEFAULT_SINK_QUEUE)
    }

    /// Like [`enable_file_sink`](Self::enable_file_sink) with an explicit
    /// writer queue bound.
    pub fn enable_file_sink_with_queue(
        &self,
        path: impl AsRef<Path>,
        queue: usize,
    ) -> Result<(), SwitchyardError> {
        let sink = JsonlSink::open(path.as_ref(), queue)?;
        info!(path = %path.as_ref().display(), "trace file sink enabled");
        let previous = self.lock_sink().replace(sink);
        if let Some(previous) = previous {
            previous.close();
        }
        Ok(())
    }

    /// Flush and stop the file sink, if any.
    pub fn close_file_sink(&self) {
        let sink = self.lock_sink().take();
        if let Some(sink) = sink {
            sink.close();
        }
    }

    /// Returns true while a file sink is attached.
    pub fn sink_active(&self) -> bool {
        self.lock_sink().is_some()
    }

    /// Drop every buffered event.
    pub fn clear(&self) {
        self.lock_events().clear();
    }

    pub fn len(&self) -> usize {
        self.lock_events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_events().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn meta_max_bytes(&self) -> usize {
        self.meta_max_bytes
    }
}

impl Default for TraceHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TraceHub {
    fn drop(&mut self) {
        self.close_file_sink();
    }
}

fn sentinel(key: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(key.to_string(), Value::Bool(true));
    map
}

fn mirror_to_tracing(event: &TraceEvent) {
    let cid = event.correlation_id;
    let kind = event.kind.as_str();
    let action = event.action.as_deref().unwrap_or("-");
    let message = event.message.as_deref().unwrap_or("");
    match event.level {
        TraceLevel::Debug => debug!(target: "switchyard::trace", %cid, kind, action, "{}", message),
        TraceLevel::Info => info!(target: "switchyard::trace", %cid, kind, action, "{}", message),
        TraceLevel::Warn => warn!(target: "switchyard::trace", %cid, kind, action, "{}", message),
        TraceLevel::Error => error!(target: "switchyard::trace", %cid, kind, action, "{}", message),
    }
}

fn sink_disabled_draft(failure: SinkFailure) -> TraceDraft {
    TraceDraft::new(EventKind::SinkDisabled, TraceLevel::Error)
        .message(format!("trace file sink disabled: {}", failure.reason))
        .meta(&json!({ "path": failure.path.display().to_string() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn info(kind: EventKind) -> TraceDraft {
        TraceDraft::new(kind, TraceLevel::Info)
    }

    #[test]
    fn test_emit_generates_correlation_id_when_missing() {
        let hub = TraceHub::new();
        let cid = hub.emit(info(EventKind::ActionStart).action("x"));
        let events = hub.export_recent(10, None, None);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].correlation_id, cid);
        assert_eq!(events[0].action.as_deref(), Some("x"));
    }

    #[test]
    fn test_emit_keeps_supplied_correlation_id() {
        let hub = TraceHub::new();
        let cid = CorrelationId::new();
        let returned = hub.emit(info(EventKind::ActionEnd).correlation_id(cid));
        assert_eq!(returned, cid);
    }

    #[test]
    fn test_ring_buffer_evicts_oldest_first() {
        let hub = TraceHub::with_capacity(600);
        for i in 0..650 {
            hub.emit(info(EventKind::Custom("PUSH".into())).message(format!("event-{}", i)));
        }

        let events = hub.export_recent(1000, None, None);
        assert_eq!(events.len(), 600);
        assert_eq!(events[0].message.as_deref(), Some("event-50"));
        assert_eq!(events.last().unwrap().message.as_deref(), Some("event-649"));
        assert_eq!(hub.len(), 600);
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let hub = TraceHub::with_capacity(0);
        hub.emit(info(EventKind::Outcome));
        hub.emit(info(EventKind::Outcome));
        assert_eq!(hub.capacity(), 1);
        assert_eq!(hub.len(), 1);
    }

    #[test]
    fn test_export_recent_limit_returns_newest_last() {
        let hub = TraceHub::new();
        for i in 0..10 {
            hub.emit(info(EventKind::Outcome).message(i.to_string()));
        }
        let recent = hub.export_recent(3, None, None);
        let messages: Vec<_> = recent.iter().map(|e| e.message.clone().unwrap()).collect();
        assert_eq!(messages, vec!["7", "8", "9"]);
    }

    #[test]
    fn test_export_recent_filters_by_type_and_correlation() {
        let hub = TraceHub::new();
        let a = CorrelationId::new();
        let b = CorrelationId::new();
        hub.emit(info(EventKind::ActionStart).correlation_id(a));
        hub.emit(info(EventKind::ActionStart).correlation_id(b));
        hub.emit(info(EventKind::ActionEnd).correlation_id(a));

        let starts = hub.export_recent(10, Some(&EventKind::ActionStart), None);
        assert_eq!(starts.len(), 2);

        let only_a = hub.export_recent(10, None, Some(a));
        assert_eq!(only_a.len(), 2);
        assert_eq!(only_a[1].kind, EventKind::ActionEnd);

        let a_ends = hub.export_recent(10, Some(&EventKind::ActionEnd), Some(a));
        assert_eq!(a_ends.len(), 1);
    }

    #[test]
    fn test_oversized_meta_is_replaced_by_sentinel() {
        let hub = TraceHub::with_limits(10, 64);
        let big = "x".repeat(1_000);
        hub.emit(info(EventKind::Outcome).meta(&json!({ "blob": big })));

        let event = &hub.export_recent(1, None, None)[0];
        assert_eq!(Value::Object(event.meta.clone()), json!({ "truncated": true }));
    }

    #[test]
    fn test_unserializable_meta_is_replaced_by_sentinel() {
        use std::collections::HashMap;

        // Maps with non-string keys cannot become JSON objects.
        let mut bad: HashMap<(u8, u8), u8> = HashMap::new();
        bad.insert((1, 2), 3);

        let hub = TraceHub::new();
        hub.emit(info(EventKind::Outcome).meta(&bad));
        let event = &hub.export_recent(1, None, None)[0];
        assert_eq!(
            Value::Object(event.meta.clone()),
            json!({ "serialization_failure": true })
        );
    }

    #[test]
    fn test_non_object_meta_is_wrapped() {
        let hub = TraceHub::new();
        hub.emit(info(EventKind::Outcome).meta(&vec![1, 2, 3]));
        let event = &hub.export_recent(1, None, None)[0];
        assert_eq!(event.meta["value"], json!([1, 2, 3]));
    }

    #[test]
    fn test_clear_empties_buffer() {
        let hub = TraceHub::new();
        hub.emit(info(EventKind::Outcome));
        assert!(!hub.is_empty());
        hub.clear();
        assert!(hub.is_empty());
    }

    #[test]
    fn test_event_kind_round_trips_through_wire_name() {
        for kind in [
            EventKind::ActionStart,
            EventKind::BusyUnderflow,
            EventKind::SinkDisabled,
            EventKind::Custom("EXPORT_LOGS".into()),
        ] {
            assert_eq!(EventKind::from(kind.as_str()), kind);
        }
    }

    #[test]
    fn test_event_serializes_with_flat_schema() {
        let hub = TraceHub::new();
        hub.emit(
            TraceDraft::new(EventKind::ActionError, TraceLevel::Error)
                .action("x")
                .message("boom"),
        );
        let event = &hub.export_recent(1, None, None)[0];
        let json = serde_json::to_value(event).unwrap();
        let keys: HashSet<&str> = json.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        let expected: HashSet<&str> =
            ["ts", "correlation_id", "type", "level", "action", "message", "meta"]
                .into_iter()
                .collect();
        assert_eq!(keys, expected);
        assert_eq!(json["type"], "ACTION_ERROR");
        assert_eq!(json["level"], "error");
    }

    #[test]
    fn test_concurrent_emitters_respect_capacity() {
        let hub = std::sync::Arc::new(TraceHub::with_capacity(100));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let hub = hub.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        hub.emit(info(EventKind::Outcome));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(hub.len(), 100);
    }
}
