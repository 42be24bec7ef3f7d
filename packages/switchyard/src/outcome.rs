//! Outcome taxonomy: the one result shape every action surfaces.
//!
//! Outcomes are only built through the named factories below, which is how
//! the severity invariants hold:
//!
//! | Factory      | `success` | `severity` | legacy `status` |
//! |--------------|-----------|------------|-----------------|
//! | `success`    | true      | success    | success         |
//! | `info`       | true      | info       | success         |
//! | `warn`       | false     | warning    | warn            |
//! | `partial`    | false     | warning    | warn            |
//! | `error`      | false     | error      | error           |
//! | `cancelled`  | false     | info       | warn            |
//! | `retrying`   | false     | info       | warn            |
//!
//! The legacy `status` is never stored. It is derived from `success` and
//! `severity` by [`Outcome::status`] and written out at the serialization
//! boundary for older consumers.
//!
//! # Example
//!
//! ```ignore
//! use switchyard::{Outcome, PartialFailure};
//!
//! let outcome = Outcome::partial(
//!     "FILE_DELETE_PARTIAL",
//!     "Deleted 8 of 10 files",
//!     vec![
//!         PartialFailure::new("a.log", "permission denied"),
//!         PartialFailure::new("b.log", "in use"),
//!     ],
//! )
//! .with_selection(selected_ids);
//! ```

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::core::CorrelationId;

const FAILED_COUNT_KEY: &str = "failed_count";
const PARTIAL_FAILURES_KEY: &str = "partial_failures";
const PARTIAL_KEYS: [&str; 2] = [FAILED_COUNT_KEY, PARTIAL_FAILURES_KEY];

/// Well-known outcome codes produced by the pipeline itself.
pub mod codes {
    /// A selection was required but nothing was selected.
    pub const EMPTY_SELECTION: &str = "EMPTY_SELECTION";
    /// The selection provider failed.
    pub const SELECTION_PROVIDER_ERROR: &str = "SELECTION_PROVIDER_ERROR";
    /// The operation was cancelled while in flight.
    pub const ACTION_CANCELLED: &str = "ACTION_CANCELLED";
    /// The user declined a confirmation prompt.
    pub const CANCELLED: &str = "CANCELLED";
}

// =============================================================================
// Severity
// =============================================================================

/// Outcome classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// The action did what was asked.
    Success,
    /// Informational: acknowledgements, proceed tokens, declines, retries.
    Info,
    /// Recoverable problem: precondition failed or partial failure.
    Warning,
    /// The action failed.
    Error,
}

impl Severity {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Success => "success",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tri-state status kept for consumers that predate [`Severity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegacyStatus {
    Success,
    Warn,
    Error,
}

impl LegacyStatus {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            LegacyStatus::Success => "success",
            LegacyStatus::Warn => "warn",
            LegacyStatus::Error => "error",
        }
    }
}

/// One item that failed inside a bulk operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialFailure {
    /// Id of the item that failed.
    pub id: String,
    /// Why it failed, in user-facing terms.
    pub reason: String,
}

impl PartialFailure {
    pub fn new(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// The result of exactly one action invocation.
///
/// Immutable once built: the `with_*` methods consume the value and return a
/// new one, so an outcome that has been published can never change under a
/// listener.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    code: String,
    success: bool,
    severity: Severity,
    message: String,
    payload: Option<Value>,
    selection: Option<Vec<String>>,
    count: Option<usize>,
    duration_ms: Option<u64>,
    error_code: Option<String>,
    details: Option<String>,
    meta: Map<String, Value>,
    correlation_id: Option<CorrelationId>,
    timestamp: DateTime<Utc>,
}

impl Outcome {
    fn build(
        code: impl Into<String>,
        message: impl Into<String>,
        success: bool,
        severity: Severity,
    ) -> Self {
        Self {
            code: code.into(),
            success,
            severity,
            message: message.into(),
            payload: None,
            selection: None,
            count: None,
            duration_ms: None,
            error_code: None,
            details: None,
            meta: Map::new(),
            correlation_id: None,
            timestamp: Utc::now(),
        }
    }

    /// The action did what was asked.
    pub fn success(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::build(code, message, true, Severity::Success)
    }

    /// Informational acknowledgement ("backup started", confirmation proceed).
    pub fn info(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::build(code, message, true, Severity::Info)
    }

    /// Recoverable failure, e.g. a precondition such as an empty selection.
    pub fn warn(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::build(code, message, false, Severity::Warning)
    }

    /// Bulk operation where some items failed.
    ///
    /// Sets `meta.failed_count` and `meta.partial_failures` from `failed`, so
    /// the two always agree.
    pub fn partial(
        code: impl Into<String>,
        message: impl Into<String>,
        failed: impl IntoIterator<Item = PartialFailure>,
    ) -> Self {
        let failed: Vec<PartialFailure> = failed.into_iter().collect();
        let mut outcome = Self::build(code, message, false, Severity::Warning);
        outcome
            .meta
            .insert(FAILED_COUNT_KEY.into(), Value::from(failed.len()));
        outcome.meta.insert(
            PARTIAL_FAILURES_KEY.into(),
            Value::Array(
                failed
                    .iter()
                    .map(|f| json!({ "id": f.id, "reason": f.reason }))
                    .collect(),
            ),
        );
        outcome
    }

    /// The action failed.
    pub fn error(
        code: impl Into<String>,
        message: impl Into<String>,
        error_code: impl Into<String>,
        details: Option<String>,
    ) -> Self {
        let mut outcome = Self::build(code, message, false, Severity::Error);
        outcome.error_code = Some(error_code.into());
        outcome.details = details;
        outcome
    }

    /// The user declined to proceed.
    pub fn cancelled(message: Option<String>) -> Self {
        Self::build(
            codes::CANCELLED,
            message.unwrap_or_else(|| "Action cancelled".to_string()),
            false,
            Severity::Info,
        )
    }

    /// An attempt failed and another one is scheduled.
    pub fn retrying(
        code: impl Into<String>,
        message: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        let mut outcome = Self::build(code, message, false, Severity::Info);
        outcome.meta.insert("attempt".into(), Value::from(attempt));
        outcome
            .meta
            .insert("max_attempts".into(), Value::from(max_attempts));
        outcome
    }

    // -------------------------------------------------------------------------
    // Builders
    // -------------------------------------------------------------------------

    /// Attach operation-specific structured data.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Record the ids this outcome acted on.
    pub fn with_selection(mut self, selection: Vec<String>) -> Self {
        self.selection = Some(selection);
        self
    }

    /// Override the item count (defaults to the selection length).
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    /// Insert one key into `meta`.
    ///
    /// On a partial outcome `failed_count` and `partial_failures` are owned by
    /// [`Outcome::partial`] and writes to them are ignored.
    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        let key = key.into();
        if self.is_partial() && PARTIAL_KEYS.contains(&key.as_str()) {
            debug!(code = %self.code, key = %key, "ignoring write to partial failure meta");
            return self;
        }
        self.meta.insert(key, value);
        self
    }

    /// Tie this outcome to its trace events.
    pub fn with_correlation_id(mut self, cid: CorrelationId) -> Self {
        self.correlation_id = Some(cid);
        self
    }

    /// Freeze the measured wall-clock duration into the outcome.
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Legacy tri-state view of this outcome.
    pub fn status(&self) -> LegacyStatus {
        match (self.severity, self.success) {
            (Severity::Error, _) => LegacyStatus::Error,
            (Severity::Warning, _) => LegacyStatus::Warn,
            (Severity::Info, false) => LegacyStatus::Warn,
            (Severity::Info, true) | (Severity::Success, _) => LegacyStatus::Success,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    pub fn selection(&self) -> Option<&[String]> {
        self.selection.as_deref()
    }

    /// Explicit count, or the selection length when only a selection is set.
    pub fn count(&self) -> Option<usize> {
        self.count
            .or_else(|| self.selection.as_ref().map(|s| s.len()))
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error_code.as_deref()
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    pub fn meta(&self) -> &Map<String, Value> {
        &self.meta
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Returns true if this is a partial-failure outcome.
    pub fn is_partial(&self) -> bool {
        self.meta.contains_key(PARTIAL_FAILURES_KEY)
    }

    /// Returns true if this is a declined-confirmation outcome.
    pub fn is_cancelled(&self) -> bool {
        self.code == codes::CANCELLED
    }
}

impl Serialize for Outcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Outcome", 14)?;
        state.serialize_field("code", &self.code)?;
        state.serialize_field("success", &self.success)?;
        state.serialize_field("severity", &self.severity)?;
        state.serialize_field("status", &self.status())?;
        state.serialize_field("message", &self.message)?;
        state.serialize_field("payload", &self.payload)?;
        state.serialize_field("selection", &self.selection)?;
        state.serialize_field("count", &self.count())?;
        state.serialize_field("duration_ms", &self.duration_ms)?;
        state.serialize_field("error_code", &self.error_code)?;
        state.serialize_field("details", &self.details)?;
        state.serialize_field("meta", &self.meta)?;
        state.serialize_field("correlation_id", &self.correlation_id)?;
        state.serialize_field("timestamp", &self.timestamp)?;
        state.end()
    }
}

// =============================================================================
// Action Output
// =============================================================================

/// What an operation hands back: either a finished outcome or an arbitrary
/// value the orchestrator wraps into a generic success.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutput {
    /// The operation built its own outcome.
    Structured(Outcome),
    /// Any other value; stored under `payload.raw`.
    Raw(Value),
}

impl ActionOutput {
    /// Wrap any serializable value.
    ///
    /// A value that cannot be represented as JSON is replaced by a
    /// `{"serialization_failure": true}` marker.
    pub fn raw<T: Serialize>(value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => ActionOutput::Raw(v),
            Err(_) => ActionOutput::Raw(json!({ "serialization_failure": true })),
        }
    }

    /// Resolve into a canonical outcome for `action_name`.
    pub(crate) fn into_outcome(self, action_name: &str, scope: &str) -> Outcome {
        match self {
            ActionOutput::Structured(outcome) => outcome,
            ActionOutput::Raw(value) => Outcome::success(
                format!("{}_OK", scope),
                format!("{} completed", action_name),
            )
            .with_payload(json!({ "raw": value })),
        }
    }
}

impl From<Outcome> for ActionOutput {
    fn from(outcome: Outcome) -> Self {
        ActionOutput::Structured(outcome)
    }
}

impl From<Value> for ActionOutput {
    fn from(value: Value) -> Self {
        ActionOutput::Raw(value)
    }
}

impl From<()> for ActionOutput {
    fn from(_: ()) -> Self {
        ActionOutput::Raw(Value::Null)
    }
}
