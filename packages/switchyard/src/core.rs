//! Core identifiers shared by every switchyard component.
//!
//! # Correlation
//!
//! Every action invocation is tagged with a [`CorrelationId`]. The same id is
//! stamped on:
//! - the `ACTION_START` / `ACTION_END` / `ACTION_ERROR` trace events
//! - the `OUTCOME` event recorded by the fan-out
//! - the [`Outcome`](crate::Outcome) handed back to the caller
//!
//! so a toast shown to the user can always be tied back to its trace.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Opaque identifier linking all trace events and the final outcome of one
/// action invocation.
///
/// Backed by a random v4 UUID; displayed in the compact 32-hex-digit form.
///
/// # Example
///
/// ```ignore
/// use switchyard::CorrelationId;
///
/// let cid = CorrelationId::new();
/// let parsed: CorrelationId = cid.to_string().parse()?;
/// assert_eq!(cid, parsed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Create a new random correlation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }

    /// Get a reference to the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<CorrelationId> for Uuid {
    fn from(cid: CorrelationId) -> Uuid {
        cid.0
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    /// Accepts both the compact and the hyphenated UUID forms.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl Serialize for CorrelationId {
    /// Same compact form as `Display`, so trace records, sink lines and log
    /// output carry one spelling of the id.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CorrelationId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Handle returned by every `subscribe`-style registration; pass it back to
/// the matching `unsubscribe` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn from_counter(counter: &AtomicU64) -> Self {
        Self(counter.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Milliseconds since the Unix epoch, used for trace timestamps.
pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Normalize a human action name into the `SCREAMING_SNAKE` scope used for
/// outcome codes (`"backup db"` -> `"BACKUP_DB"`).
pub(crate) fn action_scope(action_name: &str) -> String {
    let mut scope = String::with_capacity(action_name.len());
    let mut last_was_sep = true;
    for ch in action_name.chars() {
        if ch.is_ascii_alphanumeric() {
            scope.push(ch.to_ascii_uppercase());
            last_was_sep = false;
        } else if !last_was_sep {
            scope.push('_');
            last_was_sep = true;
        }
    }
    while scope.ends_with('_') {
        scope.pop();
    }
    if scope.is_empty() {
        scope.push_str("ACTION");
    }
    scope
}

/// Truncate `text` to at most `max` bytes on a char boundary, appending an
/// ellipsis marker when anything was cut.
pub(crate) fn truncate_text(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(panic_info: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
