//! Selection tracker: per-table selected ids with diff-based notification.
//!
//! Each view (the "files" table, the "clients" table, ...) owns one ordered,
//! de-duplicated list of selected ids. Every update computes the delta
//! against the previous list, records one `SELECTION` trace event carrying
//! that delta, and then notifies the table's listeners.
//!
//! Listeners run after the table entry lock is released, so a listener may
//! read or even update selections itself.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;

use crate::core::{panic_message, SubscriptionId};
use crate::trace::{EventKind, TraceDraft, TraceHub, TraceLevel};

/// Callback invoked with `(table_id, selected_ids)` after every update.
pub type SelectionListener = Arc<dyn Fn(&str, &[String]) -> Result<()> + Send + Sync>;

/// Current selection of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSelection {
    pub table_id: String,
    pub ids: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Delta between two successive selections of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectionDiff {
    pub table_id: String,
    /// In new-selection order.
    pub added: Vec<String>,
    /// In old-selection order.
    pub removed: Vec<String>,
}

impl SelectionDiff {
    /// Returns true if the update changed nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Registry of per-table selections and their listeners.
pub struct SelectionTracker {
    tables: DashMap<String, TableSelection>,
    listeners: DashMap<String, Vec<(SubscriptionId, SelectionListener)>>,
    next_id: AtomicU64,
    trace: Arc<TraceHub>,
}

impl SelectionTracker {
    pub fn new(trace: Arc<TraceHub>) -> Self {
        Self {
            tables: DashMap::new(),
            listeners: DashMap::new(),
            next_id: AtomicU64::new(1),
            trace,
        }
    }

    /// Replace the selection of `table_id` and notify its listeners.
    pub fn update_selection<I, S>(&self, table_id: &str, ids: I) -> SelectionDiff
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let ids: Vec<String> = ids
            .into_iter()
            .map(Into::into)
            .filter(|id| seen.insert(id.clone()))
            .collect();

        let diff = {
            let mut entry = self
                .tables
                .entry(table_id.to_string())
                .or_insert_with(|| TableSelection {
                    table_id: table_id.to_string(),
                    ids: Vec::new(),
                    updated_at: Utc::now(),
                });

            let old: HashSet<&String> = entry.ids.iter().collect();
            let added: Vec<String> = ids.iter().filter(|id| !old.contains(id)).cloned().collect();
            let removed: Vec<String> = entry
                .ids
                .iter()
                .filter(|id| !seen.contains(*id))
                .cloned()
                .collect();

            entry.ids = ids.clone();
            entry.updated_at = Utc::now();

            SelectionDiff {
                table_id: table_id.to_string(),
                added,
                removed,
            }
        };

        self.trace.emit(
            TraceDraft::new(EventKind::Selection, TraceLevel::Debug)
                .action(table_id)
                .message(format!(
                    "{} selected (+{} / -{})",
                    ids.len(),
                    diff.added.len(),
                    diff.removed.len()
                ))
                .meta(&json!({
                    "table_id": table_id,
                    "count": ids.len(),
                    "added": diff.added,
                    "removed": diff.removed,
                })),
        );

        self.notify(table_id, &ids);
        diff
    }

    /// Deselect everything in `table_id`.
    pub fn clear(&self, table_id: &str) -> SelectionDiff {
        self.update_selection(table_id, Vec::<String>::new())
    }

    /// Select every id in `all_ids`.
    pub fn select_all<I, S>(&self, table_id: &str, all_ids: I) -> SelectionDiff
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.update_selection(table_id, all_ids)
    }

    /// Current selection, in selection order. Empty for unknown tables.
    pub fn get_selected(&self, table_id: &str) -> Vec<String> {
        self.tables
            .get(table_id)
            .map(|entry| entry.ids.clone())
            .unwrap_or_default()
    }

    /// Full record for `table_id`, if it was ever updated.
    pub fn snapshot(&self, table_id: &str) -> Option<TableSelection> {
        self.tables.get(table_id).map(|entry| entry.clone())
    }

    /// Every table that has been updated at least once.
    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.tables.iter().map(|e| e.key().clone()).collect();
        tables.sort();
        tables
    }

    /// Register a listener for `table_id`.
    pub fn subscribe<F>(&self, table_id: &str, listener: F) -> SubscriptionId
    where
        F: Fn(&str, &[String]) -> Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId::from_counter(&self.next_id);
        self.listeners
            .entry(table_id.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, table_id: &str, id: SubscriptionId) -> bool {
        let Some(mut entry) = self.listeners.get_mut(table_id) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|(sid, _)| *sid != id);
        before != entry.len()
    }

    /// A selection provider reading the current selection of `table_id`,
    /// for use with [`RunOptions::require_selection`](crate::RunOptions::require_selection).
    pub fn provider(self: &Arc<Self>, table_id: &str) -> impl Fn() -> Result<Vec<String>> + Send + Sync + 'static {
        let tracker = Arc::clone(self);
        let table_id = table_id.to_string();
        move || Ok(tracker.get_selected(&table_id))
    }

    fn notify(&self, table_id: &str, ids: &[String]) {
        let listeners: Vec<SelectionListener> = self
            .listeners
            .get(table_id)
            .map(|entry| entry.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();

        for listener in listeners {
            let failure = match catch_unwind(AssertUnwindSafe(|| listener(table_id, ids))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(panic_info) => format!("listener panicked: {}", panic_message(panic_info.as_ref())),
            };
            self.trace.emit(
                TraceDraft::new(EventKind::ListenerError, TraceLevel::Error)
                    .action(table_id)
                    .message(format!("selection listener failed: {}", failure))
                    .meta(&json!({ "table_id": table_id, "error": failure })),
            );
        }
    }
}

impl std::fmt::Debug for SelectionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectionTracker")
            .field("tables", &self.tables.len())
            .field("listener_tables", &self.listeners.len())
            .finish()
    }
}
