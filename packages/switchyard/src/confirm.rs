//! Confirmation gate: a yes/no prompt turned into a proceed/cancel outcome.
//!
//! This is the only place the pipeline waits on a human. Without a dialog
//! collaborator (headless runs, tests) the gate proceeds immediately.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::core::CorrelationId;
use crate::outcome::Outcome;
use crate::trace::{EventKind, TraceDraft, TraceHub, TraceLevel};

/// Presents a yes/no question to the user.
#[async_trait]
pub trait ConfirmationDialog: Send + Sync + 'static {
    /// Returns true if the user chose to proceed.
    async fn show_confirmation(&self, title: &str, message: &str) -> bool;
}

/// One confirmation prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmRequest {
    pub title: String,
    pub message: String,
    pub proceed_code: String,
    pub proceed_message: String,
    pub cancel_message: Option<String>,
    pub correlation_id: Option<CorrelationId>,
}

impl ConfirmRequest {
    pub fn new(
        title: impl Into<String>,
        message: impl Into<String>,
        proceed_code: impl Into<String>,
        proceed_message: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            proceed_code: proceed_code.into(),
            proceed_message: proceed_message.into(),
            cancel_message: None,
            correlation_id: None,
        }
    }

    pub fn cancel_message(mut self, message: impl Into<String>) -> Self {
        self.cancel_message = Some(message.into());
        self
    }

    /// Record the decision under an existing invocation.
    pub fn correlation_id(mut self, cid: CorrelationId) -> Self {
        self.correlation_id = Some(cid);
        self
    }
}

/// Wraps an optional [`ConfirmationDialog`].
#[derive(Clone)]
pub struct ConfirmationGate {
    dialog: Option<Arc<dyn ConfirmationDialog>>,
    trace: Arc<TraceHub>,
}

impl ConfirmationGate {
    pub fn new(trace: Arc<TraceHub>, dialog: Option<Arc<dyn ConfirmationDialog>>) -> Self {
        Self { dialog, trace }
    }

    /// Returns true when prompts are actually shown to a user.
    pub fn is_interactive(&self) -> bool {
        self.dialog.is_some()
    }

    /// Ask, and map the answer to `info(proceed_code)` or `cancelled`.
    pub async fn confirm(&self, request: &ConfirmRequest) -> Outcome {
        let (proceed, interactive) = match &self.dialog {
            Some(dialog) => (
                dialog
                    .show_confirmation(&request.title, &request.message)
                    .await,
                true,
            ),
            None => (true, false),
        };

        let mut outcome = if proceed {
            Outcome::info(request.proceed_code.clone(), request.proceed_message.clone())
        } else {
            Outcome::cancelled(request.cancel_message.clone())
        };
        if let Some(cid) = request.correlation_id {
            outcome = outcome.with_correlation_id(cid);
        }

        self.trace.emit(
            TraceDraft::new(EventKind::Confirmation, TraceLevel::Info)
                .action(request.title.clone())
                .maybe_correlation_id(request.correlation_id)
                .message(if proceed { "confirmed" } else { "declined" })
                .meta(&json!({
                    "proceed": proceed,
                    "interactive": interactive,
                    "code": outcome.code(),
                })),
        );

        outcome
    }
}

impl std::fmt::Debug for ConfirmationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationGate")
            .field("interactive", &self.is_interactive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{codes, Severity};
    use crate::testing::ScriptedDialog;

    fn request() -> ConfirmRequest {
        ConfirmRequest::new(
            "Delete files",
            "Delete 3 files?",
            "FILE_DELETE_CONFIRMED",
            "Deleting 3 files",
        )
        .cancel_message("Nothing was deleted")
    }

    #[tokio::test]
    async fn test_no_dialog_proceeds() {
        let trace = Arc::new(TraceHub::new());
        let gate = ConfirmationGate::new(trace.clone(), None);

        let outcome = gate.confirm(&request()).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.severity(), Severity::Info);
        assert_eq!(outcome.code(), "FILE_DELETE_CONFIRMED");

        let events = trace.export_recent(10, Some(&EventKind::Confirmation), None);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].meta["interactive"], false);
    }

    #[tokio::test]
    async fn test_yes_proceeds_with_request_text() {
        let trace = Arc::new(TraceHub::new());
        let dialog = Arc::new(ScriptedDialog::new([true]));
        let gate = ConfirmationGate::new(trace, Some(dialog.clone()));

        let outcome = gate.confirm(&request()).await;

        assert_eq!(outcome.code(), "FILE_DELETE_CONFIRMED");
        assert_eq!(outcome.message(), "Deleting 3 files");
        assert_eq!(
            dialog.prompts(),
            vec![("Delete files".to_string(), "Delete 3 files?".to_string())]
        );
    }

    #[tokio::test]
    async fn test_no_yields_cancelled() {
        let trace = Arc::new(TraceHub::new());
        let gate = ConfirmationGate::new(trace.clone(), Some(Arc::new(ScriptedDialog::new([false]))));

        let outcome = gate.confirm(&request()).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.code(), codes::CANCELLED);
        assert_eq!(outcome.message(), "Nothing was deleted");

        let events = trace.export_recent(10, Some(&EventKind::Confirmation), None);
        assert_eq!(events[0].message.as_deref(), Some("declined"));
    }
}
