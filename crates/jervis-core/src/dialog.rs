use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tracing::warn;

use crate::types::DialogResult;

/// Published to the UI layer (HTTP/SSE) when a dialog becomes active.
#[derive(Debug, Clone)]
pub struct DialogRequest {
    pub dialog_id: String,
    pub correlation_id: String,
    pub client_id: i64,
    pub project_id: Option<i64>,
    pub question: String,
    pub proposed_answer: Option<String>,
}

/// Broadcast when the active dialog completes, for UIs tracking a close event.
#[derive(Debug, Clone)]
pub struct DialogClosed {
    pub dialog_id: String,
    pub correlation_id: String,
}

enum DialogState {
    Idle,
    Active {
        dialog_id: String,
        correlation_id: String,
        result_tx: Option<oneshot::Sender<DialogResult>>,
    },
}

/// Single-active-dialog gate (C12). At most one dialog is active across the
/// process; concurrent `request_dialog` callers serialize on `idle_notify`
/// and each gets its own `DialogResult` once it becomes the active one —
/// generalizes the teacher's single-slot `ChatCollector`/`ChatState` machine.
pub struct DialogCoordinator {
    state: Mutex<DialogState>,
    idle_notify: Notify,
    next_id: AtomicU64,
    request_tx: mpsc::UnboundedSender<DialogRequest>,
    closed_tx: mpsc::UnboundedSender<DialogClosed>,
    timeout: Duration,
}

impl DialogCoordinator {
    pub fn new(
        timeout: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DialogRequest>, mpsc::UnboundedReceiver<DialogClosed>) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(Self {
            state: Mutex::new(DialogState::Idle),
            idle_notify: Notify::new(),
            next_id: AtomicU64::new(1),
            request_tx,
            closed_tx,
            timeout,
        });
        (coordinator, request_rx, closed_rx)
    }

    /// Awaits any currently-active dialog, then becomes the active dialog
    /// itself, publishes a request to the UI, and awaits its own result
    /// (or the configured timeout, resolved as "closed by user").
    pub async fn request_dialog(
        &self,
        client_id: i64,
        project_id: Option<i64>,
        correlation_id: &str,
        question: &str,
        proposed_answer: Option<&str>,
    ) -> DialogResult {
        let rx = loop {
            let mut state = self.state.lock().await;
            if matches!(*state, DialogState::Idle) {
                let dialog_id = format!("dlg-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
                let (tx, rx) = oneshot::channel();
                *state = DialogState::Active {
                    dialog_id: dialog_id.clone(),
                    correlation_id: correlation_id.to_string(),
                    result_tx: Some(tx),
                };
                drop(state);
                let _ = self.request_tx.send(DialogRequest {
                    dialog_id,
                    correlation_id: correlation_id.to_string(),
                    client_id,
                    project_id,
                    question: question.to_string(),
                    proposed_answer: proposed_answer.map(str::to_string),
                });
                break rx;
            }
            drop(state);
            self.idle_notify.notified().await;
        };

        let result = tokio::time::timeout(self.timeout, rx).await;
        let resolved = match result {
            Ok(Ok(dialog_result)) => dialog_result,
            Ok(Err(_)) | Err(_) => DialogResult {
                accepted: false,
                answer: None,
                closed_by_user: true,
            },
        };
        self.close_active().await;
        resolved
    }

    /// Rejects a mismatched `(dialog_id, correlation_id)` with a warning and
    /// leaves state untouched.
    pub async fn handle_client_response(&self, dialog_id: &str, correlation_id: &str, answer: &str) {
        let mut state = self.state.lock().await;
        if let DialogState::Active { dialog_id: active_id, correlation_id: active_corr, result_tx } = &mut *state {
            if active_id != dialog_id || active_corr != correlation_id {
                warn!(dialog_id, correlation_id, "dialog response ids do not match active dialog");
                return;
            }
            if let Some(tx) = result_tx.take() {
                let _ = tx.send(DialogResult {
                    accepted: true,
                    answer: Some(answer.to_string()),
                    closed_by_user: false,
                });
            }
        } else {
            warn!(dialog_id, correlation_id, "dialog response received with no active dialog");
        }
    }

    pub async fn handle_client_close(&self, dialog_id: &str, correlation_id: &str) {
        let mut state = self.state.lock().await;
        if let DialogState::Active { dialog_id: active_id, correlation_id: active_corr, result_tx } = &mut *state {
            if active_id != dialog_id || active_corr != correlation_id {
                warn!(dialog_id, correlation_id, "dialog close ids do not match active dialog");
                return;
            }
            if let Some(tx) = result_tx.take() {
                let _ = tx.send(DialogResult {
                    accepted: false,
                    answer: None,
                    closed_by_user: true,
                });
            }
        } else {
            warn!(dialog_id, correlation_id, "dialog close received with no active dialog");
        }
    }

    async fn close_active(&self) {
        let (dialog_id, correlation_id) = {
            let mut state = self.state.lock().await;
            let ids = match &*state {
                DialogState::Active { dialog_id, correlation_id, .. } => {
                    (dialog_id.clone(), correlation_id.clone())
                }
                DialogState::Idle => return,
            };
            *state = DialogState::Idle;
            ids
        };
        let _ = self.closed_tx.send(DialogClosed { dialog_id, correlation_id });
        self.idle_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_caller_waits_for_first_to_complete() {
        let (coordinator, mut requests, _closed) = DialogCoordinator::new(Duration::from_secs(5));

        let c1 = coordinator.clone();
        let first = tokio::spawn(async move {
            c1.request_dialog(1, None, "corr-1", "q1", None).await
        });

        let req1 = requests.recv().await.expect("first request published");
        assert_eq!(req1.correlation_id, "corr-1");

        let c2 = coordinator.clone();
        let second = tokio::spawn(async move {
            c2.request_dialog(1, None, "corr-2", "q2", None).await
        });

        // second caller must not have published a request yet.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(requests.try_recv().is_err());

        coordinator
            .handle_client_response(&req1.dialog_id, &req1.correlation_id, "yes")
            .await;

        let result1 = first.await.unwrap();
        assert_eq!(result1.answer.as_deref(), Some("yes"));
        assert!(!result1.closed_by_user);

        let req2 = requests.recv().await.expect("second request published after first closes");
        assert_eq!(req2.correlation_id, "corr-2");
        coordinator
            .handle_client_close(&req2.dialog_id, &req2.correlation_id)
            .await;
        let result2 = second.await.unwrap();
        assert!(result2.closed_by_user);
    }

    #[tokio::test]
    async fn mismatched_ids_are_rejected_without_resolving() {
        let (coordinator, mut requests, _closed) = DialogCoordinator::new(Duration::from_millis(100));
        let c1 = coordinator.clone();
        let handle = tokio::spawn(async move { c1.request_dialog(1, None, "corr-1", "q", None).await });
        let req = requests.recv().await.unwrap();

        coordinator.handle_client_response("wrong-id", &req.correlation_id, "no").await;
        // timeout fires since the real dialog was never resolved.
        let result = handle.await.unwrap();
        assert!(result.closed_by_user);
    }
}
