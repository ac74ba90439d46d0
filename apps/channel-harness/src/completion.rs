use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Outcome reported once per test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionSignal {
    pub success: bool,
}

/// Reporting side of a test's one-shot completion signal. Clones share the
/// same slot; only the first report is kept.
#[derive(Debug, Clone)]
pub struct Completion {
    slot: Arc<Mutex<Option<oneshot::Sender<CompletionSignal>>>>,
}

#[derive(Debug)]
pub struct CompletionReceiver {
    rx: oneshot::Receiver<CompletionSignal>,
}

impl Completion {
    pub fn new() -> (Self, CompletionReceiver) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                slot: Arc::new(Mutex::new(Some(tx))),
            },
            CompletionReceiver { rx },
        )
    }

    /// Returns `false` when a result was already reported.
    pub fn report(&self, success: bool) -> bool {
        let Some(tx) = self.slot.lock().take() else {
            return false;
        };
        let _ = tx.send(CompletionSignal { success });
        true
    }

    pub fn is_reported(&self) -> bool {
        self.slot.lock().is_none()
    }
}

impl CompletionReceiver {
    /// Waits for the report. Losing every reporter without a report counts
    /// as a failure.
    pub async fn wait(self) -> CompletionSignal {
        self.rx
            .await
            .unwrap_or(CompletionSignal { success: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    async fn first_report_wins() {
        let (completion, rx) = Completion::new();
        let other = completion.clone();
        assert!(!completion.is_reported());
        assert!(other.report(false));
        assert!(!completion.report(true));
        assert!(completion.is_reported());
        assert_eq!(rx.wait().await, CompletionSignal { success: false });
    }

    #[test_timeout::timeout]
    async fn dropped_reporters_mean_failure() {
        let (completion, rx) = Completion::new();
        drop(completion);
        assert!(!rx.wait().await.success);
    }
}
