//! Periodic durable checkpoints.
//!
//! A [`CheckpointScheduler`] owns one background task per open document. The
//! task reads the pipeline's [`DocumentView`] through a watch channel, so a
//! slow or failing store never blocks edits. Each tick persists the content
//! if its revision has not been written yet; failures are retried on the
//! next tick. Every checkpoint lists the operation ids its content includes
//! so a later load can drop redelivered copies of them.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::history::{Checkpoint, CheckpointEncoding, HistoryStore};
use crate::pipeline::DocumentView;
use crate::protocol::{now_millis, DocumentId};

/// Outcome of the most recent checkpoint attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointStatus {
    /// Nothing written yet.
    Idle,
    Persisted {
        revision: u64,
        at: u64,
    },
    Failed {
        revision: u64,
        error: String,
        consecutive_failures: u32,
    },
}

pub struct CheckpointScheduler {
    document_id: DocumentId,
    task: JoinHandle<()>,
    status: watch::Receiver<CheckpointStatus>,
}

impl CheckpointScheduler {
    /// Start the writer task for one document.
    pub fn spawn(
        document_id: DocumentId,
        view: watch::Receiver<DocumentView>,
        history: Arc<dyn HistoryStore>,
        interval: Duration,
        encoding: CheckpointEncoding,
    ) -> Self {
        let (status_tx, status) = watch::channel(CheckpointStatus::Idle);
        let writer = CheckpointWriter {
            document_id: document_id.clone(),
            history,
            encoding,
            status: status_tx,
            persisted: None,
            failures: 0,
        };
        let task = tokio::spawn(writer.run(view, interval));
        log::debug!("Checkpoint scheduler started for {document_id} every {interval:?}");

        Self {
            document_id,
            task,
            status,
        }
    }

    /// Latest status.
    pub fn status(&self) -> CheckpointStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<CheckpointStatus> {
        self.status.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop writing. Dropping the scheduler has the same effect.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for CheckpointScheduler {
    fn drop(&mut self) {
        self.task.abort();
        log::debug!("Checkpoint scheduler stopped for {}", self.document_id);
    }
}

struct CheckpointWriter {
    document_id: DocumentId,
    history: Arc<dyn HistoryStore>,
    encoding: CheckpointEncoding,
    status: watch::Sender<CheckpointStatus>,
    persisted: Option<u64>,
    failures: u32,
}

impl CheckpointWriter {
    async fn run(mut self, view: watch::Receiver<DocumentView>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if view.has_changed().is_err() {
                // Pipeline gone.
                break;
            }
            let current = view.borrow().clone();
            self.tick(current).await;
        }
    }

    async fn tick(&mut self, view: DocumentView) {
        if !view.ready || view.revision <= view.loaded_revision {
            return;
        }
        if self.persisted == Some(view.revision) {
            return;
        }

        let result = match Checkpoint::capture(
            self.document_id.clone(),
            view.revision,
            &view.content,
            self.encoding,
        ) {
            Ok(checkpoint) => {
                let checkpoint = checkpoint.with_operations(view.operations.to_vec());
                self.history.append(&self.document_id, checkpoint).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.persisted = Some(view.revision);
                self.failures = 0;
                log::debug!(
                    "Checkpointed {} at revision {}",
                    self.document_id,
                    view.revision
                );
                self.status.send_replace(CheckpointStatus::Persisted {
                    revision: view.revision,
                    at: now_millis(),
                });
            }
            Err(e) => {
                self.failures += 1;
                log::warn!(
                    "Checkpoint of {} at revision {} failed ({} in a row): {e}",
                    self.document_id,
                    view.revision,
                    self.failures
                );
                self.status.send_replace(CheckpointStatus::Failed {
                    revision: view.revision,
                    error: e.to_string(),
                    consecutive_failures: self.failures,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::Delta;
    use crate::history::MemoryHistory;
    use crate::protocol::OperationId;

    fn view(revision: u64, loaded_revision: u64, text: &str) -> DocumentView {
        DocumentView {
            revision,
            loaded_revision,
            ready: true,
            content: Arc::new(Delta::from_text(text)),
            operations: Arc::new(Vec::new()),
        }
    }

    async fn wait_for_status(
        scheduler: &CheckpointScheduler,
        accept: impl Fn(&CheckpointStatus) -> bool,
    ) -> CheckpointStatus {
        let mut rx = scheduler.subscribe();
        let status = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| accept(s)))
            .await
            .expect("status timeout")
            .expect("scheduler gone")
            .clone();
        status
    }

    #[tokio::test]
    async fn test_persists_new_revision_once() {
        let history = Arc::new(MemoryHistory::new());
        let doc = DocumentId::new("doc-1");
        let (tx, rx) = watch::channel(view(3, 0, "hello"));
        let scheduler = CheckpointScheduler::spawn(
            doc.clone(),
            rx,
            history.clone(),
            Duration::from_millis(10),
            CheckpointEncoding::Json,
        );

        let status = wait_for_status(&scheduler, |s| matches!(s, CheckpointStatus::Persisted { .. })).await;
        assert!(matches!(status, CheckpointStatus::Persisted { revision: 3, .. }));

        // unchanged revision is not rewritten
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(history.checkpoint_count(&doc).await, 1);
        let latest = history.latest(&doc).await.unwrap();
        assert_eq!(latest.content().unwrap().plain_text(), "hello");

        tx.send_replace(view(4, 0, "hello!"));
        wait_for_status(&scheduler, |s| matches!(s, CheckpointStatus::Persisted { revision: 4, .. })).await;
        assert_eq!(history.checkpoint_count(&doc).await, 2);
    }

    #[tokio::test]
    async fn test_checkpoint_lists_included_operations() {
        let history = Arc::new(MemoryHistory::new());
        let doc = DocumentId::new("doc-1");
        let included = vec![OperationId::new(), OperationId::new()];
        let mut current = view(2, 0, "ab");
        current.operations = Arc::new(included.clone());
        let (_tx, rx) = watch::channel(current);
        let scheduler = CheckpointScheduler::spawn(
            doc.clone(),
            rx,
            history.clone(),
            Duration::from_millis(10),
            CheckpointEncoding::Json,
        );

        wait_for_status(&scheduler, |s| matches!(s, CheckpointStatus::Persisted { .. })).await;
        assert_eq!(history.latest(&doc).await.unwrap().operations, included);
    }

    #[tokio::test]
    async fn test_skips_unready_and_freshly_loaded() {
        let history = Arc::new(MemoryHistory::new());
        let doc = DocumentId::new("doc-1");
        let mut loading = view(2, 0, "x");
        loading.ready = false;
        let (tx, rx) = watch::channel(loading);
        let scheduler = CheckpointScheduler::spawn(
            doc.clone(),
            rx,
            history.clone(),
            Duration::from_millis(10),
            CheckpointEncoding::Json,
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send_replace(view(5, 5, "loaded"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(history.checkpoint_count(&doc).await, 0);
        assert_eq!(scheduler.status(), CheckpointStatus::Idle);
    }

    #[tokio::test]
    async fn test_failure_is_reported_and_retried() {
        let history = Arc::new(MemoryHistory::new());
        history.fail_next_appends(2);
        let doc = DocumentId::new("doc-1");
        let (_tx, rx) = watch::channel(view(1, 0, "a"));
        let scheduler = CheckpointScheduler::spawn(
            doc.clone(),
            rx,
            history.clone(),
            Duration::from_millis(40),
            CheckpointEncoding::Lz4Json,
        );

        let failed = wait_for_status(&scheduler, |s| {
            matches!(s, CheckpointStatus::Failed { consecutive_failures: 2, .. })
        })
        .await;
        assert!(matches!(failed, CheckpointStatus::Failed { revision: 1, .. }));

        wait_for_status(&scheduler, |s| matches!(s, CheckpointStatus::Persisted { .. })).await;
        assert_eq!(history.checkpoint_count(&doc).await, 1);
    }

    #[tokio::test]
    async fn test_drop_stops_task() {
        let history = Arc::new(MemoryHistory::new());
        let doc = DocumentId::new("doc-1");
        let (tx, rx) = watch::channel(view(0, 0, ""));
        let scheduler = CheckpointScheduler::spawn(
            doc.clone(),
            rx,
            history.clone(),
            Duration::from_millis(10),
            CheckpointEncoding::Json,
        );
        assert!(scheduler.is_running());
        scheduler.stop();

        tx.send_replace(view(9, 0, "late"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(history.checkpoint_count(&doc).await, 0);
    }

    #[tokio::test]
    async fn test_exits_when_pipeline_dropped() {
        let history = Arc::new(MemoryHistory::new());
        let (tx, rx) = watch::channel(view(0, 0, ""));
        let scheduler = CheckpointScheduler::spawn(
            DocumentId::new("doc-1"),
            rx,
            history,
            Duration::from_millis(10),
            CheckpointEncoding::Json,
        );
        drop(tx);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!scheduler.is_running());
    }
}
