use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::lifecycle::{FileOutcome, FileProcessor};

/// Totals over the lifetime of one service run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServiceSummary {
    pub completed: usize,
    pub errored: usize,
    /// Duplicate discoveries and files that vanished before processing
    pub ignored: usize,
}

#[derive(Default)]
struct Counters {
    completed: AtomicUsize,
    errored: AtomicUsize,
    ignored: AtomicUsize,
}

impl Counters {
    fn record(&self, outcome: &FileOutcome) {
        let counter = match outcome {
            FileOutcome::Completed { .. } => &self.completed,
            FileOutcome::Errored { .. } => &self.errored,
            FileOutcome::AlreadyInFlight | FileOutcome::Vanished => &self.ignored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceSummary {
        ServiceSummary {
            completed: self.completed.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
        }
    }
}

/// Consumes discovered paths and processes them with bounded concurrency
pub struct IngestService {
    processor: Arc<FileProcessor>,
    max_concurrent_files: usize,
}

impl IngestService {
    pub fn new(processor: Arc<FileProcessor>, max_concurrent_files: usize) -> Self {
        Self {
            processor,
            max_concurrent_files: max_concurrent_files.max(1),
        }
    }

    /// Process paths until the sender side closes or `cancel` fires, then wait
    /// for in-flight files.
    ///
    /// On cancel, queued paths that never started are dropped; their files stay
    /// in the watch directory for the next backlog scan.
    pub async fn run(self, mut rx: mpsc::Receiver<PathBuf>, cancel: CancellationToken) -> ServiceSummary {
        tracing::info!(workers = self.max_concurrent_files, "Ingest service started");

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_files));
        let tracker = TaskTracker::new();
        let counters = Arc::new(Counters::default());

        loop {
            let path = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(path) => path,
                    None => break,
                },
            };

            // Backpressure: hold the channel until a slot frees up
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let processor = self.processor.clone();
            let counters = counters.clone();
            tracker.spawn(async move {
                let outcome = processor.handle(&path).await;
                counters.record(&outcome);
                drop(permit);
            });
        }

        if cancel.is_cancelled() {
            rx.close();
            let mut left = 0;
            while rx.try_recv().is_ok() {
                left += 1;
            }
            if left > 0 {
                tracing::info!(files = left, "Queued files left for the next backlog scan");
            }
        }

        tracker.close();
        if !tracker.is_empty() {
            tracing::info!(files = tracker.len(), "Waiting for in-flight files");
        }
        tracker.wait().await;

        let summary = counters.snapshot();
        tracing::info!(
            completed = summary.completed,
            errored = summary.errored,
            ignored = summary.ignored,
            "Ingest service stopped"
        );
        summary
    }
}
