//! Applies one stage to every document of a batch.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, warn};

use super::stats::StageStats;
use crate::models::{DocumentRecord, FileKind};

/// Result of a stage transform. Stages report failure through this value
/// instead of returning errors.
#[derive(Debug)]
pub enum StageOutcome {
    Processed(DocumentRecord),
    /// Nothing to do for this document; it stays pending.
    Skipped(DocumentRecord, String),
    Failed(DocumentRecord, String),
}

/// Enough of a document to report it failed once its task is gone.
#[derive(Debug, Clone)]
struct Identity {
    path: PathBuf,
    kind: FileKind,
    file_hash: Option<String>,
}

impl Identity {
    fn of(doc: &DocumentRecord) -> Self {
        Self {
            path: doc.path.clone(),
            kind: doc.kind,
            file_hash: doc.file_hash.clone(),
        }
    }

    fn lost(self, stage: &str) -> StageOutcome {
        error!("{}: task for {} ended without a result", stage, self.path.display());
        let mut doc = DocumentRecord::new(self.path, self.kind);
        doc.file_hash = self.file_hash;
        StageOutcome::Failed(doc, "worker task panicked".to_string())
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the stage has work for `doc`. Documents it does not apply to
    /// pass through untouched and uncounted.
    fn applies(&self, _doc: &DocumentRecord) -> bool {
        true
    }

    async fn process(&self, doc: DocumentRecord) -> StageOutcome;
}

/// Documents after a stage, plus its counters.
#[derive(Debug, Default)]
pub struct StageReport {
    pub documents: Vec<DocumentRecord>,
    pub stats: StageStats,
}

impl StageReport {
    fn record(&mut self, stage: &str, outcome: StageOutcome) {
        match outcome {
            StageOutcome::Processed(doc) => {
                self.stats.processed += 1;
                self.documents.push(doc);
            }
            StageOutcome::Skipped(doc, reason) => {
                debug!("{stage}: skipped {}: {reason}", doc.key());
                self.stats.skipped += 1;
                self.documents.push(doc);
            }
            StageOutcome::Failed(mut doc, error) => {
                warn!("{stage}: {} failed: {error}", doc.key());
                doc.mark_failed(format!("{stage}: {error}"));
                self.stats.failed += 1;
                self.documents.push(doc);
            }
        }
    }
}

/// Runs a stage over a batch, either in order or on a bounded pool of
/// tokio tasks. Failed documents from earlier stages are passed through
/// and counted as skipped; they never reach the stage.
#[derive(Debug, Clone, Copy)]
pub struct StageRunner {
    max_workers: usize,
    parallel: bool,
}

impl StageRunner {
    pub fn new(max_workers: usize, parallel: bool) -> Self {
        Self {
            max_workers: max_workers.max(1),
            parallel,
        }
    }

    pub fn sequential() -> Self {
        Self::new(1, false)
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel && self.max_workers > 1
    }

    pub async fn run(&self, stage: Arc<dyn Stage>, documents: Vec<DocumentRecord>) -> StageReport {
        let mut report = StageReport {
            documents: Vec::with_capacity(documents.len()),
            stats: StageStats::default(),
        };

        let mut work = Vec::with_capacity(documents.len());
        for doc in documents {
            if doc.is_failed() {
                report.stats.skipped += 1;
                report.documents.push(doc);
            } else if stage.applies(&doc) {
                work.push(doc);
            } else {
                report.documents.push(doc);
            }
        }

        if work.is_empty() {
            return report;
        }

        if self.is_parallel() {
            self.run_concurrent(stage, work, &mut report).await;
        } else {
            for doc in work {
                let outcome = Self::run_one(stage.clone(), doc).await;
                report.record(stage.name(), outcome);
            }
        }

        report
    }

    /// One transform on its own task, so a panic fails only that document.
    async fn run_one(stage: Arc<dyn Stage>, doc: DocumentRecord) -> StageOutcome {
        let identity = Identity::of(&doc);
        let task_stage = stage.clone();
        match tokio::spawn(async move { task_stage.process(doc).await }).await {
            Ok(outcome) => outcome,
            Err(_) => identity.lost(stage.name()),
        }
    }

    /// Every document is submitted at once; a semaphore keeps at most
    /// `max_workers` transforms running and results come back over a
    /// channel in completion order.
    async fn run_concurrent(
        &self,
        stage: Arc<dyn Stage>,
        work: Vec<DocumentRecord>,
        report: &mut StageReport,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, StageOutcome)>();

        let mut pending: BTreeMap<usize, Identity> = BTreeMap::new();

        for (idx, doc) in work.into_iter().enumerate() {
            pending.insert(idx, Identity::of(&doc));

            let semaphore = semaphore.clone();
            let stage = stage.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let outcome = stage.process(doc).await;
                let _ = tx.send((idx, outcome));
            });
        }
        drop(tx);

        while let Some((idx, outcome)) = rx.recv().await {
            pending.remove(&idx);
            report.record(stage.name(), outcome);
        }

        for identity in pending.into_values() {
            let outcome = identity.lost(stage.name());
            report.record(stage.name(), outcome);
        }
    }
}
