//! Change observation for the live document.
//!
//! Subscribes once to the document root and, for every relevant mutation
//! batch, schedules one pipeline run after the settle delay. Relevant
//! batches are not coalesced; each schedules its own run and the
//! deduplicator absorbs the repeats.

use crate::dom::{DocumentTree, MutationBatch, MutationSubscription, ObserveOptions};
use crate::extractor::ExtractionPattern;
use crate::pipeline::{CapturePipeline, RunReport};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Count of spawned runs that have not finished yet
#[derive(Debug, Clone)]
pub struct PendingRuns {
    count: Arc<watch::Sender<usize>>,
}

impl Default for PendingRuns {
    fn default() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
        }
    }
}

impl PendingRuns {
    /// Spawn `task`, counting it as pending until it completes or is aborted
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.count.send_modify(|n| *n += 1);
        let guard = PendingGuard {
            count: Arc::clone(&self.count),
        };
        tokio::spawn(async move {
            let _guard = guard;
            task.await
        })
    }

    pub fn len(&self) -> usize {
        *self.count.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve once no run is pending
    pub async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

struct PendingGuard {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.count.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Outcome of dispatching one mutation batch
#[derive(Debug)]
pub struct Dispatch {
    /// Records in the batch
    pub records: usize,
    /// Delayed run scheduled for a relevant batch
    pub scheduled: Option<JoinHandle<RunReport>>,
}

impl Dispatch {
    pub fn is_relevant(&self) -> bool {
        self.scheduled.is_some()
    }
}

/// Watches the document and schedules pipeline runs
pub struct ChangeObserver {
    pipeline: Weak<CapturePipeline>,
    pattern: ExtractionPattern,
    settle_delay: Duration,
    subscription: MutationSubscription,
    pending: PendingRuns,
}

impl ChangeObserver {
    /// Subscribe to the pipeline's document root.
    ///
    /// The observer does not keep the pipeline alive; once the pipeline and
    /// every document handle are dropped the subscription ends.
    pub fn install(pipeline: &Arc<CapturePipeline>, settle_delay: Duration) -> Self {
        let document = pipeline.document();
        let subscription = document.observe(document.root(), Self::observe_options());
        let pattern = pipeline.extractor().pattern().clone();
        debug!("Change observer installed (settle delay {:?})", settle_delay);

        Self {
            pipeline: Arc::downgrade(pipeline),
            pattern,
            settle_delay,
            subscription,
            pending: PendingRuns::default(),
        }
    }

    /// Runs scheduled by this observer that are still waiting or running
    pub fn pending_runs(&self) -> PendingRuns {
        self.pending.clone()
    }

    /// Child-list and class/id attribute changes across the whole subtree
    pub fn observe_options() -> ObserveOptions {
        ObserveOptions {
            child_list: true,
            attributes: true,
            subtree: true,
            attribute_filter: Some(vec!["class".to_string(), "id".to_string()]),
            ..ObserveOptions::default()
        }
    }

    /// A batch is relevant if any inserted node carries the marker or holds
    /// an answer block, or any mutation target carries the marker. The tag
    /// only narrows the descendant lookup.
    pub fn is_relevant(&self, tree: &DocumentTree, batch: &MutationBatch) -> bool {
        batch.iter().any(|record| {
            trace!("Mutation on node {}: {:?}", record.target, record.kind);
            record
                .added_nodes()
                .iter()
                .any(|&node| self.pattern.matches_within(tree, node))
                || self.pattern.has_marker(tree, record.target)
        })
    }

    /// Schedule a delayed run if the batch is relevant
    pub fn handle_batch(&self, batch: &MutationBatch) -> Option<JoinHandle<RunReport>> {
        let pipeline = self.pipeline.upgrade()?;
        let relevant = {
            let tree = pipeline.document().read();
            self.is_relevant(&tree, batch)
        };
        if !relevant {
            return None;
        }

        debug!(
            "Relevant change ({} records), extracting in {:?}",
            batch.len(),
            self.settle_delay
        );
        let delay = self.settle_delay;
        Some(self.pending.spawn(async move {
            tokio::time::sleep(delay).await;
            pipeline.run().await
        }))
    }

    /// Await the next batch and dispatch it; `None` once the document is gone
    pub async fn dispatch_next(&mut self) -> Option<Dispatch> {
        let batch = self.subscription.next_batch().await?;
        Some(Dispatch {
            records: batch.len(),
            scheduled: self.handle_batch(&batch),
        })
    }

    /// Dispatcher loop for the lifetime of the document.
    ///
    /// Scheduled runs are detached and always execute after their delay.
    pub async fn run(mut self) {
        while let Some(dispatch) = self.dispatch_next().await {
            if dispatch.scheduled.is_none() {
                trace!("Ignoring {} irrelevant mutations", dispatch.records);
            }
        }
        warn!("Document closed, change observer stopping");
    }
}
