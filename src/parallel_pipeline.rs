// THEORY:
// The `parallel_pipeline` runs chunk tasks. Planning decides *what* runs; this
// module only decides *how*, behind the `ChunkExecutor` trait, so the pipeline can
// swap a worker pool for an inline loop without touching grouping or evaluation.
//
// `WorkerPool` is a task queue plus a result channel:
// 1.  Every task is pushed onto an unbounded queue up front, then the sender is
//     dropped so the queue drains to `None`.
// 2.  `worker_count` workers pull from the shared receiver until it is empty. The
//     CPU-bound evaluation runs on the blocking pool so the runtime stays free.
// 3.  Each result is sent back once, by value. Collection order is completion order;
//     the writer re-sorts, so nothing downstream depends on it.
//
// A chunk that panics becomes a `WpdError::Worker` outcome for that chunk alone.

use crate::core_modules::chunk_planner::chunk_planner::ChunkTask;
use crate::core_modules::exposure::{ChunkContext, ChunkResult};
use crate::error::{WpdError, WpdResult};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info};

/// Upper bound on the host-derived default worker count.
pub const MAX_DEFAULT_WORKERS: usize = 14;

pub fn default_worker_count() -> usize {
    num_cpus::get().clamp(1, MAX_DEFAULT_WORKERS)
}

/// What came back for one chunk.
#[derive(Debug)]
pub struct ChunkOutcome {
    pub label: String,
    pub result: WpdResult<ChunkResult>,
}

pub trait ChunkExecutor {
    fn execute(
        &self,
        tasks: Vec<ChunkTask>,
        context: Arc<ChunkContext>,
    ) -> impl Future<Output = Vec<ChunkOutcome>> + Send;
}

pub struct WorkerPool {
    worker_count: usize,
}

impl WorkerPool {
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count: worker_count.max(1),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }
}

impl ChunkExecutor for WorkerPool {
    async fn execute(&self, tasks: Vec<ChunkTask>, context: Arc<ChunkContext>) -> Vec<ChunkOutcome> {
        let total = tasks.len();
        if total == 0 {
            return Vec::new();
        }

        let (task_sender, task_receiver) = mpsc::unbounded_channel::<ChunkTask>();
        for task in tasks {
            let _ = task_sender.send(task);
        }
        drop(task_sender);
        let queue = Arc::new(Mutex::new(task_receiver));

        let (result_sender, mut result_receiver) = mpsc::unbounded_channel::<ChunkOutcome>();
        let spawned = self.worker_count.min(total);
        info!(chunks = total, workers = spawned, "dispatching chunks");

        let workers: Vec<_> = (0..spawned)
            .map(|worker_id| {
                let queue = Arc::clone(&queue);
                let context = Arc::clone(&context);
                let result_sender = result_sender.clone();
                tokio::spawn(async move {
                    loop {
                        let next = { queue.lock().await.recv().await };
                        let Some(task) = next else { break };
                        let label = task.label.clone();
                        debug!(worker = worker_id, chunk = %label, "chunk started");

                        let context = Arc::clone(&context);
                        let result = tokio::task::spawn_blocking(move || context.evaluate(&task))
                            .await
                            .map_err(|e| WpdError::Worker(format!("{label}: {e}")));
                        if result_sender.send(ChunkOutcome { label, result }).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();
        drop(result_sender);

        let mut outcomes = Vec::with_capacity(total);
        while let Some(outcome) = result_receiver.recv().await {
            outcomes.push(outcome);
            log_progress(outcomes.len(), total, &outcomes[outcomes.len() - 1]);
        }

        for joined in join_all(workers).await {
            if let Err(e) = joined {
                error!(error = %e, "worker task failed");
            }
        }
        outcomes
    }
}

/// Runs every chunk on the calling task, in plan order.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl ChunkExecutor for InlineExecutor {
    async fn execute(&self, tasks: Vec<ChunkTask>, context: Arc<ChunkContext>) -> Vec<ChunkOutcome> {
        let total = tasks.len();
        let mut outcomes = Vec::with_capacity(total);
        for task in tasks {
            let outcome = ChunkOutcome {
                label: task.label.clone(),
                result: Ok(context.evaluate(&task)),
            };
            outcomes.push(outcome);
            log_progress(outcomes.len(), total, &outcomes[outcomes.len() - 1]);
        }
        outcomes
    }
}

/// Logs the first, the last, and every quarter of completed chunks.
fn log_progress(done: usize, total: usize, outcome: &ChunkOutcome) {
    let quarter = total / 4;
    if done == 1 || done == total || (quarter > 0 && done % quarter == 0) {
        let records = outcome.result.as_ref().map_or(0, |r| r.records.len());
        info!(done, total, chunk = %outcome.label, records, "chunk completed");
    }
}
