//! Bounded worker pool: executes one conflict group's calls with fixed
//! parallelism, preserving input order in the output.

use codewright_core::{CancellationToken, TaskResult, Tool, ToolOutput};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};

/// One executable unit: a tool plus its normalized input.
pub struct PoolTask {
    pub id: String,
    pub name: String,
    pub tool: Arc<dyn Tool>,
    pub args: serde_json::Value,
}

/// Progress snapshot emitted before and after each task. Emission is
/// best-effort (`try_send`) and never blocks task completion.
#[derive(Debug, Clone)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub in_flight: Vec<String>,
}

/// A pool with a fixed worker count (≥ 1). With N workers and M ≤ N
/// tasks, all M run concurrently; M > N tasks queue.
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Execute a batch. Returns exactly one result per task, in the
    /// order the tasks were submitted, regardless of completion order.
    ///
    /// A task whose dispatch happens after cancellation short-circuits
    /// to an `"execution cancelled"` error result; a task already
    /// handed to its tool is left to the tool's own cancellation
    /// handling. Either way the result slot is filled, so the caller
    /// never waits on a missing entry.
    pub fn execute_batch(
        &self,
        cancel: &CancellationToken,
        tasks: Vec<PoolTask>,
        progress: Option<&mpsc::SyncSender<Progress>>,
    ) -> Vec<TaskResult> {
        let total = tasks.len();
        if total == 0 {
            return Vec::new();
        }

        let (task_tx, task_rx) = mpsc::channel::<(usize, PoolTask)>();
        for item in tasks.into_iter().enumerate() {
            let _ = task_tx.send(item);
        }
        drop(task_tx);
        let task_rx = Arc::new(Mutex::new(task_rx));

        let (result_tx, result_rx) = mpsc::channel::<(usize, TaskResult)>();
        let completed = AtomicUsize::new(0);
        let in_flight: Mutex<Vec<String>> = Mutex::new(Vec::new());

        let worker_count = self.workers.min(total);
        std::thread::scope(|scope| {
            for _ in 0..worker_count {
                let task_rx = Arc::clone(&task_rx);
                let result_tx = result_tx.clone();
                let completed = &completed;
                let in_flight = &in_flight;
                scope.spawn(move || {
                    loop {
                        let next = {
                            let Ok(queue) = task_rx.lock() else { break };
                            queue.recv()
                        };
                        let Ok((index, task)) = next else { break };

                        if let Ok(mut names) = in_flight.lock() {
                            names.push(task.name.clone());
                        }
                        emit_progress(progress, total, completed, in_flight);

                        let result = if cancel.is_cancelled() {
                            TaskResult {
                                id: task.id.clone(),
                                name: task.name.clone(),
                                result: ToolOutput::error("execution cancelled"),
                                err: Some("execution cancelled".to_string()),
                            }
                        } else {
                            let output = task.tool.execute(cancel, &task.args);
                            TaskResult {
                                id: task.id.clone(),
                                name: task.name.clone(),
                                result: output,
                                err: None,
                            }
                        };

                        if let Ok(mut names) = in_flight.lock()
                            && let Some(pos) = names.iter().position(|n| n == &task.name)
                        {
                            names.remove(pos);
                        }
                        completed.fetch_add(1, Ordering::SeqCst);
                        emit_progress(progress, total, completed, in_flight);

                        let _ = result_tx.send((index, result));
                    }
                });
            }
            drop(result_tx);
        });

        // All workers have joined; drain the result channel into the
        // pre-sized slot vector keyed by original index.
        let mut slots: Vec<Option<TaskResult>> = (0..total).map(|_| None).collect();
        while let Ok((index, result)) = result_rx.recv() {
            slots[index] = Some(result);
        }
        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| TaskResult {
                    id: format!("task-{index}"),
                    name: String::new(),
                    result: ToolOutput::error("worker terminated"),
                    err: Some("worker terminated".to_string()),
                })
            })
            .collect()
    }
}

fn emit_progress(
    progress: Option<&mpsc::SyncSender<Progress>>,
    total: usize,
    completed: &AtomicUsize,
    in_flight: &Mutex<Vec<String>>,
) {
    let Some(tx) = progress else { return };
    let snapshot = Progress {
        total,
        completed: completed.load(Ordering::SeqCst),
        in_flight: in_flight.lock().map(|names| names.clone()).unwrap_or_default(),
    };
    let _ = tx.try_send(snapshot);
}
