//! Wave scheduling of tasks.
//!
//! The queue is cut into waves of at most `concurrency` tasks. Every task in a
//! wave runs concurrently; the next wave starts only when each task of the
//! current one has a terminal status. Slots are numbered from 1 inside each
//! wave and reused by the next.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::task::{Task, TaskResult, TaskStatus};

/// Where a task runs inside the batch.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// 1-based position inside the wave
    pub slot: usize,
    /// 1-based wave number
    pub wave: usize,
    /// Fires when the batch is cancelled
    pub cancel: CancellationToken,
}

/// Executes one task to a result.
///
/// Errors and panics are contained by the scheduler and turned into a failed
/// result for that task only.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &Task, ctx: &RunContext) -> anyhow::Result<TaskResult>;
}

/// Outcome of a whole batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Results that came from transcript heuristics rather than an artifact
    pub heuristic: usize,
    pub waves: usize,
    pub tasks: Vec<Task>,
}

impl BatchReport {
    fn new(tasks: Vec<Task>, waves: usize) -> Self {
        let count = |status| tasks.iter().filter(|t| t.status() == status).count();
        let heuristic = tasks
            .iter()
            .filter_map(Task::result)
            .filter(|r| !r.is_structured())
            .count();

        Self {
            total: tasks.len(),
            passed: count(TaskStatus::Passed),
            failed: count(TaskStatus::Failed),
            heuristic,
            waves,
            tasks,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }
}

pub struct BatchScheduler {
    runner: Arc<dyn TaskRunner>,
    concurrency: usize,
    cancel: CancellationToken,
}

impl BatchScheduler {
    /// `concurrency` is clamped to at least 1.
    pub fn new(runner: Arc<dyn TaskRunner>, concurrency: usize) -> Self {
        Self {
            runner,
            concurrency: concurrency.max(1),
            cancel: CancellationToken::new(),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Token that cancels the whole batch: running tasks are interrupted and
    /// tasks not yet started fail without running.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run every task and return them, in input order, each with a terminal status.
    pub async fn run(&self, tasks: Vec<Task>) -> BatchReport {
        let mut finished = Vec::with_capacity(tasks.len());
        let mut waves = 0;
        let mut queue = tasks.into_iter().peekable();

        while queue.peek().is_some() {
            let wave: Vec<Task> = queue.by_ref().take(self.concurrency).collect();

            if self.cancel.is_cancelled() {
                finished.extend(wave.into_iter().enumerate().map(|(i, task)| {
                    conclude(task, i + 1, TaskResult::failure("Batch cancelled before the task started", None))
                }));
                continue;
            }

            waves += 1;
            info!(wave = waves, tasks = wave.len(), "Starting wave");
            let done = self.run_wave(waves, wave).await;
            info!(
                wave = waves,
                passed = done.iter().filter(|t| t.status() == TaskStatus::Passed).count(),
                failed = done.iter().filter(|t| t.status() == TaskStatus::Failed).count(),
                "Wave complete"
            );
            finished.extend(done);
        }

        let report = BatchReport::new(finished, waves);
        info!(
            total = report.total,
            passed = report.passed,
            failed = report.failed,
            heuristic = report.heuristic,
            waves = report.waves,
            "Batch complete"
        );
        report
    }

    async fn run_wave(&self, wave: usize, tasks: Vec<Task>) -> Vec<Task> {
        let mut pending = Vec::with_capacity(tasks.len());
        let mut handles = Vec::with_capacity(tasks.len());

        for (i, mut task) in tasks.into_iter().enumerate() {
            let slot = i + 1;
            if let Err(e) = task.start(slot) {
                warn!(task_id = %task.id(), error = %e, "Task is not pending; running it anyway");
            }

            let runner = Arc::clone(&self.runner);
            let ctx = RunContext {
                slot,
                wave,
                cancel: self.cancel.child_token(),
            };
            // Kept so a panicking runner still yields this task.
            pending.push(task.clone());
            handles.push(tokio::spawn(async move {
                let result = runner.run(&task, &ctx).await;
                (task, result)
            }));
        }

        let outcomes = join_all(handles).await;

        pending
            .into_iter()
            .zip(outcomes)
            .enumerate()
            .map(|(i, (fallback, outcome))| {
                let slot = i + 1;
                match outcome {
                    Ok((task, Ok(result))) => conclude(task, slot, result),
                    Ok((task, Err(e))) => {
                        error!(task_id = %task.id(), slot, error = %format!("{:#}", e), "Task runner failed");
                        let summary = format!("Runner error: {:#}", e);
                        conclude(task, slot, TaskResult::failure(summary.clone(), Some(summary)))
                    }
                    Err(join_error) => {
                        let reason = if join_error.is_panic() {
                            format!("Task panicked: {}", panic_message(join_error.into_panic()))
                        } else {
                            "Task was aborted".to_string()
                        };
                        error!(task_id = %fallback.id(), slot, reason = %reason, "Task did not complete");
                        conclude(fallback, slot, TaskResult::failure(reason.clone(), Some(reason)))
                    }
                }
            })
            .collect()
    }
}

/// Bring a task to its terminal status with `result`.
fn conclude(mut task: Task, slot: usize, result: TaskResult) -> Task {
    if task.status() == TaskStatus::Pending {
        let _ = task.start(slot);
    }
    let pass = result.pass;
    if let Err(e) = task.finish(result) {
        warn!(task_id = %task.id(), error = %e, "Could not record task result");
    }
    info!(task_id = %task.id(), slot, pass, status = %task.status(), "Task finished");
    task
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ResultSource, TaskId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn tasks(n: usize) -> Vec<Task> {
        (1..=n)
            .map(|i| Task::new(TaskId::new(format!("t{}", i)), format!("Task {}", i), "do it").unwrap())
            .collect()
    }

    fn passing() -> TaskResult {
        TaskResult {
            pass: true,
            passed: 1,
            total: 1,
            ..TaskResult::failure("ok", None)
        }
        .with_source(ResultSource::TaskArtifact)
    }

    /// Records concurrency, slots and wave ordering.
    #[derive(Default)]
    struct RecordingRunner {
        running: AtomicUsize,
        max_running: AtomicUsize,
        finished: AtomicUsize,
        starts: Mutex<Vec<(String, usize, usize, usize)>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TaskRunner for RecordingRunner {
        async fn run(&self, task: &Task, ctx: &RunContext) -> anyhow::Result<TaskResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            self.starts.lock().unwrap().push((
                task.id().to_string(),
                ctx.slot,
                ctx.wave,
                self.finished.load(Ordering::SeqCst),
            ));

            tokio::time::sleep(Duration::from_millis(20)).await;

            self.running.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(passing())
        }
    }

    #[tokio::test]
    async fn waves_never_exceed_the_concurrency_limit() {
        let runner = Arc::new(RecordingRunner::default());
        let scheduler = BatchScheduler::new(runner.clone(), 2);

        let report = scheduler.run(tasks(5)).await;

        assert_eq!(report.total, 5);
        assert_eq!(report.passed, 5);
        assert_eq!(report.waves, 3);
        assert!(report.all_passed());
        assert!(runner.max_running.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn next_wave_waits_for_the_current_one() {
        let runner = Arc::new(RecordingRunner::default());
        BatchScheduler::new(runner.clone(), 2).run(tasks(5)).await;

        for (id, _, wave, finished_before_start) in runner.starts.lock().unwrap().iter() {
            assert!(
                *finished_before_start >= (wave - 1) * 2,
                "{id} in wave {wave} started after only {finished_before_start} completions"
            );
        }
    }

    #[tokio::test]
    async fn slots_are_one_based_and_reused_across_waves() {
        let runner = Arc::new(RecordingRunner::default());
        let report = BatchScheduler::new(runner.clone(), 2).run(tasks(4)).await;

        let slots: Vec<Option<usize>> = report.tasks.iter().map(Task::slot).collect();
        assert_eq!(slots, vec![Some(1), Some(2), Some(1), Some(2)]);

        let ids: Vec<&str> = report.tasks.iter().map(|t| t.id().as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2", "t3", "t4"]);
    }

    struct FlakyRunner;

    #[async_trait]
    impl TaskRunner for FlakyRunner {
        async fn run(&self, task: &Task, _ctx: &RunContext) -> anyhow::Result<TaskResult> {
            match task.id().as_str() {
                "t2" => anyhow::bail!("agent binary exploded"),
                "t3" => panic!("runner bug"),
                _ => Ok(passing()),
            }
        }
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_the_wave() {
        let report = BatchScheduler::new(Arc::new(FlakyRunner), 3).run(tasks(3)).await;

        assert_eq!(report.total, 3);
        assert_eq!(report.passed, 1);
        assert_eq!(report.failed, 2);
        assert!(report.tasks.iter().all(|t| t.status().is_terminal()));

        let summary = |i: usize| report.tasks[i].result().unwrap().summary.clone();
        assert!(summary(1).contains("agent binary exploded"));
        assert!(summary(2).contains("runner bug"));
        assert_eq!(report.tasks[2].result().unwrap().source, ResultSource::Orchestrator);
    }

    #[tokio::test]
    async fn cancelled_batch_skips_unstarted_tasks() {
        let runner = Arc::new(RecordingRunner::default());
        let scheduler = BatchScheduler::new(runner.clone(), 2);
        scheduler.cancel();

        let report = scheduler.run(tasks(3)).await;
        assert_eq!(report.failed, 3);
        assert_eq!(report.waves, 0);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }

    struct CancellingRunner {
        scheduler_token: CancellationToken,
    }

    #[async_trait]
    impl TaskRunner for CancellingRunner {
        async fn run(&self, task: &Task, ctx: &RunContext) -> anyhow::Result<TaskResult> {
            if task.id().as_str() == "t1" {
                self.scheduler_token.cancel();
                ctx.cancel.cancelled().await;
                return Ok(TaskResult::failure("cancelled", None));
            }
            Ok(passing())
        }
    }

    #[tokio::test]
    async fn cancelling_mid_batch_reaches_running_tasks() {
        let token = CancellationToken::new();
        let scheduler = BatchScheduler {
            runner: Arc::new(CancellingRunner {
                scheduler_token: token.clone(),
            }),
            concurrency: 2,
            cancel: token,
        };

        let report = tokio::time::timeout(Duration::from_secs(5), scheduler.run(tasks(4)))
            .await
            .expect("cancellation should not hang");
        assert_eq!(report.waves, 1);
        assert_eq!(report.passed, 1);
        assert_eq!(report.failed, 3);
    }

    #[tokio::test]
    async fn heuristic_results_are_counted() {
        struct HeuristicRunner;

        #[async_trait]
        impl TaskRunner for HeuristicRunner {
            async fn run(&self, _task: &Task, _ctx: &RunContext) -> anyhow::Result<TaskResult> {
                Ok(TaskResult {
                    pass: true,
                    ..TaskResult::failure("parsed", None)
                }
                .with_source(ResultSource::Transcript))
            }
        }

        let report = BatchScheduler::new(Arc::new(HeuristicRunner), 4).run(tasks(2)).await;
        assert_eq!(report.heuristic, 2);
        assert_eq!(report.passed, 2);
    }
}
