//! Named periodic task registry
//!
//! Each registered task runs on its own interval with startup jitter,
//! an optional per-run timeout, and an abort signal the handler must
//! honor. The registry never runs two instances of the same named task
//! concurrently and keeps per-task run statistics.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{MnemaError, Result};

/// Cooperative cancellation signal handed to task handlers
#[derive(Clone)]
pub struct AbortSignal {
    receiver: watch::Receiver<bool>,
}

impl AbortSignal {
    /// Wrap an existing watch receiver (used by standalone worker runs)
    pub fn from_receiver(receiver: watch::Receiver<bool>) -> Self {
        Self { receiver }
    }

    /// True once shutdown was requested
    pub fn is_aborted(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve when shutdown is requested
    pub async fn cancelled(&mut self) {
        while !*self.receiver.borrow() {
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// Error out at a suspension point if aborted
    pub fn check(&self, task: &str) -> Result<()> {
        if self.is_aborted() {
            Err(MnemaError::Aborted(task.to_string()))
        } else {
            Ok(())
        }
    }
}

/// Per-task run statistics
#[derive(Debug, Clone, Default)]
pub struct TaskStats {
    pub total_runs: u64,
    pub failures: u64,
    pub last_error: Option<String>,
    pub last_duration_ms: u64,
    pub last_run_at: Option<DateTime<Utc>>,
}

type Handler = Arc<dyn Fn(AbortSignal) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A named periodic task
pub struct TaskSpec {
    pub name: String,
    pub interval: Duration,
    pub timeout: Option<Duration>,
    pub handler: Handler,
}

impl TaskSpec {
    pub fn new<F, Fut>(name: &str, interval: Duration, handler: F) -> Self
    where
        F: Fn(AbortSignal) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            interval,
            timeout: None,
            handler: Arc::new(move |abort| Box::pin(handler(abort))),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

struct TaskEntry {
    stats: Arc<Mutex<TaskStats>>,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Registry of named periodic tasks
pub struct Scheduler {
    tasks: Mutex<HashMap<String, TaskEntry>>,
    abort_tx: watch::Sender<bool>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (abort_tx, _) = watch::channel(false);
        Self {
            tasks: Mutex::new(HashMap::new()),
            abort_tx,
        }
    }

    fn abort_signal(&self) -> AbortSignal {
        AbortSignal {
            receiver: self.abort_tx.subscribe(),
        }
    }

    /// Register and start a task. Re-registering a name replaces the
    /// previous task.
    pub fn register(&self, spec: TaskSpec) {
        let stats = Arc::new(Mutex::new(TaskStats::default()));
        let running = Arc::new(AtomicBool::new(false));
        let abort = self.abort_signal();

        let handle = tokio::spawn(run_task_loop(
            spec.name.clone(),
            spec.interval,
            spec.timeout,
            spec.handler,
            stats.clone(),
            running.clone(),
            abort,
        ));

        let mut tasks = self.tasks.lock();
        if let Some(previous) = tasks.insert(
            spec.name.clone(),
            TaskEntry {
                stats,
                running,
                handle,
            },
        ) {
            previous.handle.abort();
        }
    }

    /// Snapshot of one task's statistics
    pub fn stats(&self, name: &str) -> Option<TaskStats> {
        self.tasks.lock().get(name).map(|entry| entry.stats.lock().clone())
    }

    /// Registered task names
    pub fn task_names(&self) -> Vec<String> {
        self.tasks.lock().keys().cloned().collect()
    }

    /// Whether a task is currently mid-run
    pub fn is_running(&self, name: &str) -> bool {
        self.tasks
            .lock()
            .get(name)
            .map(|entry| entry.running.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Signal every task to stop, wait up to `grace` for in-flight
    /// handlers, then cancel whatever is left.
    pub async fn stop_all(&self, grace: Duration) {
        let _ = self.abort_tx.send(true);

        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut tasks = self.tasks.lock();
            tasks
                .drain()
                .map(|(name, entry)| (name, entry.handle))
                .collect()
        };

        let deadline = tokio::time::Instant::now() + grace;
        for (name, mut handle) in handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                tracing::warn!(task = %name, "task did not stop within grace period, cancelling");
                handle.abort();
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_task_loop(
    name: String,
    interval: Duration,
    timeout: Option<Duration>,
    handler: Handler,
    stats: Arc<Mutex<TaskStats>>,
    running: Arc<AtomicBool>,
    mut abort: AbortSignal,
) {
    // Jitter the first run into [0, 0.1 * interval]
    let jitter_ms = (interval.as_millis() as u64 / 10).max(1);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms));
    tokio::select! {
        _ = tokio::time::sleep(jitter) => {}
        _ = abort.cancelled() => return,
    }

    loop {
        if abort.is_aborted() {
            break;
        }

        // Skip-if-still-running singleton guard
        if running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let started = std::time::Instant::now();
            let run = handler(abort.clone());
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, run).await {
                    Ok(result) => result,
                    Err(_) => Err(MnemaError::Aborted(format!("{} timed out", name))),
                },
                None => run.await,
            };

            let mut s = stats.lock();
            s.total_runs += 1;
            s.last_duration_ms = started.elapsed().as_millis() as u64;
            s.last_run_at = Some(Utc::now());
            match result {
                Ok(()) => {
                    s.last_error = None;
                }
                Err(e) => {
                    s.failures += 1;
                    s.last_error = Some(e.to_string());
                    tracing::warn!(task = %name, "task run failed: {}", e);
                }
            }
            running.store(false, Ordering::SeqCst);
        } else {
            tracing::debug!(task = %name, "previous run still active, skipping tick");
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = abort.cancelled() => break,
        }
    }
    tracing::debug!(task = %name, "task loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[tokio::test(start_paused = true)]
    async fn test_task_runs_periodically() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU64::new(0));
        let c = counter.clone();

        scheduler.register(TaskSpec::new(
            "tick",
            Duration::from_secs(10),
            move |_abort| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        ));

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert!(counter.load(Ordering::SeqCst) >= 3);

        let stats = scheduler.stats("tick").unwrap();
        assert!(stats.total_runs >= 3);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_recorded_not_fatal() {
        let scheduler = Scheduler::new();
        scheduler.register(TaskSpec::new(
            "flaky",
            Duration::from_secs(5),
            |_abort| async { Err(MnemaError::Internal("boom".to_string())) },
        ));

        tokio::time::sleep(Duration::from_secs(20)).await;
        let stats = scheduler.stats("flaky").unwrap();
        assert!(stats.failures >= 2, "failures keep being counted");
        assert!(stats.last_error.as_deref().unwrap_or("").contains("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_aborts_overrunning_handler() {
        let scheduler = Scheduler::new();
        scheduler.register(
            TaskSpec::new("slow", Duration::from_secs(10), |_abort| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .with_timeout(Duration::from_secs(1)),
        );

        tokio::time::sleep(Duration::from_secs(15)).await;
        let stats = scheduler.stats("slow").unwrap();
        assert!(stats.failures >= 1);
        assert!(stats
            .last_error
            .as_deref()
            .unwrap_or("")
            .contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_honors_abort() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU64::new(0));
        let c = counter.clone();

        scheduler.register(TaskSpec::new(
            "worker",
            Duration::from_secs(5),
            move |abort| {
                let c = c.clone();
                async move {
                    for _ in 0..100 {
                        abort.check("worker")?;
                        c.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    Ok(())
                }
            },
        ));

        tokio::time::sleep(Duration::from_secs(7)).await;
        scheduler.stop_all(Duration::from_secs(5)).await;
        assert!(scheduler.task_names().is_empty());

        let after = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after, "no work after stop");
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_check_errors() {
        let (tx, rx) = watch::channel(false);
        let abort = AbortSignal { receiver: rx };
        assert!(abort.check("t").is_ok());
        tx.send(true).unwrap();
        assert!(matches!(abort.check("t"), Err(MnemaError::Aborted(_))));
    }
}
