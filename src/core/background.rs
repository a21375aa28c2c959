use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::core::config::FleetConfig;

/// Explicit snapshot of the caller's ambient state, captured at submission
/// time and handed to the task closure. Tasks never reach for request-local
/// or global state.
#[derive(Clone)]
pub struct TaskContext {
    pub principal: Option<String>,
    pub config: Arc<FleetConfig>,
}

impl TaskContext {
    pub fn new(principal: Option<String>, config: Arc<FleetConfig>) -> Self {
        Self { principal, config }
    }
}

struct PoolTask {
    description: String,
    fut: std::pin::Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>,
}

struct PoolInner {
    tx: Mutex<Option<mpsc::Sender<PoolTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Bounded worker pool for side-effect work that must not block request
/// handling: retention purges, notification delivery and whatever external
/// collaborators (mail, reports) submit through the generic entry point.
///
/// Constructed once at startup; the handle is cheap to clone and passed
/// explicitly to every component that submits work. Task failures are logged
/// with their description and never reach the submitter. Shutdown drains
/// best-effort with a deadline; tasks still queued past it are abandoned.
#[derive(Clone)]
pub struct TaskPool {
    inner: Arc<PoolInner>,
}

impl TaskPool {
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (tx, rx) = mpsc::channel::<PoolTask>(256);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let rx = rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let task = { rx.lock().await.recv().await };
                    let Some(task) = task else {
                        break;
                    };
                    run_task(worker_id, task).await;
                }
            }));
        }

        info!("Task pool started with {} workers", worker_count);
        Self {
            inner: Arc::new(PoolInner {
                tx: Mutex::new(Some(tx)),
                workers: Mutex::new(workers),
            }),
        }
    }

    /// Queue a task with its context snapshot. Returns whether the task was
    /// accepted; a full queue or a shut-down pool drops the task with a
    /// warning, which is the documented best-effort contract.
    pub async fn submit<F, Fut>(&self, description: &str, ctx: TaskContext, task: F) -> bool
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let sender = { self.inner.tx.lock().await.clone() };
        let Some(sender) = sender else {
            warn!("Task pool is shut down; dropping task: {}", description);
            return false;
        };

        let queued = PoolTask {
            description: description.to_string(),
            fut: Box::pin(task(ctx)),
        };
        match sender.try_send(queued) {
            Ok(()) => true,
            Err(e) => {
                warn!("Task pool rejected task ({}): {}", description, e);
                false
            }
        }
    }

    /// Best-effort drain: close the queue, give in-flight workers up to
    /// `grace` to finish, then abandon the rest.
    pub async fn shutdown(&self, grace: Duration) {
        {
            let mut tx = self.inner.tx.lock().await;
            if tx.take().is_none() {
                return;
            }
        }

        let workers: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.inner.workers.lock().await);
        let drain = async {
            for worker in workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("Task pool drain exceeded {:?}; pending tasks abandoned", grace);
        } else {
            info!("Task pool drained");
        }
    }
}

async fn run_task(worker_id: usize, task: PoolTask) {
    let description = task.description;
    // An inner spawn isolates panics: a panicking task surfaces as a
    // JoinError here instead of taking the worker down.
    match tokio::spawn(task.fut).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("Background task failed ({}): {:#}", description, e);
        }
        Err(join_err) => {
            error!(
                "Background task panicked ({}) on worker {}: {}",
                description, worker_id, join_err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_ctx(principal: Option<&str>) -> TaskContext {
        TaskContext::new(
            principal.map(str::to_string),
            Arc::new(FleetConfig::default()),
        )
    }

    #[tokio::test]
    async fn submitted_tasks_run_with_their_context_snapshot() {
        let pool = TaskPool::new(2);
        let (tx, rx) = tokio::sync::oneshot::channel();

        let accepted = pool
            .submit("echo principal", test_ctx(Some("ops")), move |ctx| async move {
                let _ = tx.send(ctx.principal.clone());
                Ok(())
            })
            .await;
        assert!(accepted);
        assert_eq!(rx.await.unwrap().as_deref(), Some("ops"));
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn failing_task_does_not_poison_the_pool() {
        let pool = TaskPool::new(1);
        let ran_after_failure = Arc::new(AtomicUsize::new(0));

        pool.submit("always fails", test_ctx(None), |_ctx| async {
            anyhow::bail!("boom")
        })
        .await;

        let counter = ran_after_failure.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        pool.submit("after failure", test_ctx(None), move |_ctx| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
            Ok(())
        })
        .await;

        rx.await.unwrap();
        assert_eq!(ran_after_failure.load(Ordering::SeqCst), 1);
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn panicking_task_is_contained() {
        let pool = TaskPool::new(1);
        pool.submit("panics", test_ctx(None), |_ctx| async {
            panic!("worker must survive this");
        })
        .await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        pool.submit("survivor", test_ctx(None), move |_ctx| async move {
            let _ = tx.send(());
            Ok(())
        })
        .await;
        rx.await.unwrap();
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn shutdown_rejects_further_submissions() {
        let pool = TaskPool::new(1);
        pool.shutdown(Duration::from_secs(1)).await;
        let accepted = pool
            .submit("too late", test_ctx(None), |_ctx| async { Ok(()) })
            .await;
        assert!(!accepted);
    }

    #[tokio::test]
    async fn shutdown_twice_is_a_noop() {
        let pool = TaskPool::new(1);
        pool.shutdown(Duration::from_secs(1)).await;
        pool.shutdown(Duration::from_secs(1)).await;
    }
}
