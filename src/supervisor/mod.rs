//! Supervisor: runs the node's long-lived tasks until shutdown or failure.
//!
//! # Task model
//!
//! A [`Task`] is an independently-runnable unit (a listener, typically) with
//! its shared state captured at construction.  [`run`] spawns every task
//! before observing any of them, then waits.
//!
//! Any task ending while the lifecycle token is still live is fatal: an
//! error, a panic, and a clean return all count.  The supervisor then cancels
//! the token so siblings stop cooperatively, drains them, and returns the
//! first error.  Cancelling the token from outside (ctrl-c) is a normal
//! shutdown and yields `Ok`.

pub mod readiness;

use std::future::Future;
use std::pin::Pin;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::AppError;
use readiness::ReadinessRegistry;

/// A boxed, owned future returned by [`Task::run`].
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + 'static>>;

/// A supervised, concurrently-runnable unit.
pub trait Task: Send + 'static {
    /// Stable identifier used in log messages.
    fn id(&self) -> &str;

    /// Consume the task and return its run loop.  The future should run
    /// until `shutdown` is cancelled.
    fn run(self: Box<Self>, shutdown: CancellationToken) -> TaskFuture;
}

/// Run `tasks` until `shutdown` is cancelled or one of them ends.
pub async fn run(
    tasks: Vec<Box<dyn Task>>,
    shutdown: CancellationToken,
    readiness: ReadinessRegistry,
) -> Result<(), AppError> {
    let mut set: JoinSet<(String, Result<(), AppError>)> = JoinSet::new();
    for task in tasks {
        let id = task.id().to_string();
        debug!(task = %id, "spawning task");
        let fut = task.run(shutdown.clone());
        set.spawn(async move { (id, fut.await) });
    }

    if set.is_empty() {
        info!("no tasks to supervise; waiting for shutdown");
        shutdown.cancelled().await;
        return Ok(());
    }

    tokio::spawn({
        let readiness = readiness.clone();
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                ready = readiness.wait_ready() => {
                    if ready {
                        let listeners = readiness.snapshot().await;
                        info!(?listeners, "node ready");
                    }
                }
                _ = shutdown.cancelled() => {}
            }
        }
    });

    let mut first_err: Option<AppError> = None;
    while let Some(joined) = set.join_next().await {
        let failure = match joined {
            Err(e) => Some(AppError::Listener(format!("task panicked: {e}"))),
            Ok((id, Err(e))) => {
                error!(task = %id, "task failed: {e}");
                Some(e)
            }
            Ok((id, Ok(()))) if !shutdown.is_cancelled() => {
                Some(AppError::Listener(format!("{id} exited unexpectedly")))
            }
            Ok((id, Ok(()))) => {
                debug!(task = %id, "task stopped");
                None
            }
        };
        if let Some(e) = failure {
            if first_err.is_none() && !shutdown.is_cancelled() {
                error!("fatal: {e}; shutting down");
            }
            shutdown.cancel();
            first_err.get_or_insert(e);
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => {
            info!("all tasks stopped");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct Failing;

    impl Task for Failing {
        fn id(&self) -> &str {
            "failing"
        }

        fn run(self: Box<Self>, _shutdown: CancellationToken) -> TaskFuture {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err(AppError::Listener("bind failed".into()))
            })
        }
    }

    struct Healthy(Arc<AtomicBool>);

    impl Task for Healthy {
        fn id(&self) -> &str {
            "healthy"
        }

        fn run(self: Box<Self>, shutdown: CancellationToken) -> TaskFuture {
            Box::pin(async move {
                shutdown.cancelled().await;
                self.0.store(true, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    struct Quits;

    impl Task for Quits {
        fn id(&self) -> &str {
            "quits"
        }

        fn run(self: Box<Self>, _shutdown: CancellationToken) -> TaskFuture {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn one_failure_stops_everything() {
        let stopped = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();
        let tasks: Vec<Box<dyn Task>> = vec![Box::new(Healthy(stopped.clone())), Box::new(Failing)];

        let err = run(tasks, shutdown.clone(), ReadinessRegistry::new()).await.unwrap_err();

        assert!(err.to_string().contains("bind failed"));
        assert!(shutdown.is_cancelled());
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn external_cancel_is_clean() {
        let stopped = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();
        let tasks: Vec<Box<dyn Task>> = vec![Box::new(Healthy(stopped.clone()))];
        let handle = tokio::spawn(run(tasks, shutdown.clone(), ReadinessRegistry::new()));
        shutdown.cancel();
        assert!(handle.await.unwrap().is_ok());
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn clean_exit_before_shutdown_is_fatal() {
        let shutdown = CancellationToken::new();
        let tasks: Vec<Box<dyn Task>> = vec![Box::new(Quits)];
        let err = run(tasks, shutdown.clone(), ReadinessRegistry::new()).await.unwrap_err();
        assert!(err.to_string().contains("quits exited unexpectedly"));
        assert!(shutdown.is_cancelled());
    }

    struct BindsThenWaits(readiness::ReadinessReporter);

    impl Task for BindsThenWaits {
        fn id(&self) -> &str {
            "binds"
        }

        fn run(self: Box<Self>, shutdown: CancellationToken) -> TaskFuture {
            Box::pin(async move {
                self.0.set_bound("127.0.0.1:1").await;
                shutdown.cancelled().await;
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn readiness_is_logged_from_a_spawned_task() {
        let registry = ReadinessRegistry::new();
        let shutdown = CancellationToken::new();
        let tasks: Vec<Box<dyn Task>> = vec![Box::new(BindsThenWaits(registry.reporter("http", true).await))];
        let handle = tokio::spawn(run(tasks, shutdown.clone(), registry.clone()));

        assert!(registry.wait_ready().await);
        shutdown.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn no_tasks_waits_for_shutdown() {
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(Vec::new(), shutdown.clone(), ReadinessRegistry::new()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        shutdown.cancel();
        assert!(handle.await.unwrap().is_ok());
    }
}
