// Cancellable Work Loop
//
// INTENTION: Run a caller-supplied step over and over on its own task until a
// cancellation token fires. The token is checked before every iteration and
// the throttle wait between iterations races against it, so a cancelled loop
// never starts another step and exits without waiting out its throttle. A step
// that is already running is allowed to finish.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{GraphError, GraphResult};
use crate::util::logging::Logger;

/// How a loop task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// Cancellation was observed between iterations
    Cancelled,
    /// A step returned an error; the loop does not restart
    Failed(String),
    /// The loop did not stop within the grace period and was aborted
    ForceTerminated,
    /// The step panicked
    Panicked,
}

/// Sleep for `duration` unless `token` is cancelled first.
///
/// Cancellation surfaces as `GraphError::Interrupted`, which callers treat as
/// a normal stop signal.
pub async fn interruptible_sleep(token: &CancellationToken, duration: Duration) -> GraphResult<()> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(GraphError::Interrupted),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Builder for a work loop
pub struct CancellableLoop {
    name: String,
    throttle: Duration,
    token: CancellationToken,
    logger: Logger,
}

impl CancellableLoop {
    /// `throttle` is the wait inserted after every step; zero disables it
    pub fn new(name: impl Into<String>, throttle: Duration, token: CancellationToken, logger: Logger) -> Self {
        Self {
            name: name.into(),
            throttle,
            token,
            logger,
        }
    }

    /// Start the loop on a new tokio task
    pub fn spawn<F, Fut>(self, mut step: F) -> LoopHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let iterations = Arc::new(AtomicU64::new(0));
        let counter = iterations.clone();
        let token = self.token.clone();
        let logger = self.logger.clone();
        let name = self.name.clone();
        let throttle = self.throttle;

        let join = tokio::spawn(async move {
            logger.debug(format!("Loop '{}' started", name));
            let exit = loop {
                if token.is_cancelled() {
                    break LoopExit::Cancelled;
                }
                counter.fetch_add(1, Ordering::SeqCst);

                if let Err(e) = step().await {
                    logger.error(format!("Loop '{}' step failed: {:#}", name, e));
                    break LoopExit::Failed(e.to_string());
                }

                if throttle.is_zero() {
                    tokio::task::yield_now().await;
                } else if let Err(GraphError::Interrupted) = interruptible_sleep(&token, throttle).await {
                    break LoopExit::Cancelled;
                }
            };
            logger.debug(format!("Loop '{}' exited: {:?}", name, exit));
            exit
        });

        LoopHandle {
            name: self.name,
            token: self.token,
            join: Some(join),
            iterations,
            logger: self.logger,
        }
    }
}

/// Handle to a running loop
pub struct LoopHandle {
    name: String,
    token: CancellationToken,
    join: Option<JoinHandle<LoopExit>>,
    iterations: Arc<AtomicU64>,
    logger: Logger,
}

impl LoopHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of steps started so far
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::SeqCst)
    }

    /// Signal cancellation without waiting
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancel and wait up to `grace` for the loop to stop; a loop still
    /// running after that is aborted and logged as leaked.
    pub async fn join(mut self, grace: Duration) -> LoopExit {
        self.token.cancel();
        let Some(mut join) = self.join.take() else {
            return LoopExit::Cancelled;
        };

        match tokio::time::timeout(grace, &mut join).await {
            Ok(Ok(exit)) => exit,
            Ok(Err(e)) if e.is_panic() => {
                self.logger.error(format!("Loop '{}' panicked", self.name));
                LoopExit::Panicked
            }
            Ok(Err(_)) => LoopExit::ForceTerminated,
            Err(_) => {
                join.abort();
                self.logger.error(format!(
                    "Loop '{}' did not stop within {:?}; force-terminated",
                    self.name, grace
                ));
                LoopExit::ForceTerminated
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::logging::Component;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    fn logger() -> Logger {
        Logger::new_root(Component::Loop, "test")
    }

    async fn noop_step() -> anyhow::Result<()> {
        Ok(())
    }

    #[tokio::test]
    async fn test_loop_runs_until_cancelled() {
        let token = CancellationToken::new();
        let handle = CancellableLoop::new("counter", Duration::from_millis(5), token.clone(), logger())
            .spawn(noop_step);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(handle.iterations() >= 2);

        token.cancel();
        let exit = handle.join(Duration::from_secs(1)).await;
        assert_eq!(exit, LoopExit::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_throttle_wait() {
        let token = CancellationToken::new();
        let handle = CancellableLoop::new("slow", Duration::from_secs(30), token, logger())
            .spawn(noop_step);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let started = Instant::now();
        let exit = handle.join(Duration::from_secs(5)).await;
        assert_eq!(exit, LoopExit::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_no_iteration_starts_after_cancellation() {
        let token = CancellationToken::new();
        let cancelled = Arc::new(AtomicBool::new(false));
        let started_after_cancel = Arc::new(AtomicBool::new(false));

        let flag = cancelled.clone();
        let violation = started_after_cancel.clone();
        let handle = CancellableLoop::new("observer", Duration::from_millis(1), token.clone(), logger())
            .spawn(move || {
                if flag.load(Ordering::SeqCst) {
                    violation.store(true, Ordering::SeqCst);
                }
                noop_step()
            });

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        cancelled.store(true, Ordering::SeqCst);
        handle.join(Duration::from_secs(1)).await;
        assert!(!started_after_cancel.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_in_flight_step_completes() {
        let token = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));
        let done = finished.clone();
        let handle = CancellableLoop::new("once", Duration::from_millis(1), token, logger())
            .spawn(move || {
                let done = done.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    done.store(true, Ordering::SeqCst);
                    Ok(())
                }
            });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let exit = handle.join(Duration::from_secs(1)).await;
        assert_eq!(exit, LoopExit::Cancelled);
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stuck_step_is_force_terminated() {
        let token = CancellationToken::new();
        let handle = CancellableLoop::new("stuck", Duration::ZERO, token, logger()).spawn(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let exit = handle.join(Duration::from_millis(50)).await;
        assert_eq!(exit, LoopExit::ForceTerminated);
    }

    #[tokio::test]
    async fn test_failing_step_ends_loop() {
        let token = CancellationToken::new();
        let handle = CancellableLoop::new("failing", Duration::from_millis(1), token, logger())
            .spawn(|| async { Err::<(), _>(anyhow::anyhow!("no more work")) });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.is_finished());
        assert_eq!(handle.iterations(), 1);
        let exit = handle.join(Duration::from_secs(1)).await;
        assert_eq!(exit, LoopExit::Failed("no more work".to_string()));
    }
}
