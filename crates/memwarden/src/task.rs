//! Owned periodic background tasks
//!
//! Each task runs on the ambient tokio runtime, ticks on an interval and
//! executes its (blocking) work on the blocking pool. Stopping sends on a
//! oneshot channel; dropping the handle stops the task too.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{Result, WardenError};

pub struct PeriodicTask {
    name: &'static str,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Start running `work` every `period`, first after one full period.
    ///
    /// Fails with [`WardenError::Runtime`] outside a tokio runtime and with
    /// [`WardenError::Config`] for a zero period.
    pub fn spawn<F>(name: &'static str, period: Duration, work: F) -> Result<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if period.is_zero() {
            return Err(WardenError::Config(format!(
                "{name}: interval must be greater than zero"
            )));
        }
        let runtime = Handle::try_current()
            .map_err(|e| WardenError::Runtime(format!("{name}: {e}")))?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let work = Arc::new(work);

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            tracing::debug!(task = name, ?period, "periodic task started");
            loop {
                tokio::select! {
                    biased;

                    _ = &mut shutdown_rx => break,

                    _ = ticker.tick() => {
                        let work = Arc::clone(&work);
                        if let Err(e) = tokio::task::spawn_blocking(move || work()).await {
                            tracing::error!(task = name, error = %e, "periodic work failed");
                        }
                    }
                }
            }
            tracing::debug!(task = name, "periodic task stopped");
        });

        Ok(Self {
            name,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the task to stop without waiting for it
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.handle.take();
    }

    /// Signal the task to stop and wait until its loop has exited
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!(task = self.name, error = %e, "periodic task ended abnormally");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_requires_runtime() {
        let result = PeriodicTask::spawn("no-runtime", Duration::from_millis(10), || {});
        assert!(matches!(result, Err(WardenError::Runtime(_))));
    }

    #[tokio::test]
    async fn test_zero_period_rejected() {
        let result = PeriodicTask::spawn("zero", Duration::ZERO, || {});
        assert!(matches!(result, Err(WardenError::Config(_))));
    }

    #[tokio::test]
    async fn test_runs_until_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let task = PeriodicTask::spawn("counter", Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert!(task.is_running());
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.shutdown().await;

        let after_stop = ticks.load(Ordering::SeqCst);
        assert!(after_stop >= 2, "expected several ticks, got {after_stop}");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_panicking_work_keeps_ticking() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let mut task = PeriodicTask::spawn("flaky", Duration::from_millis(10), move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first tick fails");
            }
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(task.is_running());
        assert!(ticks.load(Ordering::SeqCst) >= 2);
        task.stop();
        assert!(!task.is_running());
    }
}
