//! Generic driver for a supervisor. Fires `do_work` after every period, or
//! earlier when notified; never concurrently with itself.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The unit of work a scheduler drives.
#[async_trait]
pub trait Doer: Send + Sync + 'static {
    async fn do_work(&self) -> Result<()>;
    /// Called exactly once, after the final `do_work` has returned.
    async fn shutdown(&self);
}

pub struct Scheduler {
    doer: Arc<dyn Doer>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Scheduler {
    /// Spawn the driver loop. A zero period disables the timer; the loop
    /// then only fires on `notify`.
    pub fn start(doer: Arc<dyn Doer>, period: Duration) -> Self {
        let notify = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            doer.clone(),
            period,
            notify.clone(),
            cancel.clone(),
        ));
        Self {
            doer,
            notify,
            cancel,
            handle,
        }
    }

    /// Request a run as soon as the current one (if any) finishes. Multiple
    /// notifications while `do_work` runs coalesce into one pending run.
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    /// Stop the loop: no new invocation starts, the in-flight `do_work`
    /// runs to completion, then the doer is shut down. Blocks until done.
    pub async fn close(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
        self.doer.shutdown().await;
    }
}

async fn run_loop(
    doer: Arc<dyn Doer>,
    period: Duration,
    notify: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        // Biased toward cancellation so a pending notification cannot win a
        // race against close and start one more run.
        if period.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = notify.notified() => {}
            }
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = notify.notified() => {}
                _ = tokio::time::sleep(period) => {}
            }
        }
        if let Err(err) = doer.do_work().await {
            tracing::error!(error = %err, "scheduled work failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDoer {
        runs: AtomicUsize,
        shutdowns: AtomicUsize,
        delay: Duration,
    }

    impl CountingDoer {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
                delay,
            })
        }
    }

    #[async_trait]
    impl Doer for CountingDoer {
        async fn do_work(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(())
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn zero_period_never_fires_on_its_own() {
        let doer = CountingDoer::new(Duration::ZERO);
        let scheduler = Scheduler::start(doer.clone(), Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(doer.runs.load(Ordering::SeqCst), 0);
        scheduler.close().await;
    }

    #[tokio::test]
    async fn period_drives_repeated_runs() {
        let doer = CountingDoer::new(Duration::ZERO);
        let scheduler = Scheduler::start(doer.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(doer.runs.load(Ordering::SeqCst) >= 2);
        scheduler.close().await;
    }

    #[tokio::test]
    async fn notifications_during_a_run_coalesce() {
        let doer = CountingDoer::new(Duration::from_millis(80));
        let scheduler = Scheduler::start(doer.clone(), Duration::ZERO);

        scheduler.notify();
        // Let the first run start, then pile on notifications mid-run.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(doer.runs.load(Ordering::SeqCst), 1);
        for _ in 0..10 {
            scheduler.notify();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(doer.runs.load(Ordering::SeqCst), 2);
        scheduler.close().await;
    }

    #[tokio::test]
    async fn close_waits_for_inflight_work_and_shuts_down_once() {
        let doer = CountingDoer::new(Duration::from_millis(50));
        let scheduler = Scheduler::start(doer.clone(), Duration::ZERO);
        scheduler.notify();
        tokio::time::sleep(Duration::from_millis(10)).await;

        scheduler.close().await;
        // The in-flight run completed before shutdown.
        assert_eq!(doer.runs.load(Ordering::SeqCst), 1);
        assert_eq!(doer.shutdowns.load(Ordering::SeqCst), 1);
    }
}
