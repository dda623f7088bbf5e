//! Timer-driven, non-overlapping pass scheduling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Notify};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::pass::{PassReport, Reconciler};
use crate::ReconcileError;

/// Result of asking the scheduler for a pass.
#[derive(Debug)]
pub enum Trigger {
    Ran(Result<PassReport, ReconcileError>),
    /// Another pass was still running.
    Skipped,
}

/// Owns the "pass in progress" flag. At most one pass runs at a time, no
/// matter how many tasks call [`ReconcileScheduler::trigger`].
pub struct ReconcileScheduler {
    reconciler: Arc<Reconciler>,
    interval: Duration,
    in_progress: AtomicBool,
    pass_done: Notify,
    last_report: watch::Sender<Option<PassReport>>,
}

/// Clears the in-progress flag when the pass ends, however it ends, and
/// wakes anyone waiting in [`ReconcileScheduler::idle`].
pub(crate) struct PassGuard<'a>(&'a ReconcileScheduler);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.in_progress.store(false, Ordering::Release);
        self.0.pass_done.notify_waiters();
    }
}

impl ReconcileScheduler {
    pub fn new(reconciler: Arc<Reconciler>, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
            in_progress: AtomicBool::new(false),
            pass_done: Notify::new(),
            last_report: watch::channel(None).0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Report of the most recent pass that completed successfully.
    pub fn last_report(&self) -> Option<PassReport> {
        self.last_report.borrow().clone()
    }

    /// Resolves once no pass is running.
    pub async fn idle(&self) {
        loop {
            let notified = self.pass_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_running() {
                return;
            }
            notified.await;
        }
    }

    /// Claim the in-progress flag, or `None` if a pass already holds it.
    pub(crate) fn begin_pass(&self) -> Option<PassGuard<'_>> {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PassGuard(self))
    }

    /// Run a pass unless one is already in progress.
    pub async fn trigger(&self) -> Trigger {
        let Some(_guard) = self.begin_pass() else {
            self.reconciler.metrics().passes_skipped.inc();
            warn!("previous pass still running, skipping trigger");
            return Trigger::Skipped;
        };
        let result = self.reconciler.run_pass().await;
        if let Ok(report) = &result {
            self.last_report.send_replace(Some(report.clone()));
        }
        Trigger::Ran(result)
    }

    /// Run passes every `interval` until `shutdown` fires.
    ///
    /// Each pass is awaited before the next tick is taken, and late ticks are
    /// delayed rather than bunched, so passes never overlap. A pass in
    /// progress when shutdown arrives is finished first.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "reconciliation scheduler started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("reconciliation scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    // Errors are logged by the pass itself; the next tick retries.
                    if let Trigger::Ran(Err(e)) = self.trigger().await {
                        debug!(error = %e, "waiting for next tick after failed pass");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconcilerConfig;
    use crate::invoice::LedgerInvoiceService;
    use crate::metrics::ReconcilerMetrics;
    use crate::shutdown::ShutdownController;
    use tally_nullables::{NullChain, NullStore};
    use tally_types::BlockHash;

    fn scheduler(interval: Duration) -> (Arc<NullChain>, Arc<Reconciler>, ReconcileScheduler) {
        let store = Arc::new(NullStore::new());
        let chain = Arc::new(NullChain::new());
        let tip = BlockHash::new([1; 32]);
        chain.add_valid_block(tip, None, 1);
        chain.set_tip(tip);
        let invoices = Arc::new(LedgerInvoiceService::new(store.clone()));
        let reconciler = Arc::new(Reconciler::new(
            store,
            chain.clone(),
            invoices,
            Arc::new(ReconcilerMetrics::new()),
            &ReconcilerConfig::default(),
        ));
        let scheduler = ReconcileScheduler::new(reconciler.clone(), interval);
        (chain, reconciler, scheduler)
    }

    #[tokio::test]
    async fn trigger_runs_a_pass() {
        let (_chain, reconciler, scheduler) = scheduler(Duration::from_secs(30));
        assert!(matches!(scheduler.trigger().await, Trigger::Ran(Ok(_))));
        assert!(!scheduler.is_running());
        assert_eq!(reconciler.metrics().passes.get(), 1);
    }

    #[tokio::test]
    async fn trigger_while_running_is_skipped() {
        let (_chain, reconciler, scheduler) = scheduler(Duration::from_secs(30));
        let _held = scheduler.begin_pass().unwrap();

        assert!(matches!(scheduler.trigger().await, Trigger::Skipped));
        assert_eq!(reconciler.metrics().passes.get(), 0);
        assert_eq!(reconciler.metrics().passes_skipped.get(), 1);
    }

    #[tokio::test]
    async fn successful_pass_is_kept_as_last_report() {
        let (chain, _reconciler, scheduler) = scheduler(Duration::from_secs(30));
        assert!(scheduler.last_report().is_none());
        scheduler.trigger().await;
        assert_eq!(scheduler.last_report().unwrap().pass, 1);

        chain.fail_list_since(true);
        assert!(matches!(scheduler.trigger().await, Trigger::Ran(Err(_))));
        assert_eq!(scheduler.last_report().unwrap().pass, 1);
    }

    #[tokio::test]
    async fn idle_waits_for_the_pass_to_end() {
        let (_chain, _reconciler, scheduler) = scheduler(Duration::from_secs(30));
        scheduler.idle().await;

        let guard = scheduler.begin_pass().unwrap();
        let release = async move {
            time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        };
        let (waited, ()) = tokio::join!(
            time::timeout(Duration::from_secs(5), scheduler.idle()),
            release
        );
        assert!(waited.is_ok());
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn failed_pass_releases_the_flag() {
        let (chain, reconciler, scheduler) = scheduler(Duration::from_secs(30));
        chain.fail_tip(true);
        assert!(matches!(scheduler.trigger().await, Trigger::Ran(Err(_))));
        assert!(!scheduler.is_running());
        assert_eq!(reconciler.metrics().pass_failures.get(), 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (_chain, reconciler, scheduler) = scheduler(Duration::from_millis(10));
        let scheduler = Arc::new(scheduler);
        let shutdown = ShutdownController::new();

        let task = {
            let scheduler = Arc::clone(&scheduler);
            let rx = shutdown.subscribe();
            tokio::spawn(async move { scheduler.run(rx).await })
        };
        time::sleep(Duration::from_millis(60)).await;
        shutdown.shutdown();

        time::timeout(Duration::from_secs(5), task)
            .await
            .expect("scheduler should stop")
            .unwrap();
        assert!(reconciler.metrics().passes.get() >= 1);
        assert_eq!(reconciler.metrics().passes_skipped.get(), 0);
    }
}
