//! Daemon shutdown: waiting for a signal, then draining the pass in flight.
//!
//! A pass cut off halfway is safe to repeat, but letting it finish moves the
//! pointer and avoids re-listing the whole batch on the next start.

use std::fmt;
use std::time::Duration;

use tokio::signal;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{info, warn};

use crate::pass::PassReport;
use crate::scheduler::ReconcileScheduler;

/// The signal that asked the daemon to stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
        })
    }
}

/// What happened to the pass running when shutdown began.
#[derive(Debug)]
pub enum Drained {
    /// No pass was running.
    Idle,
    /// The pass ran to its end; `None` when it failed.
    Finished(Option<PassReport>),
    /// The pass was still running when the grace period ran out.
    TimedOut,
}

/// Tells the scheduler and the metrics server to stop.
///
/// Tasks take a receiver from [`ShutdownController::subscribe`] and select
/// on it beside their main loop.
pub struct ShutdownController {
    tx: broadcast::Sender<()>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Broadcast shutdown to every subscriber.
    pub fn shutdown(&self) {
        let _ = self.tx.send(());
    }

    /// Wait for SIGINT or SIGTERM. Nothing is broadcast yet; call
    /// [`ShutdownController::drain`] next.
    pub async fn wait_for_signal(&self) -> ShutdownSignal {
        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = signal::ctrl_c() => ShutdownSignal::Interrupt,
            _ = terminate => ShutdownSignal::Terminate,
        }
    }

    /// Broadcast shutdown and give the scheduler up to `grace` to finish the
    /// pass it is running.
    pub async fn drain(&self, scheduler: &ReconcileScheduler, grace: Duration) -> Drained {
        let reported_before = scheduler.last_report().map(|r| r.pass);
        self.shutdown();

        if !scheduler.is_running() {
            info!("no pass in flight at shutdown");
            return Drained::Idle;
        }

        info!(grace_secs = grace.as_secs(), "waiting for the pass in flight to finish");
        if time::timeout(grace, scheduler.idle()).await.is_err() {
            warn!(
                grace_secs = grace.as_secs(),
                "pass still running at shutdown deadline; the next start repeats it"
            );
            return Drained::TimedOut;
        }

        let report = scheduler
            .last_report()
            .filter(|r| Some(r.pass) != reported_before);
        match &report {
            Some(r) => info!(
                pass = r.pass,
                tip = %r.new_tip,
                advanced = r.pointer_advanced,
                failures = r.failures,
                "pass in flight finished before exit"
            ),
            None => warn!("pass in flight failed before exit; pointer left unchanged"),
        }
        Drained::Finished(report)
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tally_nullables::{NullChain, NullStore};
    use tally_types::BlockHash;

    use crate::config::ReconcilerConfig;
    use crate::invoice::LedgerInvoiceService;
    use crate::metrics::ReconcilerMetrics;
    use crate::pass::Reconciler;

    fn scheduler() -> ReconcileScheduler {
        let store = Arc::new(NullStore::new());
        let chain = Arc::new(NullChain::new());
        let tip = BlockHash::new([1; 32]);
        chain.add_valid_block(tip, None, 1);
        chain.set_tip(tip);
        let reconciler = Reconciler::new(
            store.clone(),
            chain,
            Arc::new(LedgerInvoiceService::new(store)),
            Arc::new(ReconcilerMetrics::new()),
            &ReconcilerConfig::default(),
        );
        ReconcileScheduler::new(Arc::new(reconciler), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn shutdown_notifies_subscribers() {
        let controller = ShutdownController::new();
        let mut rx1 = controller.subscribe();
        let mut rx2 = controller.subscribe();
        controller.shutdown();
        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }

    #[tokio::test]
    async fn drain_without_a_pass_is_idle() {
        let controller = ShutdownController::new();
        let mut rx = controller.subscribe();
        let drained = controller.drain(&scheduler(), Duration::from_secs(1)).await;
        assert!(matches!(drained, Drained::Idle));
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn drain_waits_for_the_pass_in_flight() {
        let controller = ShutdownController::new();
        let scheduler = scheduler();
        let guard = scheduler.begin_pass().unwrap();
        let release = async move {
            time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        };

        let (drained, ()) = tokio::join!(
            controller.drain(&scheduler, Duration::from_secs(5)),
            release
        );
        // The held flag stands in for a pass, so no new report was recorded.
        assert!(matches!(drained, Drained::Finished(None)));
    }

    #[tokio::test]
    async fn drain_gives_up_after_the_grace_period() {
        let controller = ShutdownController::new();
        let scheduler = scheduler();
        let _held = scheduler.begin_pass().unwrap();
        let drained = controller.drain(&scheduler, Duration::from_millis(20)).await;
        assert!(matches!(drained, Drained::TimedOut));
    }

    #[test]
    fn signals_display_their_names() {
        assert_eq!(ShutdownSignal::Interrupt.to_string(), "SIGINT");
        assert_eq!(ShutdownSignal::Terminate.to_string(), "SIGTERM");
    }
}
