//! One reconciliation pass: pointer, reorg walk, listing, matching, advance.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::stream::{self, StreamExt};
use tracing::{debug, error, info, warn, Instrument};

use tally_chain::ChainSource;
use tally_store::LedgerStore;
use tally_types::{BlockHash, ObservedTransaction};

use crate::config::ReconcilerConfig;
use crate::invoice::InvoiceService;
use crate::matcher::{MatchAction, PaymentMatcher};
use crate::metrics::ReconcilerMetrics;
use crate::payment::{PaymentReconciler, ReconcileOutcome};
use crate::pointer::BlockPointerStore;
use crate::spans::{pass_span, transaction_span};
use crate::walker::ReorgWalker;
use crate::{ErrorKind, ReconcileError};

/// Summary of a finished pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    pub pass: u64,
    /// Pointer value the pass started from.
    pub pointer_before: BlockHash,
    /// Valid block the listing was taken from.
    pub resumed_from: BlockHash,
    /// Tip reported by the chain source.
    pub new_tip: BlockHash,
    pub pointer_advanced: bool,
    pub invalid_blocks: usize,
    pub payments_cleared: usize,
    pub transactions_seen: usize,
    pub transactions_skipped: usize,
    pub payments_reconciled: usize,
    pub payments_created: usize,
    pub payments_reorged: usize,
    /// Payment updates that failed; the transient ones hold the pointer back.
    pub failures: usize,
    pub transient_failures: usize,
    pub duration: Duration,
}

impl fmt::Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "pass {} finished in {:?}", self.pass, self.duration)?;
        writeln!(f, "  pointer:      {} -> {}", self.pointer_before, self.new_tip)?;
        writeln!(f, "  resumed from: {}", self.resumed_from)?;
        writeln!(f, "  advanced:     {}", self.pointer_advanced)?;
        writeln!(
            f,
            "  reorg:        {} invalid blocks, {} payments cleared",
            self.invalid_blocks, self.payments_cleared
        )?;
        writeln!(
            f,
            "  transactions: {} seen, {} skipped",
            self.transactions_seen, self.transactions_skipped
        )?;
        writeln!(
            f,
            "  payments:     {} reconciled, {} created, {} reorged",
            self.payments_reconciled, self.payments_created, self.payments_reorged
        )?;
        write!(
            f,
            "  failures:     {} ({} transient)",
            self.failures, self.transient_failures
        )
    }
}

/// What handling one transaction did.
#[derive(Debug, Default)]
struct TransactionOutcome {
    skipped: bool,
    reconciled: usize,
    created: usize,
    reorged: usize,
    failures: usize,
    transient_failures: usize,
}

impl TransactionOutcome {
    fn record(&mut self, result: Result<ReconcileOutcome, ReconcileError>) {
        match result {
            Ok(ReconcileOutcome::Updated(_)) | Ok(ReconcileOutcome::StatusRecomputed(_)) => {
                self.reconciled += 1
            }
            Ok(ReconcileOutcome::Reorged(_)) => self.reorged += 1,
            Ok(ReconcileOutcome::ClaimedByOther(invoice)) => {
                debug!(%invoice, "payment changed hands during matching");
            }
            Err(e) => self.record_error(&e),
        }
    }

    fn record_error(&mut self, e: &ReconcileError) {
        self.failures += 1;
        match e.kind() {
            ErrorKind::TransientIo => {
                self.transient_failures += 1;
                error!(error = %e, "transient failure, will retry next pass");
            }
            ErrorKind::MalformedInput => warn!(error = %e, "malformed input skipped"),
            ErrorKind::InconsistentState => warn!(error = %e, "inconsistent state, payment skipped"),
        }
    }
}

/// Drives reconciliation passes.
///
/// A pass is not protected against a concurrent pass on the same store;
/// callers serialize passes through [`crate::ReconcileScheduler`].
pub struct Reconciler {
    chain: Arc<dyn ChainSource>,
    pointers: BlockPointerStore,
    matcher: PaymentMatcher,
    payments: Arc<PaymentReconciler>,
    walker: ReorgWalker,
    metrics: Arc<ReconcilerMetrics>,
    max_concurrent_transactions: usize,
    passes: AtomicU64,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        chain: Arc<dyn ChainSource>,
        invoices: Arc<dyn InvoiceService>,
        metrics: Arc<ReconcilerMetrics>,
        config: &ReconcilerConfig,
    ) -> Self {
        let payments = Arc::new(PaymentReconciler::new(
            Arc::clone(&store),
            Arc::clone(&chain),
            invoices,
        ));
        let walker = ReorgWalker::new(
            Arc::clone(&chain),
            Arc::clone(&payments),
            Arc::clone(&metrics),
            config.max_reorg_depth,
        );
        Self {
            pointers: BlockPointerStore::new(Arc::clone(&store), Arc::clone(&chain)),
            matcher: PaymentMatcher::new(store),
            chain,
            payments,
            walker,
            metrics,
            max_concurrent_transactions: config.max_concurrent_transactions.max(1),
            passes: AtomicU64::new(0),
        }
    }

    pub fn pointers(&self) -> &BlockPointerStore {
        &self.pointers
    }

    pub fn metrics(&self) -> &Arc<ReconcilerMetrics> {
        &self.metrics
    }

    /// Run one pass to completion.
    ///
    /// A pass-level failure leaves the pointer untouched and is returned;
    /// failures of single transactions are logged and counted in the report.
    pub async fn run_pass(&self) -> Result<PassReport, ReconcileError> {
        let pass = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.passes.inc();
        let started = Instant::now();

        let result = self.pass(pass).instrument(pass_span(pass)).await;

        let duration = started.elapsed();
        self.metrics
            .pass_duration_ms
            .observe(duration.as_secs_f64() * 1000.0);
        match result {
            Ok(mut report) => {
                report.duration = duration;
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or_default();
                self.metrics.last_pass_unix.set(now);
                info!(
                    pass,
                    tip = %report.new_tip,
                    advanced = report.pointer_advanced,
                    transactions = report.transactions_seen,
                    failures = report.failures,
                    elapsed_ms = duration.as_millis() as u64,
                    "pass finished"
                );
                Ok(report)
            }
            Err(e) => {
                self.metrics.pass_failures.inc();
                error!(pass, error = %e, "pass aborted");
                Err(e)
            }
        }
    }

    async fn pass(&self, pass: u64) -> Result<PassReport, ReconcileError> {
        let mut pointer = self.pointers.ensure().await?;
        info!(pointer = %pointer.hash, "pass started");
        let mut report = PassReport {
            pass,
            pointer_before: pointer.hash,
            ..Default::default()
        };

        let walk = self.walker.walk(pointer.hash).await?;
        report.resumed_from = walk.valid;
        report.invalid_blocks = walk.invalid.len();
        report.payments_cleared = walk.payments_cleared;

        let since = self.chain.list_since(&walk.valid).await?;
        report.new_tip = since.new_tip;
        report.transactions_seen = since.transactions.len();
        self.metrics
            .transactions_seen
            .inc_by(since.transactions.len() as u64);

        // Futures are built eagerly (but not polled) so the stream's item type
        // carries no higher-ranked closure lifetimes; this keeps the pass future
        // `Send` for `tokio::spawn`.
        let pending: Vec<_> = since
            .transactions
            .iter()
            .map(|tx| self.process_transaction(tx).instrument(transaction_span(tx)))
            .collect();
        let outcomes: Vec<TransactionOutcome> = stream::iter(pending)
            .buffer_unordered(self.max_concurrent_transactions)
            .collect()
            .await;

        for outcome in &outcomes {
            report.transactions_skipped += usize::from(outcome.skipped);
            report.payments_reconciled += outcome.reconciled;
            report.payments_created += outcome.created;
            report.payments_reorged += outcome.reorged;
            report.failures += outcome.failures;
            report.transient_failures += outcome.transient_failures;
        }
        self.metrics
            .payments_reconciled
            .inc_by(report.payments_reconciled as u64);
        self.metrics
            .payments_created
            .inc_by(report.payments_created as u64);
        self.metrics
            .payments_reorged
            .inc_by(report.payments_reorged as u64);

        if report.transient_failures > 0 {
            warn!(
                failures = report.transient_failures,
                tip = %since.new_tip,
                "holding block pointer back until failed transactions are retried"
            );
        } else {
            report.pointer_advanced = self.pointers.advance(&mut pointer, since.new_tip)?;
        }
        Ok(report)
    }

    async fn process_transaction(&self, tx: &ObservedTransaction) -> TransactionOutcome {
        let mut outcome = TransactionOutcome::default();

        let action = match self.matcher.match_transaction(tx) {
            Ok(action) => action,
            Err(e) => {
                outcome.record_error(&e);
                return outcome;
            }
        };

        match action {
            MatchAction::Skip(reason) => {
                debug!(?reason, "transaction skipped");
                outcome.skipped = true;
            }
            MatchAction::ById(payment) => {
                outcome.record(self.payments.reconcile(&payment, tx, false).await);
            }
            MatchAction::ByAddress {
                unclaimed,
                mut create_for,
            } => {
                let transient_before = outcome.transient_failures;
                for payment in &unclaimed {
                    match self.payments.reconcile(payment, tx, true).await {
                        Ok(ReconcileOutcome::ClaimedByOther(invoice)) => {
                            create_for = Some(invoice);
                        }
                        result => outcome.record(result),
                    }
                }
                // Creating would claim the tx id, and the retry would then match by
                // id and never reach the unclaimed payments again.
                if outcome.transient_failures > transient_before {
                    if let Some(invoice) = &create_for {
                        debug!(%invoice, "creation deferred until unclaimed payments reconcile");
                    }
                } else if let Some(invoice) = create_for {
                    match self.payments.create(&invoice, tx).await {
                        Ok(Some(_)) => outcome.created += 1,
                        Ok(None) => {}
                        Err(e) => outcome.record_error(&e),
                    }
                }
            }
        }
        outcome
    }
}
