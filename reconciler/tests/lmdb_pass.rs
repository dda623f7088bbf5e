//! A reconciliation pass persisted through the LMDB document store, then
//! read back after reopening the environment.

use std::sync::Arc;

use tally_nullables::NullChain;
use tally_reconciler::{
    InvoiceService, LedgerInvoiceService, Reconciler, ReconcilerConfig, ReconcilerMetrics,
};
use tally_store::{PaymentStore, PointerStore};
use tally_store_lmdb::LmdbEnvironment;
use tally_types::{
    BlockHash, BlockPointer, Invoice, InvoiceId, NormalizedTxId, ObservedTransaction,
    PaymentAddress, PaymentStatus,
};

fn open(dir: &tempfile::TempDir) -> Arc<LmdbEnvironment> {
    Arc::new(LmdbEnvironment::open(dir.path(), 16, 64 * 1024 * 1024).expect("open env"))
}

#[tokio::test]
async fn pass_survives_reopen() {
    let dir = tempfile::tempdir().expect("temp dir");
    let address = PaymentAddress::new("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq").unwrap();
    let genesis = BlockHash::new([1; 32]);
    let tip = BlockHash::new([2; 32]);

    let payment_id = {
        let env = open(&dir);
        let chain = Arc::new(NullChain::new());
        chain.add_valid_block(genesis, None, 7);
        chain.add_valid_block(tip, Some(genesis), 6);
        chain.set_tip(tip);
        env.put_block_pointer(&BlockPointer::new(genesis)).unwrap();

        let invoices = Arc::new(LedgerInvoiceService::new(env.clone()));
        let payment = invoices
            .issue_invoice(
                &Invoice {
                    id: InvoiceId::new("order-42").unwrap(),
                    min_confirmations: 6,
                    expected_amount: 150_000,
                },
                &address,
            )
            .await
            .unwrap();
        chain.push_transaction(ObservedTransaction {
            normalized_tx_id: Some(NormalizedTxId::new([9; 32])),
            tx_id: Some("raw-9".into()),
            address: Some(address.clone()),
            amount: 150_000,
            block_hash: Some(tip),
            confirmations: 6,
        });

        let reconciler = Reconciler::new(
            env.clone(),
            chain,
            invoices,
            Arc::new(ReconcilerMetrics::new()),
            &ReconcilerConfig::default(),
        );
        let report = reconciler.run_pass().await.unwrap();
        assert!(report.pointer_advanced);
        payment.id
    };

    let env = open(&dir);
    assert_eq!(env.get_block_pointer().unwrap().unwrap().hash, tip);
    let payment = env.get_payment(&payment_id).unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Paid);
    assert_eq!(payment.block_hash, Some(tip));
    assert_eq!(
        env.find_payment_by_tx_id(&NormalizedTxId::new([9; 32]))
            .unwrap()
            .map(|p| p.id),
        Some(payment_id)
    );
    assert_eq!(env.find_payments_by_block_hash(&tip).unwrap().len(), 1);
    assert!(env.check_integrity().unwrap().is_healthy());
}
