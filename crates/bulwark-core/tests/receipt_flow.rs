//! Cage result to signed receipt to batch anchoring.

use std::sync::Arc;

use bulwark_core::cage::{
    CageConfig, DeterminismCage, ExecutionResult, ResourceLimits, ResourceUsage,
};
use bulwark_core::crypto::{FileKeyStore, KeyStore, Signer};
use bulwark_core::receipt::{
    ExecutionId, FixedClock, PolicyDecision, PolicyEngine, PolicyInput, Receipt, ReceiptBatch,
    ReceiptGenerator, StaticPolicy, verify_receipt, verify_receipt_bytes,
};

// =============================================================================
// Helpers
// =============================================================================

/// 2024-01-01 00:00:00 UTC in milliseconds.
const TEST_TIMESTAMP_MS: u64 = 1_704_067_200_000;

async fn caged_result(seed: u8) -> ExecutionResult {
    let mut cage = DeterminismCage::new(CageConfig::builder([seed; 32]).build());
    cage.activate().expect("activate");
    cage.execute_function(|ctx| {
        let n = ctx.random_u64()?;
        ctx.write_stdout(&n.to_le_bytes())?;
        Ok(0)
    })
    .await
    .expect("execute")
}

fn generator(secret: u8) -> ReceiptGenerator<FixedClock> {
    ReceiptGenerator::new(
        Arc::new(Signer::from_secret_bytes(&[secret; 32])),
        FixedClock::new(TEST_TIMESTAMP_MS),
    )
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn receipt_for_caged_run_verifies() {
    let result = caged_result(1).await;
    let generator = generator(7);
    let id = ExecutionId::from_bytes([3; 16]);
    let decision = StaticPolicy(PolicyDecision::new(b"allow".to_vec())).evaluate(&PolicyInput {
        execution_id: &id,
        result: &result,
        usage: ResourceUsage::default(),
        limits: &ResourceLimits::default(),
    });

    let receipt = generator
        .generate_receipt(id, &result, decision)
        .expect("receipt");
    let key = generator.signer().verifying_key();

    assert!(verify_receipt(&receipt, &key));
    assert!(receipt.covers(&result).expect("hash"));
    assert_eq!(receipt.timestamp, TEST_TIMESTAMP_MS);

    let bytes = receipt.to_bytes().expect("encode");
    assert!(verify_receipt_bytes(&bytes, &key));
    assert_eq!(Receipt::from_bytes(&bytes).expect("decode"), receipt);
}

#[tokio::test]
async fn any_flipped_bit_fails_verification() {
    let result = caged_result(2).await;
    let generator = generator(7);
    let receipt = generator
        .generate_receipt(ExecutionId::from_bytes([4; 16]), &result, PolicyDecision::default())
        .expect("receipt");
    let key = generator.signer().verifying_key();
    let bytes = receipt.to_bytes().expect("encode");

    for i in 0..bytes.len() {
        let mut tampered = bytes.clone();
        tampered[i] ^= 0x01;
        assert!(!verify_receipt_bytes(&tampered, &key), "flip at byte {i} verified");
    }
}

#[tokio::test]
async fn receipt_does_not_cover_other_run() {
    let ours = caged_result(1).await;
    let theirs = caged_result(9).await;
    let receipt = generator(7)
        .generate_receipt(ExecutionId::from_bytes([5; 16]), &ours, PolicyDecision::default())
        .expect("receipt");
    assert!(!receipt.covers(&theirs).expect("hash"));
}

#[tokio::test]
async fn wrong_key_fails() {
    let result = caged_result(1).await;
    let receipt = generator(7)
        .generate_receipt(ExecutionId::from_bytes([6; 16]), &result, PolicyDecision::default())
        .expect("receipt");
    let other = Signer::from_secret_bytes(&[8; 32]).verifying_key();
    assert!(!verify_receipt(&receipt, &other));
}

#[tokio::test]
async fn persisted_key_signs_verifiable_receipts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileKeyStore::open(dir.path()).expect("store");
    let signer = store.load_or_generate("node").expect("key");
    let key = signer.verifying_key();

    let reloaded = FileKeyStore::open(dir.path())
        .expect("store")
        .load_or_generate("node")
        .expect("key");
    assert_eq!(reloaded.verifying_key(), key);

    let generator = ReceiptGenerator::new(Arc::new(reloaded), FixedClock::new(TEST_TIMESTAMP_MS));
    let receipt = generator
        .generate_receipt(
            ExecutionId::from_bytes([1; 16]),
            &caged_result(3).await,
            PolicyDecision::default(),
        )
        .expect("receipt");
    assert!(verify_receipt(&receipt, &key));
}

#[tokio::test]
async fn batch_anchors_every_receipt() {
    let generator = generator(7);
    let mut receipts = Vec::new();
    for i in 0..7u8 {
        let result = caged_result(i).await;
        receipts.push(
            generator
                .generate_receipt(ExecutionId::from_bytes([i; 16]), &result, PolicyDecision::default())
                .expect("receipt"),
        );
    }
    let batch = ReceiptBatch::new(receipts).expect("batch");
    let root = batch.root();
    for (i, receipt) in batch.receipts().iter().enumerate() {
        let proof = batch.proof(i).expect("proof");
        assert!(ReceiptBatch::verify_member(receipt, &proof, &root, 7));
    }
}
