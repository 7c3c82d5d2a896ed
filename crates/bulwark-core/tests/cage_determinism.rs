//! End-to-end determinism of the cage.

use bulwark_core::cage::{
    CageConfig, CageContext, CageError, CageEvent, CageState, DeterminismCage, Interrupt, Syscall,
};
use bulwark_core::witness::OpType;

const SEED: [u8; 32] = [0x5a; 32];

fn workload(ctx: &mut CageContext) -> Result<i32, Interrupt> {
    let mut buf = [0u8; 32];
    ctx.random_bytes(&mut buf)?;
    let t = ctx.now()?;
    let greeting = ctx.env_var("GREETING")?.unwrap_or_default();
    let input = ctx.read_file("/in/data")?.unwrap_or_default();
    ctx.write_file("/out/result", &buf)?;
    ctx.write_stdout(format!("{greeting} {t} {}", hex::encode(buf)).as_bytes())?;
    ctx.write_stderr(&input)?;
    Ok(0)
}

fn config(seed: [u8; 32]) -> CageConfig {
    CageConfig::builder(seed)
        .env("GREETING", "hi")
        .file("/in/data", b"input".to_vec())
        .build()
}

async fn run(seed: [u8; 32]) -> DeterminismCage {
    let mut cage = DeterminismCage::new(config(seed));
    cage.activate().expect("activate");
    cage.execute_function(workload).await.expect("execute");
    cage
}

#[tokio::test]
async fn repeated_runs_are_identical() {
    let first = run(SEED).await;
    let second = run(SEED).await;

    let a = first.execution_result().expect("result");
    let b = second.execution_result().expect("result");
    assert_eq!(a, b);
    assert_eq!(a.hash().expect("hash"), b.hash().expect("hash"));

    let log_a = first.witness_log().expect("log");
    let log_b = second.witness_log().expect("log");
    assert_eq!(log_a.digest(), log_b.digest());
    assert_eq!(log_a.entries(), log_b.entries());
    assert_eq!(a.witness_digest, log_a.digest());
}

#[tokio::test]
async fn seed_drives_the_output() {
    let a = run(SEED).await;
    let b = run([0xa5; 32]).await;
    let ra = a.execution_result().expect("result");
    let rb = b.execution_result().expect("result");
    assert_ne!(ra.stdout, rb.stdout);
    assert_ne!(ra.witness_digest, rb.witness_digest);
}

#[tokio::test]
async fn sealed_log_is_self_consistent() {
    let cage = run(SEED).await;
    assert_eq!(cage.state(), CageState::Sealed);
    let log = cage.witness_log().expect("log");
    log.verify_integrity().expect("integrity");

    for (i, entry) in log.entries().iter().enumerate() {
        let proof = log.inclusion_proof(i).expect("proof");
        assert!(log.verify_inclusion(entry, &proof));
        assert!(CageEvent::from_entry(entry).is_ok());
    }

    let first = log.entries().first().expect("first entry");
    let last = log.entries().last().expect("last entry");
    assert_eq!(first.op_type, OpType::Spawn);
    assert_eq!(last.op_type, OpType::Exit);
    assert!(log.termination_fault().is_none());
}

#[tokio::test]
async fn violation_is_the_last_fault_before_exit() {
    let mut cage = DeterminismCage::new(CageConfig::builder(SEED).build());
    cage.activate().expect("activate");
    let err = cage
        .execute_function(|ctx| {
            ctx.write_stdout(b"before")?;
            ctx.invoke(Syscall::Socket)?;
            ctx.write_stdout(b"after")?;
            Ok(0)
        })
        .await
        .expect_err("socket is not allowed");

    assert!(matches!(
        err,
        CageError::PolicyViolation {
            syscall: Some(Syscall::Socket),
            ..
        }
    ));
    let log = cage.witness_log().expect("log is sealed on violation");
    let fault = log.termination_fault().expect("fault entry");
    assert_eq!(fault.op_type, OpType::PolicyViolation);
    let stdout: Vec<_> = log.entries_of(OpType::Stdout).collect();
    assert_eq!(stdout.len(), 1);
    assert_eq!(cage.stats().violations, 1);
}
