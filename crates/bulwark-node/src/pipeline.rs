//! Node wiring: cage, receipt generator and transport.
//!
//! ```text
//! execute_* ──► DeterminismCage ──► ExecutionResult + WitnessLog
//!                                        │
//!                                        ▼
//!                               ReceiptGenerator ──► Receipt
//!                                                      │ publish
//!                                                      ▼
//!                                                  Transport ──► peer
//!
//! peer ──► Transport ──► ingest task ──► ReceiptVerifier ──► ReceiptSink
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bulwark_core::cage::{CageContext, CageError, DeterminismCage, ExecutionResult, Interrupt};
use bulwark_core::crypto::{FileKeyStore, KeyStore, VerifyingKey};
use bulwark_core::receipt::{
    Clock, ExecutionId, PolicyEngine, PolicyInput, Receipt, ReceiptError, ReceiptGenerator,
    ResourcePolicy, SystemClock,
};
use bulwark_core::witness::WitnessLog;
use bulwark_transport::{
    ClusterId, Inbound, LogicalTicks, PeerDirectory, PeerInfo, StaticDirectory, TickSource,
    Transport,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use crate::config::{ConfigError, NodeConfig};
use crate::error::{FaultedRun, NodeError};
use crate::sink::ReceiptSink;

/// One finished execution and its signed receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    /// Identifier carried in the receipt.
    pub execution_id: ExecutionId,
    /// What the workload produced.
    pub result: ExecutionResult,
    /// The sealed audit trail of the run.
    pub witness: WitnessLog,
    /// Receipt over `result`, signed by this node.
    pub receipt: Receipt,
}

/// Node counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    /// Executions that produced a receipt.
    pub executions: u64,
    /// Executions that ended in a cage error.
    pub failed_executions: u64,
    /// Receipts sent to peers.
    pub published: u64,
    /// Peer receipts accepted.
    pub accepted: u64,
    /// Peer payloads rejected.
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    executions: AtomicU64,
    failed_executions: AtomicU64,
    published: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

/// Checks receipts arriving from peers against the directory.
#[derive(Clone)]
pub struct ReceiptVerifier {
    directory: Arc<dyn PeerDirectory>,
}

impl ReceiptVerifier {
    /// Verifier backed by `directory`.
    #[must_use]
    pub fn new(directory: Arc<dyn PeerDirectory>) -> Self {
        Self { directory }
    }

    /// Decodes the payload and verifies it under the sender's key.
    ///
    /// # Errors
    ///
    /// - [`NodeError::UnknownSender`] if the sender is not in the directory
    /// - [`NodeError::ReceiptRejected`] if the payload is not a canonical
    ///   receipt or its signature does not verify
    pub fn verify(&self, inbound: &Inbound) -> Result<Receipt, NodeError> {
        let peer = inbound.src;
        let info = self
            .directory
            .lookup(&peer)
            .ok_or(NodeError::UnknownSender(peer))?;
        let rejected = |source: ReceiptError| NodeError::ReceiptRejected { peer, source };
        let receipt = Receipt::from_bytes(&inbound.payload).map_err(|e| rejected(e.into()))?;
        receipt.verify(&info.verifying_key).map_err(rejected)?;
        Ok(receipt)
    }
}

/// Components a node is started with.
pub struct NodeParts<C> {
    /// Source of the signing key.
    pub keys: Box<dyn KeyStore>,
    /// Receipt timestamps.
    pub clock: C,
    /// Decides the policy outcome recorded in each receipt.
    pub policy: Arc<dyn PolicyEngine>,
    /// Tick references for outgoing frames.
    pub ticks: Arc<dyn TickSource>,
    /// Destination for verified peer receipts.
    pub sink: Arc<dyn ReceiptSink>,
}

/// A running node.
pub struct Node<C: Clock = SystemClock> {
    config: NodeConfig,
    cluster: ClusterId,
    generator: ReceiptGenerator<C>,
    policy: Arc<dyn PolicyEngine>,
    directory: Arc<StaticDirectory>,
    transport: Transport,
    listen_addr: Option<SocketAddr>,
    counters: Arc<Counters>,
    ingest: JoinHandle<()>,
}

impl Node<SystemClock> {
    /// Starts a node with a file key store at `config.node.key_dir`, the
    /// system clock, the resource compliance policy and local logical ticks.
    pub async fn start(config: NodeConfig, sink: Arc<dyn ReceiptSink>) -> Result<Self, NodeError> {
        let keys = FileKeyStore::open(&config.node.key_dir)?;
        Self::start_with(
            config,
            NodeParts {
                keys: Box::new(keys),
                clock: SystemClock,
                policy: Arc::new(ResourcePolicy::new()),
                ticks: Arc::new(LogicalTicks::new()),
                sink,
            },
        )
        .await
    }
}

impl<C: Clock> Node<C> {
    /// Validates `config`, loads or creates the signing key, and starts the
    /// transport and the receipt ingest task.
    ///
    /// # Errors
    ///
    /// - [`NodeError::Config`] if `config` is invalid
    /// - [`NodeError::KeyStore`] if the key cannot be loaded or stored
    /// - [`NodeError::Transport`] if the listen address cannot be bound
    #[instrument(skip_all, fields(cluster = %config.node.cluster_id))]
    pub async fn start_with(config: NodeConfig, parts: NodeParts<C>) -> Result<Self, NodeError> {
        config.validate()?;
        let cluster = config.cluster_id()?;
        let signer = Arc::new(parts.keys.load_or_generate(&config.node.key_name)?);

        let directory = Arc::new(StaticDirectory::new());
        for (peer, info) in config.peers()? {
            directory.insert(peer, info);
        }

        let (transport, inbound) = Transport::new(
            cluster,
            Arc::clone(&signer),
            config.transport_config()?,
            Arc::clone(&directory) as Arc<dyn PeerDirectory>,
            parts.ticks,
        )
        .map_err(|e| ConfigError::Validation(e.0))?;

        let listen_addr = match config.node.listen {
            Some(addr) => Some(transport.listen(addr).await?),
            None => None,
        };

        let counters = Arc::new(Counters::default());
        let ingest = tokio::spawn(
            ingest(
                inbound,
                ReceiptVerifier::new(Arc::clone(&directory) as Arc<dyn PeerDirectory>),
                parts.sink,
                Arc::clone(&counters),
            )
            .instrument(info_span!("ingest", cluster = %cluster)),
        );

        info!(
            cluster = %cluster,
            public_key = %hex::encode(signer.verifying_key().as_bytes()),
            listen = ?listen_addr,
            peers = directory.len(),
            "node started"
        );
        Ok(Self {
            config,
            cluster,
            generator: ReceiptGenerator::new(signer, parts.clock),
            policy: parts.policy,
            directory,
            transport,
            listen_addr,
            counters,
            ingest,
        })
    }

    /// This node's cluster id.
    #[must_use]
    pub const fn cluster_id(&self) -> ClusterId {
        self.cluster
    }

    /// The key receipts and frames are signed with.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.generator.signer().verifying_key()
    }

    /// The bound listen address, if the node listens.
    #[must_use]
    pub const fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// The node's transport.
    #[must_use]
    pub const fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Adds or replaces a peer at runtime.
    pub fn add_peer(&self, peer: ClusterId, info: PeerInfo) {
        self.directory.insert(peer, info);
    }

    /// Runs `workload` in a fresh cage seeded with `seed` and signs a
    /// receipt for the result.
    ///
    /// # Errors
    ///
    /// - [`NodeError::Cage`] if the run faulted; when the cage sealed, the
    ///   error carries the [`FaultedRun`] whose log records the fault
    /// - [`NodeError::Receipt`] if the result cannot be encoded
    #[instrument(skip(self, seed, workload), fields(cluster = %self.cluster))]
    pub async fn execute_function<F>(&self, seed: [u8; 32], workload: F) -> Result<Execution, NodeError>
    where
        F: FnOnce(&mut CageContext) -> Result<i32, Interrupt> + Send + 'static,
    {
        let mut cage = self.cage(seed)?;
        let outcome = cage.execute_function(workload).await;
        self.seal(&cage, outcome)
    }

    /// Runs `argv` in a fresh cage seeded with `seed` and signs a receipt
    /// for the result.
    ///
    /// # Errors
    ///
    /// As [`execute_function`](Self::execute_function).
    #[instrument(skip(self, seed), fields(cluster = %self.cluster))]
    pub async fn execute_command(&self, seed: [u8; 32], argv: &[String]) -> Result<Execution, NodeError> {
        let mut cage = self.cage(seed)?;
        let outcome = cage.execute_command(argv).await;
        self.seal(&cage, outcome)
    }

    /// Sends `receipt` to `peer`.
    ///
    /// # Errors
    ///
    /// [`NodeError::Receipt`] if it cannot be encoded, [`NodeError::Transport`]
    /// if it cannot be delivered.
    #[instrument(skip(self, receipt), fields(execution_id = %receipt.execution_id))]
    pub async fn publish(&self, peer: ClusterId, receipt: &Receipt) -> Result<(), NodeError> {
        let bytes = receipt.to_bytes().map_err(ReceiptError::from)?;
        self.transport.send(peer, &bytes).await?;
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        debug!(peer = %peer, "receipt published");
        Ok(())
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> NodeStats {
        let c = &self.counters;
        NodeStats {
            executions: c.executions.load(Ordering::Relaxed),
            failed_executions: c.failed_executions.load(Ordering::Relaxed),
            published: c.published.load(Ordering::Relaxed),
            accepted: c.accepted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
        }
    }

    /// Closes every session and stops receiving.
    pub async fn shutdown(self) {
        self.transport.shutdown().await;
        self.ingest.abort();
        info!(cluster = %self.cluster, "node stopped");
    }

    fn cage(&self, seed: [u8; 32]) -> Result<DeterminismCage, NodeError> {
        let mut cage = DeterminismCage::new(self.config.cage_config(seed)?);
        cage.activate()?;
        Ok(cage)
    }

    fn seal(
        &self,
        cage: &DeterminismCage,
        outcome: Result<ExecutionResult, CageError>,
    ) -> Result<Execution, NodeError> {
        let result = match outcome {
            Ok(result) => result,
            Err(source) => {
                self.counters.failed_executions.fetch_add(1, Ordering::Relaxed);
                let run = cage
                    .witness_log()
                    .zip(cage.execution_result())
                    .map(|(witness, result)| {
                        Box::new(FaultedRun {
                            witness: witness.clone(),
                            result: result.clone(),
                        })
                    });
                warn!(
                    cluster = %self.cluster,
                    error = %source,
                    witness_entries = run.as_ref().map_or(0, |run| run.witness.len()),
                    "execution failed"
                );
                return Err(NodeError::Cage { source, run });
            },
        };
        let witness = cage.witness_log().cloned().ok_or(CageError::InvalidState {
            operation: "read witness log",
            state: cage.state(),
        })?;

        let execution_id = ExecutionId::random();
        let decision = self.policy.evaluate(&PolicyInput {
            execution_id: &execution_id,
            result: &result,
            usage: cage.stats().usage,
            limits: &cage.config().resource_limits,
        });
        let receipt = self
            .generator
            .generate_receipt(execution_id, &result, decision)?;
        self.counters.executions.fetch_add(1, Ordering::Relaxed);
        info!(
            execution_id = %execution_id,
            exit_code = result.exit_code,
            witness_digest = %result.witness_digest,
            "execution receipted"
        );
        Ok(Execution {
            execution_id,
            result,
            witness,
            receipt,
        })
    }
}

async fn ingest(
    mut inbound: mpsc::Receiver<Inbound>,
    verifier: ReceiptVerifier,
    sink: Arc<dyn ReceiptSink>,
    counters: Arc<Counters>,
) {
    while let Some(message) = inbound.recv().await {
        match verifier.verify(&message) {
            Ok(receipt) => {
                counters.accepted.fetch_add(1, Ordering::Relaxed);
                debug!(
                    peer = %message.src,
                    execution_id = %receipt.execution_id,
                    "peer receipt accepted"
                );
                sink.accept(message.src, receipt);
            },
            Err(err) => {
                counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(peer = %message.src, error = %err, "peer receipt rejected");
                sink.reject(message.src, &err);
            },
        }
    }
    debug!("inbound channel closed");
}

#[cfg(test)]
mod tests {
    use bulwark_core::crypto::{MemoryKeyStore, Signer};
    use bulwark_core::receipt::{ComplianceReport, ComplianceStatus, FixedClock};
    use bulwark_transport::TickRef;

    use super::*;
    use crate::sink::MemorySink;

    const CLUSTER: &str = "0123456789abcdef0123456789abcdef";

    fn config() -> NodeConfig {
        NodeConfig::from_toml(&format!("[node]\ncluster_id = \"{CLUSTER}\"\n")).unwrap()
    }

    async fn node() -> Node<FixedClock> {
        Node::start_with(
            config(),
            NodeParts {
                keys: Box::new(MemoryKeyStore::new()),
                clock: FixedClock::new(1_700_000_000_000),
                policy: Arc::new(ResourcePolicy::new()),
                ticks: Arc::new(LogicalTicks::new()),
                sink: Arc::new(MemorySink::new()),
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn function_run_is_receipted() {
        let node = node().await;
        let execution = node
            .execute_function([3; 32], |ctx| {
                let n = ctx.random_u64()?;
                ctx.write_stdout(&n.to_le_bytes())?;
                Ok(0)
            })
            .await
            .unwrap();
        assert!(execution.receipt.covers(&execution.result).unwrap());
        execution.receipt.verify(&node.verifying_key()).unwrap();
        assert_eq!(execution.result.witness_digest, execution.witness.digest());
        assert_eq!(execution.receipt.timestamp, 1_700_000_000_000);
        assert_eq!(node.stats().executions, 1);

        let report = ComplianceReport::from_decision(&execution.receipt.policy_decision).unwrap();
        assert_eq!(report.status, ComplianceStatus::Compliant);
        assert_eq!(report.checks.len(), 3);
    }

    #[tokio::test]
    async fn faults_are_counted_not_receipted() {
        let node = node().await;
        let err = node
            .execute_function([3; 32], |ctx| {
                ctx.invoke(bulwark_core::cage::Syscall::Socket)?;
                Ok(0)
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NodeError::Cage {
                source: CageError::PolicyViolation { .. },
                ..
            }
        ));
        let run = err.faulted_run().unwrap();
        assert_eq!(run.result.witness_digest, run.witness.digest());
        let stats = node.stats();
        assert_eq!((stats.executions, stats.failed_executions), (0, 1));
    }

    #[test]
    fn verifier_rejects_unknown_and_forged() {
        let directory = Arc::new(StaticDirectory::new());
        let verifier = ReceiptVerifier::new(Arc::clone(&directory) as Arc<dyn PeerDirectory>);
        let peer = ClusterId::from_bytes([4; 16]);
        let signer = Signer::from_secret_bytes(&[4; 32]);
        let generator = ReceiptGenerator::new(Arc::new(signer), FixedClock::new(5));
        let result = ExecutionResult {
            exit_code: 0,
            stdout: b"ok".to_vec(),
            stderr: Vec::new(),
            duration: std::time::Duration::from_micros(3),
            witness_digest: bulwark_core::Digest::ZERO,
        };
        let receipt = generator
            .generate_receipt(ExecutionId::from_bytes([1; 16]), &result, Default::default())
            .unwrap();
        let inbound = |payload: Vec<u8>| Inbound {
            src: peer,
            svc: bulwark_transport::ServiceId::from_name("svc"),
            tick_ref: TickRef::default(),
            payload,
        };

        let good = inbound(receipt.to_bytes().unwrap());
        assert!(matches!(verifier.verify(&good), Err(NodeError::UnknownSender(p)) if p == peer));

        directory.insert(
            peer,
            PeerInfo {
                verifying_key: generator.signer().verifying_key(),
                address: None,
            },
        );
        assert_eq!(verifier.verify(&good).unwrap(), receipt);

        let mut forged = receipt.clone();
        forged.timestamp += 1;
        assert!(matches!(
            verifier.verify(&inbound(forged.to_bytes().unwrap())),
            Err(NodeError::ReceiptRejected { source: ReceiptError::Signature(_), .. })
        ));
        assert!(matches!(
            verifier.verify(&inbound(b"not a receipt".to_vec())),
            Err(NodeError::ReceiptRejected { source: ReceiptError::Serialization(_), .. })
        ));
    }
}
