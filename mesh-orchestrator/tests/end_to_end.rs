use async_trait::async_trait;
use mesh_core::{EmbedFn, NodeInferenceFn, NodeInferenceOutput, Vector, ZkProof, ZkVerify};
use mesh_crypto::{ProverBackend, ZkProver, ZkVerifier};
use mesh_index::{ExpertIndex, IndexParams};
use mesh_ledger::{ContributionTracker, ContributionTree, RewardSchedule, TokenLedger, TxKind};
use mesh_orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError, WorkerRegistry};
use mesh_router::ChunkRouter;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Embeds a chunk of text as the 2-D unit vector matching its first byte
/// mod 4, so test prompts route deterministically to one of four quadrant
/// "experts".
struct QuadrantEmbed;

#[async_trait]
impl EmbedFn for QuadrantEmbed {
    async fn embed(&self, text: &str) -> anyhow::Result<Vector> {
        let b = text.as_bytes().first().copied().unwrap_or(0) as u32 % 4;
        Ok(match b {
            0 => vec![1.0, 0.0],
            1 => vec![0.0, 1.0],
            2 => vec![-1.0, 0.0],
            _ => vec![0.0, -1.0],
        })
    }
}

/// Deterministic stand-in worker: echoes the chunk text back, with
/// token vectors derived from its length so the ZK commitment is stable.
struct EchoInference;

#[async_trait]
impl NodeInferenceFn for EchoInference {
    async fn infer(&self, worker_id: &str, chunk_text: &str) -> anyhow::Result<NodeInferenceOutput> {
        let len = chunk_text.len() as f32;
        Ok(NodeInferenceOutput {
            text: format!("[{worker_id}] {chunk_text}"),
            input_tokens: vec![len, len * 2.0],
            output_tokens: vec![len * 3.0],
        })
    }
}

fn build_orchestrator(
    config: OrchestratorConfig,
    max_chunk_length: usize,
) -> (Orchestrator, Arc<WorkerRegistry>, Arc<TokenLedger>) {
    let prover = Arc::new(ZkProver::new(ProverBackend::Portable).expect("groth16 setup"));
    let verifier = Arc::new(ZkVerifier::from_prover(&prover));
    build_orchestrator_with(config, max_chunk_length, prover, verifier)
}

/// Same wiring as `build_orchestrator`, but lets a test substitute its own
/// verifier (e.g. one that deliberately rejects a specific proof) without
/// touching proof generation.
fn build_orchestrator_with(
    config: OrchestratorConfig,
    max_chunk_length: usize,
    prover: Arc<ZkProver>,
    verifier: Arc<dyn ZkVerify>,
) -> (Orchestrator, Arc<WorkerRegistry>, Arc<TokenLedger>) {
    let index = Arc::new(ExpertIndex::new(2, IndexParams::default()));
    let router = ChunkRouter::new(index.clone(), Arc::new(QuadrantEmbed), max_chunk_length);
    let registry = Arc::new(WorkerRegistry::new());
    let ledger = Arc::new(TokenLedger::in_memory());
    let reward_schedule = Arc::new(RewardSchedule::new(
        50.0,
        21_000_000.0,
        1e-8,
        mesh_ledger::EpochLength::Fixed(4),
    ));
    let contribution = Arc::new(ContributionTracker::new(ContributionTree::new()));

    let orchestrator = Orchestrator::new(
        index,
        router,
        registry.clone(),
        prover,
        verifier,
        ledger.clone(),
        reward_schedule,
        contribution,
        Arc::new(EchoInference),
        None,
        config,
    );

    (orchestrator, registry, ledger)
}

/// Wraps a real verifier but forces a specific call (by position, in the
/// order `infer()` verifies proofs — ascending chunk index) to report
/// failure, simulating one worker's proof being rejected without needing to
/// tamper with cryptographic internals.
struct FailNthVerifier {
    inner: Arc<ZkVerifier>,
    calls: AtomicUsize,
    fail_at: usize,
}

impl ZkVerify for FailNthVerifier {
    fn verify(&self, proof: &ZkProof) -> Result<bool, mesh_core::MeshError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == self.fail_at {
            return Ok(false);
        }
        self.inner.verify(proof)
    }
}

#[tokio::test]
async fn insufficient_funds_blocks_dispatch_without_consuming_height() {
    let (orchestrator, registry, ledger) = build_orchestrator(OrchestratorConfig::default(), 4096);
    orchestrator
        .register_worker("worker-a".to_string(), vec![1.0, 0.0], "127.0.0.1:9001".to_string())
        .unwrap();
    assert!(registry.is_online(&"worker-a".to_string()));

    let payer = "payer-1".to_string();
    ledger.credit(&payer, 4.0, TxKind::Pay, serde_json::json!({}));

    let err = orchestrator
        .infer("hello mesh", &payer, 5.0, Some("base"))
        .await
        .unwrap_err();

    match err {
        OrchestratorError::Core(mesh_core::MeshError::InsufficientFunds { balance, amount }) => {
            assert_eq!(balance, 4.0);
            assert_eq!(amount, 5.0);
        }
        other => panic!("expected InsufficientFunds, got {other:?}"),
    }
    assert_eq!(ledger.get_balance(&payer), 4.0);
}

#[tokio::test]
async fn successful_inference_settles_fees_and_reward_across_workers() {
    let (orchestrator, _registry, ledger) = build_orchestrator(OrchestratorConfig::default(), 4096);
    orchestrator
        .register_worker("worker-a".to_string(), vec![1.0, 0.0], "127.0.0.1:9001".to_string())
        .unwrap();
    orchestrator
        .register_worker("worker-b".to_string(), vec![0.0, 1.0], "127.0.0.1:9002".to_string())
        .unwrap();

    let payer = "payer-1".to_string();
    ledger.credit(&payer, 100.0, TxKind::Pay, serde_json::json!({}));

    let result = orchestrator
        .infer("ab", &payer, 10.0, Some("base"))
        .await
        .expect("inference succeeds");

    assert!(!result.response.is_empty());
    assert!(result.proof_verifications.values().all(|&v| v));
    assert_eq!(result.block_height, 0);
    assert!(result.block_reward > 0.0);
    assert!(ledger.get_balance(&payer) < 100.0);

    let total_credited: f64 = result
        .balances
        .iter()
        .filter(|(id, _)| id.as_str() != payer.as_str())
        .map(|(_, bal)| *bal)
        .sum();
    assert!(total_credited > 0.0);
}

#[tokio::test]
async fn auto_scale_routes_across_more_than_four_quadrant_workers() {
    let (orchestrator, _registry, ledger) = build_orchestrator(OrchestratorConfig::default(), 4);
    for (i, name) in ["worker-0", "worker-1", "worker-2", "worker-3", "worker-4"]
        .iter()
        .enumerate()
    {
        let embedding = match i % 4 {
            0 => vec![1.0, 0.0],
            1 => vec![0.0, 1.0],
            2 => vec![-1.0, 0.0],
            _ => vec![0.0, -1.0],
        };
        orchestrator
            .register_worker(name.to_string(), embedding, format!("127.0.0.1:{}", 9000 + i))
            .unwrap();
    }

    let payer = "payer-1".to_string();
    ledger.credit(&payer, 1000.0, TxKind::Pay, serde_json::json!({}));

    // Four words, each landing in a different embedding quadrant, packed
    // one per chunk by the small max_chunk_length above.
    let prompt = "aaaa bbbb cccc dddd";
    let result = orchestrator
        .infer(prompt, &payer, 10.0, Some("base"))
        .await
        .expect("inference succeeds");

    let distinct_workers: std::collections::HashSet<_> =
        result.per_node.iter().map(|r| r.worker_id.clone()).collect();
    assert!(distinct_workers.len() >= 2, "expected routing to fan out across workers");
}

#[tokio::test]
async fn zero_fee_hint_with_no_model_and_no_oracle_charges_nothing() {
    let (orchestrator, _registry, ledger) = build_orchestrator(OrchestratorConfig::default(), 4096);
    orchestrator
        .register_worker("worker-a".to_string(), vec![1.0, 0.0], "127.0.0.1:9001".to_string())
        .unwrap();

    let payer = "payer-1".to_string();
    let result = orchestrator
        .infer("a", &payer, 10.0, None)
        .await
        .expect("inference succeeds with no fee");

    assert_eq!(ledger.get_balance(&payer), 0.0);
    assert_eq!(result.fee_per_node, 0.0);
}

#[tokio::test]
async fn offline_worker_is_excluded_from_dispatch() {
    let (orchestrator, registry, ledger) = build_orchestrator(OrchestratorConfig::default(), 4096);
    orchestrator
        .register_worker("worker-a".to_string(), vec![1.0, 0.0], "127.0.0.1:9001".to_string())
        .unwrap();
    orchestrator
        .register_worker("worker-b".to_string(), vec![1.0, 0.0], "127.0.0.1:9002".to_string())
        .unwrap();
    registry.mark_offline(&"worker-a".to_string());

    let payer = "payer-1".to_string();
    ledger.credit(&payer, 100.0, TxKind::Pay, serde_json::json!({}));

    let result = orchestrator
        .infer("hello", &payer, 10.0, Some("base"))
        .await
        .expect("inference succeeds by re-homing onto the online worker");

    assert_eq!(result.per_node.len(), 1);
    assert_eq!(result.per_node[0].worker_id, "worker-b");
}

#[tokio::test]
async fn all_workers_offline_fails_that_chunk_and_refunds() {
    let (orchestrator, registry, ledger) = build_orchestrator(OrchestratorConfig::default(), 4096);
    orchestrator
        .register_worker("worker-a".to_string(), vec![1.0, 0.0], "127.0.0.1:9001".to_string())
        .unwrap();
    registry.mark_offline(&"worker-a".to_string());

    let payer = "payer-1".to_string();
    ledger.credit(&payer, 100.0, TxKind::Pay, serde_json::json!({}));

    let err = orchestrator
        .infer("hello", &payer, 10.0, Some("base"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::Dispatch {
            source: mesh_core::MeshError::WorkerUnreachable(_),
            ..
        }
    ));
    assert_eq!(ledger.get_balance(&payer), 100.0);
}

#[tokio::test]
async fn failed_proof_withholds_only_the_offending_worker() {
    let prover = Arc::new(ZkProver::new(ProverBackend::Portable).expect("groth16 setup"));
    let real_verifier = Arc::new(ZkVerifier::from_prover(&prover));
    let verifier: Arc<dyn ZkVerify> = Arc::new(FailNthVerifier {
        inner: real_verifier,
        calls: AtomicUsize::new(0),
        fail_at: 1,
    });

    let (orchestrator, _registry, ledger) =
        build_orchestrator_with(OrchestratorConfig::default(), 4, prover, verifier);
    orchestrator
        .register_worker("worker-0".to_string(), vec![0.0, 1.0], "127.0.0.1:9001".to_string())
        .unwrap();
    orchestrator
        .register_worker("worker-1".to_string(), vec![-1.0, 0.0], "127.0.0.1:9002".to_string())
        .unwrap();

    let payer = "payer-1".to_string();
    ledger.credit(&payer, 100.0, TxKind::Pay, serde_json::json!({}));

    // "aaaa" (quadrant 1) and "bbbb" (quadrant 2) each pack into their own
    // chunk and route to worker-0 and worker-1 respectively; proofs verify
    // in ascending chunk-index order, so `fail_at: 1` rejects worker-1's.
    let result = orchestrator
        .infer("aaaa bbbb", &payer, 10.0, Some("base"))
        .await
        .expect("inference still settles with one proof withheld");

    assert_eq!(result.proof_verifications.len(), 2);
    assert!(result.proof_verifications[&0]);
    assert!(!result.proof_verifications[&1]);

    let failed_worker = result
        .per_node
        .iter()
        .find(|r| r.chunk_index == 1)
        .unwrap()
        .worker_id
        .clone();
    let ok_worker = result
        .per_node
        .iter()
        .find(|r| r.chunk_index == 0)
        .unwrap()
        .worker_id
        .clone();

    assert_eq!(result.balances.get(&failed_worker).copied().unwrap_or(0.0), 0.0);
    assert!(result.balances.get(&ok_worker).copied().unwrap_or(0.0) > 0.0);
}
