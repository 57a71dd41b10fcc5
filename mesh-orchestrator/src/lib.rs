//! The top-level coordinator: ties chunk routing, dispatch, proof
//! collection, aggregation, and settlement into one `infer` operation.

use mesh_core::{
    hash_activations, Amount, FieldElement256, MeshError, NodeInferenceFn, Vector, Worker, WorkerId,
    WorkerStatus, ZkVerify,
};
use mesh_core::{AccountId, NodeInferenceResult};
use mesh_crypto::ZkProver;
use mesh_index::ExpertIndex;
use mesh_ledger::{ContributionTracker, InMemorySink, LedgerSink, RewardSchedule, TokenLedger, TxKind};
use mesh_router::ChunkRouter;
use parking_lot::RwLock;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

fn random_field_element() -> FieldElement256 {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] &= 0b0001_1111;
    bytes
}

/// Long-lived worker bookkeeping: embeddings live in the `ExpertIndex`, but
/// secrets, endpoints, and online/offline status are orchestrator state.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<WorkerId, Worker>>,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a worker, assigning it a secret lazily if it has none yet.
    pub fn register(&self, worker_id: WorkerId, embedding: Vector, endpoint: String) {
        let mut workers = self.workers.write();
        workers.entry(worker_id.clone()).or_insert_with(|| Worker {
            worker_id,
            embedding,
            secret: mesh_core::WorkerSecret(random_field_element()),
            endpoint,
            status: WorkerStatus::Online,
        });
    }

    pub fn mark_offline(&self, worker_id: &WorkerId) {
        if let Some(w) = self.workers.write().get_mut(worker_id) {
            w.status = WorkerStatus::Offline;
        }
    }

    pub fn mark_online(&self, worker_id: &WorkerId) {
        if let Some(w) = self.workers.write().get_mut(worker_id) {
            w.status = WorkerStatus::Online;
        }
    }

    pub fn remove(&self, worker_id: &WorkerId) {
        self.workers.write().remove(worker_id);
    }

    pub fn is_online(&self, worker_id: &WorkerId) -> bool {
        self.workers
            .read()
            .get(worker_id)
            .map(|w| w.status == WorkerStatus::Online)
            .unwrap_or(false)
    }

    /// Never fails: a worker dispatched to without prior registration is
    /// assigned a secret on first use, matching the "lazily at registration"
    /// contract even when registration and first dispatch race.
    pub fn secret_or_assign(&self, worker_id: &WorkerId) -> FieldElement256 {
        if let Some(w) = self.workers.read().get(worker_id) {
            return w.secret.0;
        }
        let mut workers = self.workers.write();
        workers
            .entry(worker_id.clone())
            .or_insert_with(|| Worker {
                worker_id: worker_id.clone(),
                embedding: Vec::new(),
                secret: mesh_core::WorkerSecret(random_field_element()),
                endpoint: String::new(),
                status: WorkerStatus::Online,
            })
            .secret
            .0
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `congestion × utilization²` fee oracle, used when no model id (and hence
/// no flat `model_multiplier`) is given.
pub trait FeeOracle: Send + Sync {
    fn fee(&self) -> Amount;
}

pub struct CongestionFeeOracle {
    base_fee: Amount,
    congestion_multiplier: Amount,
    utilization: RwLock<f64>,
}

impl CongestionFeeOracle {
    pub fn new(base_fee: Amount, congestion_multiplier: Amount) -> Self {
        Self {
            base_fee,
            congestion_multiplier,
            utilization: RwLock::new(0.0),
        }
    }

    pub fn set_utilization(&self, utilization: f64) {
        *self.utilization.write() = utilization.clamp(0.0, 1.0);
    }
}

impl FeeOracle for CongestionFeeOracle {
    fn fee(&self) -> Amount {
        let u = *self.utilization.read();
        self.base_fee * self.congestion_multiplier * u * u
    }
}

/// Whether an invalid proof withholds settlement from only the offending
/// worker, or aborts the whole request. Defaults to withholding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementPolicy {
    WithholdFromFailedWorker,
    AbortOnAnyInvalidProof,
}

impl Default for SettlementPolicy {
    fn default() -> Self {
        Self::WithholdFromFailedWorker
    }
}

/// Resolved policy knob for open question #2: how much of the fee to
/// refund when a chunk fails after the fee was already debited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundPolicy {
    Full,
    ProRata,
}

impl Default for RefundPolicy {
    fn default() -> Self {
        Self::ProRata
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Core(#[from] MeshError),
    #[error("chunk {chunk_index} on worker {worker_id}: {source}")]
    Dispatch {
        chunk_index: u32,
        worker_id: WorkerId,
        #[source]
        source: MeshError,
    },
}

/// `{ prompt, response, per-node results, verification map, total latency,
/// block height, block reward, all current balances, payer remaining
/// balance, fee-per-node }`. Verification is keyed by chunk index, not
/// worker id, since one worker may serve more than one chunk.
#[derive(Debug, Clone)]
pub struct InferenceResult {
    pub prompt: String,
    pub response: String,
    pub per_node: Vec<NodeInferenceResult>,
    pub proof_verifications: HashMap<u32, bool>,
    pub total_latency_ms: u64,
    pub block_height: u64,
    pub block_reward: Amount,
    pub balances: HashMap<AccountId, Amount>,
    pub payer_balance: Amount,
    pub fee_per_node: Amount,
}

pub struct OrchestratorConfig {
    pub model_multipliers: HashMap<String, Amount>,
    pub settlement_policy: SettlementPolicy,
    pub refund_policy: RefundPolicy,
    /// `Some(backoff)` retries a failed dispatch once, after sleeping
    /// `backoff`, before giving up on that chunk.
    pub retry_backoff: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            model_multipliers: HashMap::new(),
            settlement_policy: SettlementPolicy::default(),
            refund_policy: RefundPolicy::default(),
            retry_backoff: Some(Duration::from_millis(50)),
        }
    }
}

pub struct Orchestrator<S: LedgerSink = InMemorySink> {
    index: Arc<ExpertIndex>,
    router: ChunkRouter,
    registry: Arc<WorkerRegistry>,
    prover: Arc<ZkProver>,
    verifier: Arc<dyn ZkVerify>,
    ledger: Arc<TokenLedger<S>>,
    reward_schedule: Arc<RewardSchedule>,
    contribution: Arc<ContributionTracker>,
    inference: Arc<dyn NodeInferenceFn>,
    fee_oracle: Option<Arc<dyn FeeOracle>>,
    config: OrchestratorConfig,
    current_height: AtomicU64,
}

#[allow(clippy::too_many_arguments)]
impl<S: LedgerSink> Orchestrator<S> {
    pub fn new(
        index: Arc<ExpertIndex>,
        router: ChunkRouter,
        registry: Arc<WorkerRegistry>,
        prover: Arc<ZkProver>,
        verifier: Arc<dyn ZkVerify>,
        ledger: Arc<TokenLedger<S>>,
        reward_schedule: Arc<RewardSchedule>,
        contribution: Arc<ContributionTracker>,
        inference: Arc<dyn NodeInferenceFn>,
        fee_oracle: Option<Arc<dyn FeeOracle>>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            index,
            router,
            registry,
            prover,
            verifier,
            ledger,
            reward_schedule,
            contribution,
            inference,
            fee_oracle,
            config,
            current_height: AtomicU64::new(0),
        }
    }

    pub fn register_worker(&self, worker_id: WorkerId, embedding: Vector, endpoint: String) -> Result<(), MeshError> {
        self.index
            .add_expert(worker_id.clone(), &embedding)
            .map_err(|e| MeshError::ComputeError(e.to_string()))?;
        self.registry.register(worker_id, embedding, endpoint);
        Ok(())
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &TokenLedger<S> {
        &self.ledger
    }

    fn resolve_fee(&self, fee_hint: Amount, model: Option<&str>) -> Amount {
        match (model, &self.fee_oracle) {
            (Some(model_id), _) => {
                let multiplier = self.config.model_multipliers.get(model_id).copied().unwrap_or(1.0);
                fee_hint * multiplier
            }
            (None, Some(oracle)) => oracle.fee(),
            (None, None) => 0.0,
        }
    }

    /// Re-homes a routing onto an online worker. If the nearest expert the
    /// router picked is offline, re-queries the index for the next-nearest
    /// candidates over that chunk's embedding and takes the first online one.
    fn resolve_online_worker(&self, routing: &mesh_core::Routing) -> Result<WorkerId, MeshError> {
        if self.registry.is_online(&routing.worker_id) {
            return Ok(routing.worker_id.clone());
        }
        let candidates = self
            .index
            .find_best_experts(&routing.chunk.embedding, self.registry.len().max(1));
        candidates
            .into_iter()
            .map(|(worker_id, _)| worker_id)
            .find(|worker_id| self.registry.is_online(worker_id))
            .ok_or_else(|| {
                MeshError::WorkerUnreachable(format!(
                    "no online worker available for chunk {}",
                    routing.chunk.index
                ))
            })
    }

    async fn dispatch_one(
        &self,
        chunk_index: u32,
        worker_id: WorkerId,
        chunk_text: String,
    ) -> Result<NodeInferenceResult, (u32, WorkerId, MeshError)> {
        let start = Instant::now();

        let mut attempt = self.inference.infer(&worker_id, &chunk_text).await;
        if attempt.is_err() {
            if let Some(backoff) = self.config.retry_backoff {
                tokio::time::sleep(backoff).await;
                attempt = self.inference.infer(&worker_id, &chunk_text).await;
            }
        }
        let output = attempt.map_err(|e| {
            (
                chunk_index,
                worker_id.clone(),
                MeshError::WorkerUnreachable(format!("{worker_id}: {e}")),
            )
        })?;

        let secret = self.registry.secret_or_assign(&worker_id);
        let input_hash = hash_activations(&output.input_tokens);
        let output_hash = hash_activations(&output.output_tokens);
        let proof = self
            .prover
            .prove(&input_hash, &output_hash, &secret)
            .await
            .map_err(|e| (chunk_index, worker_id.clone(), e))?;

        Ok(NodeInferenceResult {
            worker_id,
            chunk_index,
            chunk_text,
            output_text: output.text,
            input_tokens: output.input_tokens,
            output_tokens: output.output_tokens,
            zk_proof: proof,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }

    pub async fn infer(
        &self,
        prompt: &str,
        payer: &AccountId,
        fee_hint: Amount,
        model: Option<&str>,
    ) -> Result<InferenceResult, OrchestratorError> {
        let start = Instant::now();
        let fee = self.resolve_fee(fee_hint, model);

        if fee > 0.0 {
            self.ledger
                .debit(payer, fee, TxKind::Pay, serde_json::json!({"type": "inference_fee"}))?;
        }

        let routings = match self.router.route(prompt).await {
            Ok(r) => r,
            Err(e) => {
                if fee > 0.0 {
                    self.ledger
                        .credit(payer, fee, TxKind::Refund, serde_json::json!({"type": "routing_failed"}));
                }
                return Err(e.into());
            }
        };

        if routings.is_empty() {
            if fee > 0.0 {
                self.ledger
                    .credit(payer, fee, TxKind::Refund, serde_json::json!({"type": "no_routings"}));
            }
            return Err(MeshError::NoRoutings.into());
        }

        let total_chunks = routings.len();

        // `route()` picks the nearest expert with no notion of liveness;
        // excluding an offline worker post-lookup is the Orchestrator's job.
        let resolved: Vec<Result<(u32, WorkerId, String), (u32, WorkerId, MeshError)>> = routings
            .into_iter()
            .map(|r| match self.resolve_online_worker(&r) {
                Ok(worker_id) => Ok((r.chunk.index, worker_id, r.chunk.text)),
                Err(e) => Err((r.chunk.index, r.worker_id, e)),
            })
            .collect();

        let dispatches = resolved
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .map(|(chunk_index, worker_id, chunk_text)| {
                self.dispatch_one(*chunk_index, worker_id.clone(), chunk_text.clone())
            });
        let mut dispatch_results = futures::future::join_all(dispatches).await.into_iter();

        let mut ok_results = Vec::with_capacity(total_chunks);
        let mut failed = 0usize;
        let mut first_error = None;
        for resolution in resolved {
            let result = match resolution {
                Ok(_) => dispatch_results.next().expect("one dispatch result per resolved routing"),
                Err(e) => Err(e),
            };
            match result {
                Ok(r) => ok_results.push(r),
                Err((chunk_index, worker_id, source)) => {
                    failed += 1;
                    warn!(chunk_index, worker_id = %worker_id, error = %source, "chunk dispatch failed");
                    if first_error.is_none() {
                        first_error = Some(OrchestratorError::Dispatch {
                            chunk_index,
                            worker_id,
                            source,
                        });
                    }
                }
            }
        }

        if failed > 0 {
            let refund_ratio = match self.config.refund_policy {
                RefundPolicy::Full => 1.0,
                RefundPolicy::ProRata => failed as f64 / total_chunks as f64,
            };
            let refund_amount = fee * refund_ratio;
            if refund_amount > 0.0 {
                self.ledger.credit(
                    payer,
                    refund_amount,
                    TxKind::Refund,
                    serde_json::json!({"type": "dispatch_failed", "failed_chunks": failed, "total_chunks": total_chunks}),
                );
            }
            return Err(first_error.expect("failed > 0 implies first_error was set"));
        }

        ok_results.sort_by_key(|r| r.chunk_index);

        let mut proof_verifications = HashMap::new();
        for result in &ok_results {
            let valid = self.verifier.verify(&result.zk_proof).unwrap_or(false);
            proof_verifications.insert(result.chunk_index, valid);
        }

        if self.config.settlement_policy == SettlementPolicy::AbortOnAnyInvalidProof
            && proof_verifications.values().any(|v| !v)
        {
            return Err(MeshError::VerificationError(
                "one or more worker proofs failed verification".into(),
            )
            .into());
        }

        let participating: Vec<WorkerId> = match self.config.settlement_policy {
            SettlementPolicy::WithholdFromFailedWorker => ok_results
                .iter()
                .filter(|r| proof_verifications[&r.chunk_index])
                .map(|r| r.worker_id.clone())
                .collect(),
            SettlementPolicy::AbortOnAnyInvalidProof => {
                ok_results.iter().map(|r| r.worker_id.clone()).collect()
            }
        };

        let response = ok_results
            .iter()
            .map(|r| r.output_text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string();

        let now = mesh_core::now_ts();
        self.reward_schedule.record_inference(now);
        let height = self.current_height.fetch_add(1, Ordering::SeqCst);
        let reward = self.reward_schedule.block_reward(height, now);

        if !participating.is_empty() && reward > 0.0 {
            let share = reward / participating.len() as f64;
            for worker in &participating {
                self.ledger
                    .credit(worker, share, TxKind::Mine, serde_json::json!({"block_height": height}));
            }
        }

        let model_id = model.unwrap_or("default");
        let payouts = self.contribution.split(fee, &participating, model_id);
        for payout in &payouts {
            self.ledger.credit(
                &payout.account,
                payout.amount,
                TxKind::Fee,
                serde_json::json!({"role": format!("{:?}", payout.role)}),
            );
        }

        info!(
            height,
            reward,
            fee,
            workers = participating.len(),
            "inference settled"
        );

        Ok(InferenceResult {
            prompt: prompt.to_string(),
            response,
            per_node: ok_results,
            proof_verifications,
            total_latency_ms: start.elapsed().as_millis() as u64,
            block_height: height,
            block_reward: reward,
            balances: self.ledger.all_balances(),
            payer_balance: self.ledger.get_balance(payer),
            fee_per_node: if participating.is_empty() {
                0.0
            } else {
                fee / participating.len() as f64
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_assigns_secret_lazily_on_first_dispatch() {
        let registry = WorkerRegistry::new();
        let id = "worker-1".to_string();
        assert!(!registry.is_online(&id));
        let secret_a = registry.secret_or_assign(&id);
        let secret_b = registry.secret_or_assign(&id);
        assert_eq!(secret_a, secret_b);
    }

    #[test]
    fn registry_tracks_online_offline_status() {
        let registry = WorkerRegistry::new();
        let id = "worker-1".to_string();
        registry.register(id.clone(), vec![1.0, 0.0], "127.0.0.1:9000".to_string());
        assert!(registry.is_online(&id));
        registry.mark_offline(&id);
        assert!(!registry.is_online(&id));
        registry.mark_online(&id);
        assert!(registry.is_online(&id));
    }

    #[test]
    fn registry_remove_drops_worker() {
        let registry = WorkerRegistry::new();
        let id = "worker-1".to_string();
        registry.register(id.clone(), vec![1.0, 0.0], "127.0.0.1:9000".to_string());
        assert_eq!(registry.len(), 1);
        registry.remove(&id);
        assert!(registry.is_empty());
    }

    #[test]
    fn congestion_fee_oracle_scales_with_utilization_squared() {
        let oracle = CongestionFeeOracle::new(1.0, 2.0);
        oracle.set_utilization(0.5);
        assert!((oracle.fee() - (1.0 * 2.0 * 0.25)).abs() < 1e-12);
        oracle.set_utilization(1.0);
        assert!((oracle.fee() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn congestion_fee_oracle_clamps_utilization() {
        let oracle = CongestionFeeOracle::new(1.0, 1.0);
        oracle.set_utilization(5.0);
        assert!((oracle.fee() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn settlement_and_refund_policies_default_per_policy_resolution() {
        assert_eq!(SettlementPolicy::default(), SettlementPolicy::WithholdFromFailedWorker);
        assert_eq!(RefundPolicy::default(), RefundPolicy::ProRata);
    }
}
