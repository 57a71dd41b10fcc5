use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use mesh_core::{EmbedFn, NodeInferenceFn, NodeInferenceOutput, Vector};
use mesh_crypto::{ProverBackend, ZkProver, ZkVerifier};
use mesh_index::{ExpertIndex, IndexParams};
use mesh_ledger::{ContributionTracker, ContributionTree, EpochLength, RewardSchedule, TokenLedger, TxKind};
use mesh_orchestrator::{Orchestrator, OrchestratorConfig, WorkerRegistry};
use mesh_relay::{ComputeFn, LayerRangeServer, RelayClient};
use mesh_router::ChunkRouter;
use serde::{Deserialize, Serialize};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Every node-level tunable: chunking, economics, relay auth, and which
/// prover backend to run. Loaded from a TOML file with `MESH__`-prefixed
/// environment overrides taking precedence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    pub max_chunk_length: usize,
    pub dimensions: usize,
    pub halving_interval_blocks: u64,
    pub base_fee: f64,
    pub congestion_multiplier: f64,
    pub min_reward: f64,
    /// Hex-encoded shared HMAC secret for the activation relay.
    pub hmac_secret: String,
    pub relay_timeout_ms: u64,
    pub prove_timeout_ms: u64,
    pub prover_backend: ProverBackendConfig,
    pub native_prover_binary: Option<PathBuf>,
    pub native_prover_zkey: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProverBackendConfig {
    Native,
    Portable,
}

impl MeshConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("MESH").separator("__"));
        let cfg = builder.build().context("loading mesh config")?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn example() -> Self {
        Self {
            max_chunk_length: 256,
            dimensions: 4,
            halving_interval_blocks: 210_000,
            base_fee: 1.0,
            congestion_multiplier: 2.0,
            min_reward: 1e-8,
            hmac_secret: "736563726574".to_string(),
            relay_timeout_ms: 2_000,
            prove_timeout_ms: 5_000,
            prover_backend: ProverBackendConfig::Portable,
            native_prover_binary: None,
            native_prover_zkey: None,
        }
    }

    fn hmac_secret_bytes(&self) -> Result<Vec<u8>> {
        (0..self.hmac_secret.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&self.hmac_secret[i..i + 2], 16))
            .collect::<Result<Vec<u8>, _>>()
            .context("hmac_secret must be hex-encoded")
    }

    fn prover_backend(&self) -> ProverBackend {
        match (self.prover_backend, &self.native_prover_binary, &self.native_prover_zkey) {
            (ProverBackendConfig::Native, Some(binary), Some(zkey)) => {
                // A bare name (e.g. "mesh-prover") is resolved against PATH;
                // anything containing a path separator is used as-is.
                let resolved = if binary.components().count() > 1 {
                    binary.clone()
                } else {
                    which::which(binary).unwrap_or_else(|_| binary.clone())
                };
                ProverBackend::Native {
                    binary: resolved,
                    zkey: zkey.clone(),
                }
            }
            _ => ProverBackend::Portable,
        }
    }
}

/// Hashes chunk text into a fixed-length unit-ish vector, standing in for a
/// real embedding model in this demo deployment.
struct HashEmbed {
    dimensions: usize,
}

#[async_trait]
impl EmbedFn for HashEmbed {
    async fn embed(&self, text: &str) -> Result<Vector> {
        Ok(hash_to_vector(text, self.dimensions))
    }
}

fn hash_to_vector(text: &str, dimensions: usize) -> Vector {
    let digest = mesh_core::hash_activations(&text.bytes().map(|b| b as f32).collect::<Vec<_>>());
    (0..dimensions)
        .map(|i| (digest[i % digest.len()] as f32 / 255.0) * 2.0 - 1.0)
        .collect()
}

/// Scales every activation by a per-worker constant, so distinct demo
/// workers produce distinguishable output without a real model backing them.
struct ScalingCompute {
    scale: f32,
}

#[async_trait]
impl ComputeFn for ScalingCompute {
    async fn compute(&self, input: Vector, layer_index: u32) -> Result<Vector> {
        Ok(input
            .into_iter()
            .map(|x| x * self.scale + 0.01 * layer_index as f32)
            .collect())
    }
}

/// Dispatches each chunk over the relay to its worker's `LayerRangeServer`
/// and reports the relayed tensors back as the inference result.
struct RelayInference {
    endpoints: HashMap<String, SocketAddr>,
    client: RelayClient,
    timeout: Duration,
    retry_backoff: Duration,
    dimensions: usize,
}

#[async_trait]
impl NodeInferenceFn for RelayInference {
    async fn infer(&self, worker_id: &str, chunk_text: &str) -> Result<NodeInferenceOutput> {
        let addr = self
            .endpoints
            .get(worker_id)
            .with_context(|| format!("no relay endpoint registered for worker {worker_id}"))?;
        let input_tokens = hash_to_vector(chunk_text, self.dimensions);
        let output_tokens = self
            .client
            .send_with_retry(&addr.to_string(), input_tokens.clone(), self.timeout, self.retry_backoff)
            .await
            .map_err(|e| anyhow::anyhow!("relay dispatch to {worker_id} failed: {e}"))?;
        Ok(NodeInferenceOutput {
            text: chunk_text.to_string(),
            input_tokens,
            output_tokens,
        })
    }
}

fn init_logging() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Composition root: loads config, wires an in-process deployment of every
/// component, runs one demo inference, and logs the settled result. Not a
/// server — there is no durable process loop here by design.
pub async fn run_node(config_path: PathBuf) -> Result<()> {
    init_logging();
    let cfg = MeshConfig::load(&config_path)?;
    info!(?config_path, "starting mesh node");

    let index = Arc::new(ExpertIndex::new(cfg.dimensions, IndexParams::default()));
    let router = ChunkRouter::new(
        index.clone(),
        Arc::new(HashEmbed {
            dimensions: cfg.dimensions,
        }),
        cfg.max_chunk_length,
    );

    let secret = cfg.hmac_secret_bytes()?;
    let relay_client = RelayClient::new(secret.clone());
    let mut endpoints = HashMap::new();
    let worker_scales = [1.0_f32, 0.5, -1.0];

    let registry = Arc::new(WorkerRegistry::new());
    for (i, scale) in worker_scales.iter().enumerate() {
        let worker_id = format!("worker-{i}");
        let embedding = hash_to_vector(&worker_id, cfg.dimensions);
        index
            .add_expert(worker_id.clone(), &embedding)
            .map_err(|e| anyhow::anyhow!("registering {worker_id}: {e}"))?;

        let compute: Arc<dyn ComputeFn> = Arc::new(ScalingCompute { scale: *scale });
        let server = Arc::new(LayerRangeServer::new(secret.clone(), 0, 2, compute));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener);
        let server_for_task = server.clone();
        tokio::spawn(async move {
            let _ = server_for_task.serve(addr).await;
        });

        registry.register(worker_id.clone(), embedding, addr.to_string());
        endpoints.insert(worker_id, addr);
    }

    let prover = Arc::new(ZkProver::new(cfg.prover_backend())?);
    let verifier = Arc::new(ZkVerifier::from_prover(&prover));

    let ledger = Arc::new(TokenLedger::in_memory());
    let reward_schedule = Arc::new(RewardSchedule::new(
        50.0,
        21_000_000.0,
        cfg.min_reward,
        EpochLength::Fixed(cfg.halving_interval_blocks),
    ));
    let contribution = Arc::new(ContributionTracker::new(ContributionTree::new()));

    let inference = Arc::new(RelayInference {
        endpoints,
        client: relay_client,
        timeout: Duration::from_millis(cfg.relay_timeout_ms),
        retry_backoff: Duration::from_millis(50),
        dimensions: cfg.dimensions,
    });

    let mut model_multipliers = HashMap::new();
    model_multipliers.insert("demo-model".to_string(), 1.0);
    let orchestrator_config = OrchestratorConfig {
        model_multipliers,
        retry_backoff: Some(Duration::from_millis(50)),
        ..OrchestratorConfig::default()
    };

    let orchestrator = Orchestrator::new(
        index,
        router,
        registry,
        prover,
        verifier,
        ledger.clone(),
        reward_schedule,
        contribution,
        inference,
        None,
        orchestrator_config,
    );

    let payer = "demo-payer".to_string();
    ledger.credit(&payer, 1_000.0, TxKind::Mine, serde_json::json!({"reason": "demo funding"}));

    let prompt = "distributed inference across a small mesh of workers";
    let result = orchestrator
        .infer(prompt, &payer, cfg.base_fee * cfg.congestion_multiplier, Some("demo-model"))
        .await
        .map_err(|e| anyhow::anyhow!("demo inference failed: {e}"))?;

    info!(
        response = %result.response,
        block_height = result.block_height,
        block_reward = result.block_reward,
        payer_balance = result.payer_balance,
        "demo inference settled"
    );

    Ok(())
}
